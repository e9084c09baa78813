//! # Cluster operations (recommended entry point)
//!
//! [Orchestrator] runs batch operations over lists of VMs. Each batch holds
//! the hypervisor for its whole duration, handles the VMs one after the
//! other in submission order and never lets the failure of one VM stop the
//! others. Failures are collected and reported once, at the end, as
//! [PilotError::PartialBatch].
//!
//! Creating a VM goes through these steps. A failure removes the output of
//! every step that was started, newest first, even when the failing step
//! wrote part of its output:
//!
//! 1. Create the copy-on-write disk on top of the base image
//! 2. Build the cloud-init image, when `boot_media_path` is set
//! 3. Define the domain (it is not started)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use virtpilot::{connection::ConnectionManager, hypervisor::VirshConnector};
//! use virtpilot::{orchestrator::Orchestrator, template::Templates};
//!
//! let manager = ConnectionManager::new(VirshConnector::default(), "qemu:///system")?;
//! let orchestrator = Orchestrator::new(Arc::new(manager), Arc::new(Templates::builtin()));
//! orchestrator.create_cluster(&specs, &CancellationToken::new())?;
//! orchestrator.start_cluster(&["node-1", "node-2"], &CancellationToken::new())?;
//! ```
use std::{path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    cloud_init::create_boot_media,
    connection::ConnectionManager,
    disk::{backing_format, create_disk},
    error::{ItemFailure, PilotError, Result},
    executor::{remove_file, Execute, LocalExecutor},
    hypervisor::{Connection, Connector, DomainDescriptor, Hypervisor},
    models::{CloneSpec, DiskSpec, VmInfo, VmSpec},
    template::Render,
};

/// What happened to one item of a batch
#[derive(Debug)]
pub enum ItemOutcome {
    Succeeded,
    /// Creation skipped because a domain with that name is already defined
    AlreadyExists,
    Failed(PilotError),
    /// The batch was cancelled before this item was started
    NotStarted,
}

/// Turn the outcome of every item into the result of the batch
fn aggregate(operation: &'static str, outcomes: Vec<(String, ItemOutcome)>) -> Result<()> {
    let mut failed = Vec::new();
    let mut skipped = Vec::new();
    let mut succeeded = 0;
    for (name, outcome) in outcomes {
        match outcome {
            ItemOutcome::Succeeded | ItemOutcome::AlreadyExists => succeeded += 1,
            ItemOutcome::Failed(e) => failed.push(ItemFailure {
                name,
                reason: e.to_string(),
            }),
            ItemOutcome::NotStarted => skipped.push(name),
        }
    }
    info!(
        "{}: {} succeeded, {} failed, {} not started",
        operation,
        succeeded,
        failed.len(),
        skipped.len()
    );

    if !skipped.is_empty() {
        return Err(PilotError::Cancelled {
            operation,
            failed,
            skipped,
        });
    }
    if !failed.is_empty() {
        return Err(PilotError::PartialBatch { operation, failed });
    }
    Ok(())
}

/// Run `step` for every item in order, stopping to start new items once
/// `cancel` fires.
fn run_batch<T, F>(
    operation: &'static str,
    items: &[T],
    name_of: impl Fn(&T) -> String,
    cancel: &CancellationToken,
    mut step: F,
) -> Vec<(String, ItemOutcome)>
where
    F: FnMut(&T) -> Result<ItemOutcome>,
{
    items
        .iter()
        .map(|item| {
            let name = name_of(item);
            if cancel.is_cancelled() {
                return (name, ItemOutcome::NotStarted);
            }
            let outcome = match step(item) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("{} of {} failed: {}", operation, name, e);
                    ItemOutcome::Failed(e)
                }
            };
            (name, outcome)
        })
        .collect()
}

/// Remove the artifacts created for a VM, newest first. Failures are only
/// logged so they do not hide the error that triggered the cleanup.
fn compensate(executor: &dyn Execute, vm: &str, created: &[PathBuf]) {
    for artifact in created.iter().rev() {
        warn!("Removing {} left by failed creation of {}", artifact.display(), vm);
        if let Err(e) = remove_file(executor, &artifact.display().to_string()) {
            warn!("Could not remove {}: {}", artifact.display(), e);
        }
    }
}

/// Cluster level VM lifecycle on a single hypervisor
#[derive(Debug)]
pub struct Orchestrator<K: Connector, E: Execute = LocalExecutor> {
    manager: Arc<ConnectionManager<K, E>>,
    templates: Arc<dyn Render>,
}

impl<K: Connector, E: Execute> Orchestrator<K, E> {
    pub fn new(manager: Arc<ConnectionManager<K, E>>, templates: Arc<dyn Render>) -> Self {
        Orchestrator { manager, templates }
    }

    /// Create disk, boot media and domain of every VM that does not exist
    /// yet. VMs already defined are skipped, not modified.
    #[instrument(skip_all, fields(count = specs.len()))]
    pub fn create_cluster(&self, specs: &[VmSpec], cancel: &CancellationToken) -> Result<()> {
        let guard = self.manager.acquire()?;
        let ctx = guard.context();
        let hypervisor = Hypervisor::new(ctx, self.templates.as_ref());

        let outcomes = run_batch(
            "create",
            specs,
            |spec| spec.name.clone(),
            cancel,
            |spec| {
                if hypervisor.check_exists(&spec.name)? {
                    warn!("Domain {} already exists, skipping", spec.name);
                    return Ok(ItemOutcome::AlreadyExists);
                }
                let mut created = Vec::new();
                match self.provision(&hypervisor, ctx.executor, spec, &mut created) {
                    Ok(()) => Ok(ItemOutcome::Succeeded),
                    Err(e) => {
                        compensate(ctx.executor, &spec.name, &created);
                        Err(e)
                    }
                }
            },
        );
        aggregate("create", outcomes)
    }

    /// Run the creation steps of one VM. The output path of a step is pushed
    /// to `created` before the step runs.
    fn provision<C: Connection>(
        &self,
        hypervisor: &Hypervisor<'_, C>,
        executor: &dyn Execute,
        spec: &VmSpec,
        created: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let instance_id = Uuid::new_v4();
        info!("Creating VM {} ({})", spec.name, instance_id);

        let disk = DiskSpec::from(spec);
        backing_format(&disk)?;
        created.push(spec.disk_path.clone());
        create_disk(executor, &disk)?;

        if let Some(media) = &spec.boot_media_path {
            created.push(media.clone());
            create_boot_media(executor, self.templates.as_ref(), spec, &instance_id, media)?;
        }

        hypervisor.define(spec, &instance_id)
    }

    /// Delete every named VM with its disks
    #[instrument(skip_all, fields(count = names.len()))]
    pub fn delete_cluster<N: AsRef<str>>(
        &self,
        names: &[N],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = self.manager.acquire()?;
        let hypervisor = Hypervisor::new(guard.context(), self.templates.as_ref());

        let outcomes = run_batch(
            "delete",
            names,
            |name| name.as_ref().to_string(),
            cancel,
            |name| {
                let uuid = hypervisor.delete(name.as_ref())?;
                info!("Deleted {} ({})", name.as_ref(), uuid);
                Ok(ItemOutcome::Succeeded)
            },
        );
        aggregate("delete", outcomes)
    }

    /// Start every named VM
    #[instrument(skip_all, fields(count = names.len()))]
    pub fn start_cluster<N: AsRef<str>>(
        &self,
        names: &[N],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = self.manager.acquire()?;
        let hypervisor = Hypervisor::new(guard.context(), self.templates.as_ref());

        let outcomes = run_batch(
            "start",
            names,
            |name| name.as_ref().to_string(),
            cancel,
            |name| {
                hypervisor.start(name.as_ref())?;
                Ok(ItemOutcome::Succeeded)
            },
        );
        aggregate("start", outcomes)
    }

    /// Describe the named VMs, or every VM when `names` is empty.
    ///
    /// The VMs that could be read are returned even when some lookups failed,
    /// alongside the error naming the failed ones.
    #[instrument(skip_all, fields(count = names.len()))]
    pub fn query_cluster<N: AsRef<str>>(
        &self,
        names: &[N],
        cancel: &CancellationToken,
    ) -> (Vec<VmInfo>, Result<()>) {
        let guard = match self.manager.acquire() {
            Ok(guard) => guard,
            Err(e) => return (Vec::new(), Err(e)),
        };
        let hypervisor = Hypervisor::new(guard.context(), self.templates.as_ref());

        if names.is_empty() {
            return match hypervisor.list_all() {
                Ok(infos) => (infos, Ok(())),
                Err(e) => (Vec::new(), Err(e)),
            };
        }

        let mut infos = Vec::new();
        let outcomes = run_batch(
            "query",
            names,
            |name| name.as_ref().to_string(),
            cancel,
            |name| {
                infos.push(hypervisor.get_info(name.as_ref())?);
                Ok(ItemOutcome::Succeeded)
            },
        );
        (infos, aggregate("query", outcomes))
    }

    /// Create each target as a copy of `base`, backed by the disk of `base`
    #[instrument(skip(self, targets, cancel), fields(count = targets.len()))]
    pub fn clone_cluster(
        &self,
        base: &str,
        targets: &[CloneSpec],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = self.manager.acquire()?;
        let ctx = guard.context();
        let hypervisor = Hypervisor::new(ctx, self.templates.as_ref());

        let base_descriptor = hypervisor.descriptor(base)?;
        let base_image = resolve_base_image(&base_descriptor, base)?;
        info!("Cloning {} backed by {}", base, base_image.display());

        let outcomes = run_batch(
            "clone",
            targets,
            |target| target.name.clone(),
            cancel,
            |target| {
                if hypervisor.check_exists(&target.name)? {
                    warn!("Domain {} already exists, skipping", target.name);
                    return Ok(ItemOutcome::AlreadyExists);
                }
                let mut target = target.clone();
                target.base_image = Some(base_image.clone());

                let disk = DiskSpec {
                    path: target.disk_path.clone(),
                    size_gb: target.disk_size_gb,
                    backing_file: base_image.clone(),
                };
                let cloned = create_disk(ctx.executor, &disk).and_then(|()| {
                    hypervisor.clone_domain(&base_descriptor, &target, &Uuid::new_v4())
                });
                if let Err(e) = cloned {
                    compensate(ctx.executor, &target.name, &[disk.path]);
                    return Err(e);
                }
                Ok(ItemOutcome::Succeeded)
            },
        );
        aggregate("clone", outcomes)
    }
}

/// Backing file of the base VM, its first qcow2 disk
fn resolve_base_image(descriptor: &DomainDescriptor, base: &str) -> Result<PathBuf> {
    descriptor
        .first_qcow2_source()
        .map(PathBuf::from)
        .ok_or_else(|| PilotError::Validation(format!("base VM {} has no qcow2 disk", base)))
}
