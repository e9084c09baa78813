use std::net::IpAddr;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{PilotError, Result},
    executor::remove_file,
    models::{CloneSpec, DomainState, ResolvedTuning, VmInfo, VmSpec},
    template::{Render, TemplateVars, DOMAIN_TEMPLATE},
};

use super::{
    descriptor::{cputune_fragment, numatune_fragment, xml_escape},
    Connection, DomainDescriptor, HypervisorContext,
};

/// Domain level operations against the hypervisor of a [HypervisorContext]
#[derive(Debug)]
pub struct Hypervisor<'a, C: Connection> {
    ctx: HypervisorContext<'a, C>,
    templates: &'a dyn Render,
}

/// Variables of the domain descriptor template, every value is XML escaped
pub(crate) fn domain_vars(spec: &VmSpec, uuid: &Uuid, tuning: &ResolvedTuning) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("name".to_string(), xml_escape(&spec.name));
    vars.insert("uuid".to_string(), uuid.to_string());
    vars.insert("vcpus".to_string(), spec.vcpus.to_string());
    vars.insert("memory_mb".to_string(), spec.memory_mb.to_string());
    vars.insert(
        "memory_kib".to_string(),
        (spec.memory_mb * 1024).to_string(),
    );
    vars.insert(
        "disk_path".to_string(),
        xml_escape(&spec.disk_path.display().to_string()),
    );
    vars.insert("bridge".to_string(), xml_escape(&spec.bridge));
    vars.insert("role".to_string(), xml_escape(&spec.role));
    vars.insert("cputune".to_string(), cputune_fragment(tuning));
    vars.insert("numatune".to_string(), numatune_fragment(tuning));

    let boot_media = match &spec.boot_media_path {
        Some(path) => format!(
            "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='sda' bus='sata'/>\n      <readonly/>\n    </disk>\n",
            xml_escape(&path.display().to_string())
        ),
        None => String::new(),
    };
    vars.insert("boot_media".to_string(), boot_media);

    let filesystems: String = spec
        .mounts
        .iter()
        .map(|mount| {
            format!(
                "    <filesystem type='mount' accessmode='mapped'>\n      <source dir='{}'/>\n      <target dir='{}'/>\n    </filesystem>\n",
                xml_escape(&mount.source.display().to_string()),
                xml_escape(&mount.target)
            )
        })
        .collect();
    vars.insert("filesystems".to_string(), filesystems);
    vars
}

impl<'a, C: Connection> Hypervisor<'a, C> {
    pub fn new(ctx: HypervisorContext<'a, C>, templates: &'a dyn Render) -> Self {
        Hypervisor { ctx, templates }
    }

    /// Render the domain descriptor of `spec` and register it, the domain is
    /// left stopped.
    #[instrument(skip(self, spec), fields(vm = %spec.name))]
    pub fn define(&self, spec: &VmSpec, uuid: &Uuid) -> Result<()> {
        let tuning = match &spec.tuning {
            Some(tuning) => tuning.resolve(spec.vcpus)?,
            None => ResolvedTuning::default(),
        };
        let xml = self
            .templates
            .render(DOMAIN_TEMPLATE, &domain_vars(spec, uuid, &tuning))?;
        debug!("Defining domain {} on {}", spec.name, self.ctx.uri);
        self.ctx.connection.define_xml(&xml)?;
        info!("Domain {} defined", spec.name);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn start(&self, name: &str) -> Result<()> {
        self.ctx.connection.lookup(name)?;
        self.ctx.connection.create(name)?;
        info!("Domain {} started", name);
        Ok(())
    }

    /// `false` only when the domain does not exist, other lookup failures
    /// are errors.
    pub fn check_exists(&self, name: &str) -> Result<bool> {
        match self.ctx.connection.lookup(name) {
            Ok(_) => Ok(true),
            Err(PilotError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn descriptor(&self, name: &str) -> Result<DomainDescriptor> {
        let xml = self.ctx.connection.xml_desc(name)?;
        DomainDescriptor::parse(&xml)
    }

    #[instrument(skip(self))]
    pub fn get_info(&self, name: &str) -> Result<VmInfo> {
        let connection = self.ctx.connection;
        let uuid = connection.lookup(name)?;
        let state = connection.state(name)?;
        let descriptor = self.descriptor(name)?;

        let mut disks = descriptor.disks();
        for disk in disks.iter_mut() {
            match connection.block_capacity(name, &disk.path) {
                Ok(size) => disk.size_bytes = Some(size),
                Err(e) => warn!("Could not read size of {}: {}", disk.path, e),
            }
        }

        let autostart = connection.autostart(name).unwrap_or_else(|e| {
            warn!("Could not read autostart flag of {}: {}", name, e);
            false
        });
        let persistent = connection.persistent(name).unwrap_or_else(|e| {
            warn!("Could not read persistence flag of {}: {}", name, e);
            false
        });

        let mut hostname = None;
        let mut ip = None;
        if state == DomainState::Running {
            match connection.lease_hostname(name) {
                Ok(h) if !h.is_empty() => hostname = Some(h),
                Ok(_) => {}
                Err(e) => warn!("Could not read lease hostname of {}: {}", name, e),
            }
            match connection.interface_addresses(name) {
                Ok(addresses) => {
                    ip = addresses.iter().find_map(|a| match a.address {
                        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
                        _ => None,
                    })
                }
                Err(e) => warn!("Could not read addresses of {}: {}", name, e),
            }
        }

        Ok(VmInfo {
            name: name.to_string(),
            uuid,
            state,
            vcpus: descriptor.vcpus()?,
            memory_mb: descriptor.memory_kib()? / 1024,
            disks,
            autostart,
            persistent,
            hostname,
            ip,
        })
    }

    /// Every domain, active or not. Domains that cannot be read are skipped.
    #[instrument(skip(self))]
    pub fn list_all(&self) -> Result<Vec<VmInfo>> {
        let names = self.ctx.connection.list_domains()?;
        Ok(names
            .iter()
            .filter_map(|name| match self.get_info(name) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("Skipping domain {}: {}", name, e);
                    None
                }
            })
            .collect())
    }

    /// Remove the disks of the domain, stop it when running and undefine it.
    ///
    /// The UUID of the domain is returned even if removing a disk failed.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str) -> Result<Uuid> {
        let connection = self.ctx.connection;
        connection.lookup(name)?;
        let descriptor = self.descriptor(name)?;
        let uuid = descriptor.uuid()?;

        for disk in descriptor.disks() {
            debug!("Removing disk {}", disk.path);
            if let Err(e) = remove_file(self.ctx.executor, &disk.path) {
                warn!("Could not remove disk {} of {}: {}", disk.path, name, e);
            }
        }

        if connection.state(name)? != DomainState::Shutoff {
            connection.destroy(name)?;
        }
        connection.undefine(name)?;
        info!("Domain {} ({}) deleted", name, uuid);
        Ok(uuid)
    }

    /// Define a copy of `base` with the identity, sizing and disk of `target`
    #[instrument(skip(self, base, target), fields(vm = %target.name))]
    pub fn clone_domain(
        &self,
        base: &DomainDescriptor,
        target: &CloneSpec,
        uuid: &Uuid,
    ) -> Result<()> {
        let mut descriptor = base.clone();
        descriptor.set_name(&target.name);
        descriptor.set_uuid(uuid);
        descriptor.set_vcpus(target.vcpus);
        descriptor.set_memory_kib(target.memory_mb * 1024);
        descriptor.set_first_qcow2_source(&target.disk_path.display().to_string())?;

        self.ctx.connection.define_xml(&descriptor.to_xml()?)?;
        info!("Domain {} cloned", target.name);
        Ok(())
    }
}
