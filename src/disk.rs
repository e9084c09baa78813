//! Copy-on-write disk creation with `qemu-img`.
use tracing::{info, instrument};

use crate::{
    error::{PilotError, Result},
    executor::{run_captured, Execute},
    models::DiskSpec,
};

pub const QEMU_IMG: &str = "qemu-img";
/// Format of every disk created, whatever the backing file
pub const DISK_FORMAT: &str = "qcow2";

/// Image format of the backing file, derived from its extension
pub fn backing_format(spec: &DiskSpec) -> Result<&'static str> {
    match spec.backing_file.extension().and_then(|e| e.to_str()) {
        Some("qcow2") => Ok("qcow2"),
        other => Err(PilotError::Validation(format!(
            "unsupported backing image format {:?} for {}, only .qcow2 is supported",
            other.unwrap_or(""),
            spec.backing_file.display()
        ))),
    }
}

/// Arguments of the `qemu-img` call creating `spec`
pub fn create_disk_args(spec: &DiskSpec) -> Result<Vec<String>> {
    let backing_format = backing_format(spec)?;
    Ok(vec![
        "create".to_string(),
        "-b".to_string(),
        spec.backing_file.display().to_string(),
        "-F".to_string(),
        backing_format.to_string(),
        "-f".to_string(),
        DISK_FORMAT.to_string(),
        spec.path.display().to_string(),
        format!("{}G", spec.size_gb),
    ])
}

/// Create the disk of a VM on top of its backing file
#[instrument(skip_all, fields(disk = %spec.path.display()))]
pub fn create_disk(executor: &dyn Execute, spec: &DiskSpec) -> Result<()> {
    let args = create_disk_args(spec)?;
    info!(
        "Creating {}G disk backed by {}",
        spec.size_gb,
        spec.backing_file.display()
    );
    run_captured(executor, QEMU_IMG, &args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingExecutor;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn spec(backing: &str) -> DiskSpec {
        DiskSpec {
            path: PathBuf::from("/var/lib/libvirt/images/node-1.qcow2"),
            size_gb: 10,
            backing_file: PathBuf::from(backing),
        }
    }

    #[test]
    fn builds_qemu_img_command() {
        let executor = RecordingExecutor::new();
        create_disk(&executor, &spec("/img/base.qcow2")).unwrap();
        assert_eq!(
            executor.commands(),
            vec!["qemu-img create -b /img/base.qcow2 -F qcow2 -f qcow2 /var/lib/libvirt/images/node-1.qcow2 10G"]
        );
        assert!(executor.has_file("/var/lib/libvirt/images/node-1.qcow2"));
    }

    #[test]
    fn rejects_other_backing_formats() {
        let executor = RecordingExecutor::new();
        for backing in ["/img/base.raw", "/img/base.img", "/img/base"] {
            let err = create_disk(&executor, &spec(backing)).unwrap_err();
            assert!(matches!(err, PilotError::Validation(_)));
        }
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn command_failure_is_an_execute_error() {
        let executor = RecordingExecutor::new().failing_on("qemu-img");
        let err = create_disk(&executor, &spec("/img/base.qcow2")).unwrap_err();
        assert!(matches!(err, PilotError::Execute(_)));
    }
}
