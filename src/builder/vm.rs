use std::path::PathBuf;

use crate::{
    builder::{Builder, BuilderError},
    models::{BindMount, NetworkConfig, Tuning, UserConfig, VmSpec},
};

use super::assert_not_none;

/// Assembles a [VmSpec]. Name, CPU, memory, disk, base image and bridge
/// are required, everything else defaults to nothing.
#[derive(Debug, Default)]
pub struct VmSpecBuilder {
    name: Option<String>,
    vcpus: Option<u32>,
    memory_mb: Option<u64>,
    disk_path: Option<PathBuf>,
    disk_size_gb: Option<u64>,
    base_image: Option<PathBuf>,
    bridge: Option<String>,
    boot_media_path: Option<PathBuf>,
    mounts: Vec<BindMount>,
    role: String,
    package_update: bool,
    package_upgrade: bool,
    commands: Vec<String>,
    users: Vec<UserConfig>,
    network: Option<NetworkConfig>,
    tuning: Option<Tuning>,
}

impl VmSpecBuilder {
    pub fn new() -> VmSpecBuilder {
        VmSpecBuilder::default()
    }

    pub fn with_name(mut self, name: String) -> VmSpecBuilder {
        self.name = Some(name);
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> VmSpecBuilder {
        self.vcpus = Some(vcpus);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> VmSpecBuilder {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Path and size of the copy-on-write disk created for the VM
    pub fn with_disk(mut self, path: PathBuf, size_gb: u64) -> VmSpecBuilder {
        self.disk_path = Some(path);
        self.disk_size_gb = Some(size_gb);
        self
    }

    pub fn with_base_image(mut self, base_image: PathBuf) -> VmSpecBuilder {
        self.base_image = Some(base_image);
        self
    }

    pub fn with_bridge(mut self, bridge: String) -> VmSpecBuilder {
        self.bridge = Some(bridge);
        self
    }

    /// Build a cloud-init image at `path` and attach it to the VM
    pub fn with_boot_media(mut self, path: PathBuf) -> VmSpecBuilder {
        self.boot_media_path = Some(path);
        self
    }

    pub fn with_mount(mut self, source: PathBuf, target: String) -> VmSpecBuilder {
        self.mounts.push(BindMount { source, target });
        self
    }

    pub fn with_role(mut self, role: String) -> VmSpecBuilder {
        self.role = role;
        self
    }

    pub fn with_package_update(mut self) -> VmSpecBuilder {
        self.package_update = true;
        self
    }

    pub fn with_package_upgrade(mut self) -> VmSpecBuilder {
        self.package_upgrade = true;
        self
    }

    pub fn with_command(mut self, command: String) -> VmSpecBuilder {
        self.commands.push(command);
        self
    }

    pub fn with_user(mut self, user: UserConfig) -> VmSpecBuilder {
        self.users.push(user);
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> VmSpecBuilder {
        self.network = Some(network);
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> VmSpecBuilder {
        self.tuning = Some(tuning);
        self
    }
}

fn assert_positive(key: &str, value: Option<u64>) -> Result<u64, BuilderError> {
    match value {
        Some(0) => Err(BuilderError::InvalidValue(format!("{} must be positive", key))),
        Some(v) => Ok(v),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

impl Builder<VmSpec> for VmSpecBuilder {
    fn try_build(self) -> Result<VmSpec, BuilderError> {
        assert_not_none(stringify!(self.name), &self.name)?;
        assert_not_none(stringify!(self.disk_path), &self.disk_path)?;
        assert_not_none(stringify!(self.base_image), &self.base_image)?;
        assert_not_none(stringify!(self.bridge), &self.bridge)?;
        let vcpus = assert_positive(stringify!(self.vcpus), self.vcpus.map(u64::from))?;
        let memory_mb = assert_positive(stringify!(self.memory_mb), self.memory_mb)?;
        let disk_size_gb = assert_positive(stringify!(self.disk_size_gb), self.disk_size_gb)?;

        let name = self.name.unwrap_or_default();
        if name.trim().is_empty() {
            return Err(BuilderError::InvalidValue("name must not be empty".to_string()));
        }

        Ok(VmSpec {
            name,
            vcpus: vcpus as u32,
            memory_mb,
            disk_path: self.disk_path.unwrap_or_default(),
            disk_size_gb,
            base_image: self.base_image.unwrap_or_default(),
            bridge: self.bridge.unwrap_or_default(),
            boot_media_path: self.boot_media_path,
            mounts: self.mounts,
            role: self.role,
            package_update: self.package_update,
            package_upgrade: self.package_upgrade,
            commands: self.commands,
            users: self.users,
            network: self.network,
            tuning: self.tuning,
        })
    }
}
