//! Types describing what to create and what a query reports.
use std::{fmt, net::Ipv4Addr, path::PathBuf, str::FromStr};

use tracing::warn;
use uuid::Uuid;

use crate::error::{PilotError, Result};

/// Desired state of a single VM, consumed once by a cluster operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Unique name of the domain, also used as guest hostname
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    /// Path of the copy-on-write disk created for this VM
    pub disk_path: PathBuf,
    pub disk_size_gb: u64,
    /// Backing image of the disk, only `.qcow2` images are supported
    pub base_image: PathBuf,
    /// Host bridge the VM network interface is attached to
    pub bridge: String,
    /// Where to build the cloud-init image, no image is built when unset
    #[serde(default)]
    pub boot_media_path: Option<PathBuf>,
    #[serde(default)]
    pub mounts: Vec<BindMount>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub package_update: bool,
    #[serde(default)]
    pub package_upgrade: bool,
    /// Commands run once by cloud-init on first boot
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub tuning: Option<Tuning>,
}

/// Host directory exposed to the guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    /// Mount tag seen by the guest
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
}

/// Static addressing handed to the `network-config` template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address with prefix length, e.g. `192.168.122.10/24`
    pub address: String,
    pub gateway: Option<String>,
    #[serde(default)]
    pub nameservers: Vec<String>,
}

/// CPU pinning and NUMA placement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    /// CPU set for each vCPU, by vCPU index
    #[serde(default)]
    pub vcpu_pins: Vec<String>,
    #[serde(default)]
    pub emulator_pin: Option<String>,
    #[serde(default)]
    pub numa: Option<NumaPlacement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaPlacement {
    pub nodeset: String,
    /// One of `strict`, `preferred` or `interleave`, `preferred` when unset
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NumaMode {
    Strict,
    #[default]
    Preferred,
    Interleave,
}

impl NumaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumaMode::Strict => "strict",
            NumaMode::Preferred => "preferred",
            NumaMode::Interleave => "interleave",
        }
    }
}

impl FromStr for NumaMode {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(NumaMode::Strict),
            "preferred" => Ok(NumaMode::Preferred),
            "interleave" => Ok(NumaMode::Interleave),
            other => Err(PilotError::Validation(format!(
                "invalid NUMA mode {}, expected strict, preferred or interleave",
                other
            ))),
        }
    }
}

/// Pinning of one vCPU to a host CPU set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuPin {
    pub vcpu: u32,
    pub cpuset: String,
}

/// [Tuning] checked against the vCPU count of the VM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTuning {
    pub pins: Vec<VcpuPin>,
    pub emulator_pin: Option<String>,
    pub numa: Option<(String, NumaMode)>,
    /// Accepted but suspicious settings
    pub warnings: Vec<String>,
}

impl Tuning {
    /// Validate the tuning for a VM with `vcpus` vCPUs and turn the pin list
    /// into explicit (vCPU, CPU set) pairs.
    pub fn resolve(&self, vcpus: u32) -> Result<ResolvedTuning> {
        if self.vcpu_pins.len() > vcpus as usize {
            return Err(PilotError::Validation(format!(
                "{} vCPU pins given for {} vCPUs",
                self.vcpu_pins.len(),
                vcpus
            )));
        }
        if let Some(empty) = self.vcpu_pins.iter().position(|p| p.trim().is_empty()) {
            return Err(PilotError::Validation(format!(
                "empty CPU set for vCPU {}",
                empty
            )));
        }

        let mut warnings = Vec::new();
        if !self.vcpu_pins.is_empty() && self.vcpu_pins.len() < vcpus as usize {
            let msg = format!(
                "only {} of {} vCPUs are pinned, the others float",
                self.vcpu_pins.len(),
                vcpus
            );
            warn!("{}", msg);
            warnings.push(msg);
        }

        let numa = match &self.numa {
            Some(placement) => {
                let mode = match placement.mode.as_deref() {
                    None | Some("") => NumaMode::default(),
                    Some(mode) => mode.parse()?,
                };
                Some((placement.nodeset.clone(), mode))
            }
            None => None,
        };

        Ok(ResolvedTuning {
            pins: self
                .vcpu_pins
                .iter()
                .enumerate()
                .map(|(vcpu, cpuset)| VcpuPin {
                    vcpu: vcpu as u32,
                    cpuset: cpuset.trim().to_string(),
                })
                .collect(),
            emulator_pin: self.emulator_pin.clone(),
            numa,
            warnings,
        })
    }
}

/// Target of a clone operation. The backing image is not chosen by the
/// caller, it is the disk of the VM being cloned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_path: PathBuf,
    pub disk_size_gb: u64,
    #[serde(skip)]
    pub(crate) base_image: Option<PathBuf>,
}

impl CloneSpec {
    pub fn new(
        name: String,
        vcpus: u32,
        memory_mb: u64,
        disk_path: PathBuf,
        disk_size_gb: u64,
    ) -> CloneSpec {
        CloneSpec {
            name,
            vcpus,
            memory_mb,
            disk_path,
            disk_size_gb,
            base_image: None,
        }
    }

    /// Backing image resolved from the base VM, set during the clone
    pub fn base_image(&self) -> Option<&PathBuf> {
        self.base_image.as_ref()
    }
}

/// Copy-on-write disk to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub path: PathBuf,
    pub size_gb: u64,
    pub backing_file: PathBuf,
}

impl From<&VmSpec> for DiskSpec {
    fn from(spec: &VmSpec) -> Self {
        DiskSpec {
            path: spec.disk_path.clone(),
            size_gb: spec.disk_size_gb,
            backing_file: spec.base_image.clone(),
        }
    }
}

/// State of a domain, anything the hypervisor reports that is not listed
/// here becomes [DomainState::Unknown]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    /// Map the state names printed by `virsh domstate`
    pub fn from_virsh(state: &str) -> DomainState {
        match state.trim() {
            "no state" => DomainState::NoState,
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" => DomainState::Shutdown,
            "shut off" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub path: String,
    /// Image format from the disk driver, e.g. `qcow2` or `raw`
    pub format: String,
    /// `disk` or `cdrom`
    pub device: String,
    /// Capacity in bytes, when the hypervisor could tell
    pub size_bytes: Option<u64>,
}

/// Snapshot of a domain, built fresh on every query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub uuid: Uuid,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disks: Vec<DiskInfo>,
    pub autostart: bool,
    pub persistent: bool,
    /// Only known while running and holding a DHCP lease
    pub hostname: Option<String>,
    pub ip: Option<Ipv4Addr>,
}
