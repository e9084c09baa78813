use std::{
    env::{split_paths, var, var_os},
    path::PathBuf,
};

use crate::{
    builder::{Builder, BuilderError},
    connection::ConnectionManager,
    error::Result,
    hypervisor::VirshConnector,
};

use super::assert_not_none;

/// URI used when `LIBVIRT_DEFAULT_URI` is not set
pub const DEFAULT_URI: &str = "qemu:///system";

/// Connector and URI of the hypervisor to manage
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    pub connector: VirshConnector,
    pub uri: String,
}

impl HypervisorConfig {
    /// Open the connection, see [ConnectionManager::new]
    pub fn connect(self) -> Result<ConnectionManager<VirshConnector>> {
        ConnectionManager::new(self.connector, &self.uri)
    }
}

#[derive(Debug, Default)]
pub struct VirshConnectorBuilder {
    virsh_binary: Option<PathBuf>,
    uri: Option<String>,
}

impl VirshConnectorBuilder {
    pub fn new() -> VirshConnectorBuilder {
        VirshConnectorBuilder::default()
    }

    /// Tries to find `virsh` in the directories of the `$PATH` variable
    fn find_binary_from_path() -> Option<PathBuf> {
        var_os("PATH").and_then(|paths| {
            split_paths(&paths)
                .map(|d| d.join("virsh"))
                .find(|full_path| full_path.is_file())
        })
    }

    fn find_binary_from_current_directory() -> Option<PathBuf> {
        let full_path = PathBuf::from("./virsh");
        match full_path.is_file() {
            true => Some(full_path),
            false => None,
        }
    }

    /// Tries the path given by `VIRSH_LOCATION`, warning when it points to
    /// nothing
    fn find_binary_from_env_location() -> Option<PathBuf> {
        if let Some(path) = var_os("VIRSH_LOCATION") {
            if PathBuf::from(&path).is_file() {
                return Some(PathBuf::from(path));
            }

            log::warn!(
                "VIRSH_LOCATION is set but the file does not exist: {:?}",
                path
            );
        }
        None
    }

    /// Tries to determine the `virsh` binary location from several sources
    /// (top to bottom priority):
    ///
    /// - `VIRSH_LOCATION` environment variable: direct path to the binary
    /// - `$PATH` environment variable: search for the binary in the directories
    /// - `virsh` binary in the current working directory
    pub fn determine_binary_location() -> Result<PathBuf, BuilderError> {
        Self::find_binary_from_env_location()
            .or_else(Self::find_binary_from_path)
            .or_else(Self::find_binary_from_current_directory)
            .ok_or_else(|| {
                BuilderError::BinaryNotFound(
                    "virsh not found, set VIRSH_LOCATION or add it to $PATH".to_string(),
                )
            })
    }

    /// Hypervisor URI from `LIBVIRT_DEFAULT_URI`, [DEFAULT_URI] otherwise
    pub fn determine_uri() -> String {
        match var("LIBVIRT_DEFAULT_URI") {
            Ok(uri) if !uri.trim().is_empty() => uri,
            Ok(_) => {
                log::warn!("LIBVIRT_DEFAULT_URI is empty, using {}", DEFAULT_URI);
                DEFAULT_URI.to_string()
            }
            Err(_) => DEFAULT_URI.to_string(),
        }
    }

    /// Builder with the binary and URI found in the environment
    pub fn auto() -> Result<VirshConnectorBuilder, BuilderError> {
        let binary_path = Self::determine_binary_location()?;
        Ok(Self::new()
            .with_virsh_binary(binary_path)
            .with_uri(Self::determine_uri()))
    }

    pub fn with_virsh_binary(mut self, virsh_binary: PathBuf) -> VirshConnectorBuilder {
        self.virsh_binary = Some(virsh_binary);
        self
    }

    pub fn with_uri(mut self, uri: String) -> VirshConnectorBuilder {
        self.uri = Some(uri);
        self
    }
}

impl Builder<HypervisorConfig> for VirshConnectorBuilder {
    fn try_build(self) -> Result<HypervisorConfig, BuilderError> {
        assert_not_none(stringify!(self.virsh_binary), &self.virsh_binary)?;
        assert_not_none(stringify!(self.uri), &self.uri)?;
        let uri = self.uri.unwrap_or_default();
        url::Url::parse(&uri)
            .map_err(|e| BuilderError::InvalidValue(format!("invalid URI {}: {}", uri, e)))?;

        Ok(HypervisorConfig {
            connector: VirshConnector {
                virsh_binary: self.virsh_binary.unwrap_or_default(),
            },
            uri,
        })
    }
}
