//! # Configuration builders
//!
//! Every configuration object can be assembled field by field with a
//! builder. All fields are optional while building and are validated once
//! [`Builder::try_build`] runs; a successful build can be handed as is to
//! the orchestrator, the bootstrap coordinator or the connection manager.
//!
//! ## Example
//!
//! ```rust
//! use std::path::PathBuf;
//! use virtpilot::builder::{Builder, node::NodeBuilder, vm::VmSpecBuilder};
//!
//! let spec = VmSpecBuilder::new()
//!     .with_name("node-1".to_string())
//!     .with_vcpus(2)
//!     .with_memory_mb(2048)
//!     .with_disk(PathBuf::from("/var/lib/libvirt/images/node-1.qcow2"), 20)
//!     .with_base_image(PathBuf::from("/var/lib/libvirt/images/base.qcow2"))
//!     .with_bridge("br0".to_string())
//!     .with_role("master".to_string())
//!     .try_build()
//!     .unwrap();
//!
//! let node = NodeBuilder::new()
//!     .with_host("192.168.122.10".to_string())
//!     .with_user("ops".to_string())
//!     .with_key_path(PathBuf::from("~/.ssh/id_ed25519"))
//!     .try_build()
//!     .unwrap();
//! assert_eq!(node.hostname, "192.168.122.10");
//! ```
pub mod connector;
pub mod node;
pub mod vm;

fn assert_not_none<T>(key: &str, value: &Option<T>) -> Result<(), BuilderError> {
    match value {
        Some(_) => Ok(()),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    MissingRequiredField(String),
    /// Happens when using auto methods to detect the virsh binary
    BinaryNotFound(String),
    /// The field was provided but its value cannot be used
    InvalidValue(String),
}

/// Generic trait which all builders implement
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply them to the
    /// final object
    fn try_build(self) -> Result<T, BuilderError>;
}
