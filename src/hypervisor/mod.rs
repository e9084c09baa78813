//! # Hypervisor access
//!
//! [Connection] is the handle on a hypervisor: domain lookup, definition,
//! state changes and lease information. [Connector] opens new connections,
//! it is what the [ConnectionManager](crate::connection::ConnectionManager)
//! calls when the held connection is found dead.
//!
//! [Hypervisor] implements the domain level operations (define, start,
//! inspect, delete, clone) on top of a [HypervisorContext], the connection
//! and the executor borrowed for the duration of one cluster operation.
use std::{fmt::Debug, net::IpAddr};

use uuid::Uuid;

use crate::{error::Result, executor::Execute, models::DomainState};

pub mod descriptor;
mod manager;
mod virsh;

pub use descriptor::DomainDescriptor;
pub use manager::Hypervisor;
pub use virsh::{VirshConnection, VirshConnector};

/// Address reported for one of the domain network interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: String,
    pub address: IpAddr,
}

/// Open handle on a hypervisor. Domains are addressed by name.
///
/// Lookups of a domain that does not exist must fail with
/// [PilotError::NotFound](crate::error::PilotError::NotFound).
pub trait Connection: Debug + Send {
    fn uri(&self) -> &str;

    /// Whether the connection can still be used
    fn is_alive(&self) -> bool;

    fn close(&mut self) -> Result<()>;

    /// Names of every defined domain, active or not
    fn list_domains(&self) -> Result<Vec<String>>;

    /// Find a domain and return its UUID
    fn lookup(&self, name: &str) -> Result<Uuid>;

    fn state(&self, name: &str) -> Result<DomainState>;

    /// Full XML description of the domain
    fn xml_desc(&self, name: &str) -> Result<String>;

    /// Register a domain without starting it
    fn define_xml(&self, xml: &str) -> Result<()>;

    /// Start a defined domain
    fn create(&self, name: &str) -> Result<()>;

    /// Stop a running domain immediately
    fn destroy(&self, name: &str) -> Result<()>;

    fn undefine(&self, name: &str) -> Result<()>;

    fn autostart(&self, name: &str) -> Result<bool>;

    fn persistent(&self, name: &str) -> Result<bool>;

    /// Hostname from the DHCP lease of the domain
    fn lease_hostname(&self, name: &str) -> Result<String>;

    /// Addresses from the DHCP leases of the domain interfaces
    fn interface_addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>>;

    /// Capacity in bytes of the disk backed by `path`
    fn block_capacity(&self, name: &str, path: &str) -> Result<u64>;
}

/// Opens connections to a hypervisor URI
pub trait Connector: Debug + Send + Sync {
    type Connection: Connection;

    fn connect(&self, uri: &str) -> Result<Self::Connection>;
}

/// Everything a hypervisor operation needs, borrowed from the
/// [ConnectionManager](crate::connection::ConnectionManager) while its lock
/// is held.
#[derive(Debug)]
pub struct HypervisorContext<'a, C: Connection> {
    pub connection: &'a C,
    pub executor: &'a dyn Execute,
    pub uri: &'a str,
}

impl<'a, C: Connection> Clone for HypervisorContext<'a, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, C: Connection> Copy for HypervisorContext<'a, C> {}
