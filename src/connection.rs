//! # Hypervisor connection ownership
//!
//! The [ConnectionManager] owns the only hypervisor connection of the
//! process and the local executor paired with it. Cluster operations take
//! exclusive access with [ConnectionManager::acquire] for their whole
//! duration; the lock is released when the returned [HypervisorGuard] is
//! dropped.
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, instrument, warn};

use crate::{
    error::Result,
    executor::{Execute, LocalExecutor},
    hypervisor::{Connection, Connector, HypervisorContext},
};

#[derive(Debug)]
struct Held<C, E> {
    connection: C,
    executor: E,
}

/// Single shared hypervisor connection behind a mutex
#[derive(Debug)]
pub struct ConnectionManager<K: Connector, E: Execute = LocalExecutor> {
    connector: K,
    uri: String,
    held: Mutex<Held<K::Connection, E>>,
}

/// Exclusive access to the hypervisor, released on drop
#[derive(Debug)]
pub struct HypervisorGuard<'a, C: Connection, E: Execute> {
    held: MutexGuard<'a, Held<C, E>>,
    uri: &'a str,
}

impl<'a, C: Connection, E: Execute> HypervisorGuard<'a, C, E> {
    /// Connection, executor and URI, valid while the guard is alive
    pub fn context(&self) -> HypervisorContext<'_, C> {
        HypervisorContext {
            connection: &self.held.connection,
            executor: &self.held.executor,
            uri: self.uri,
        }
    }
}

impl<K: Connector> ConnectionManager<K, LocalExecutor> {
    /// Connect to `uri`, a failure here is fatal for the manager
    pub fn new(connector: K, uri: &str) -> Result<Self> {
        Self::with_executor(connector, uri, LocalExecutor::new())
    }
}

impl<K: Connector, E: Execute> ConnectionManager<K, E> {
    pub fn with_executor(connector: K, uri: &str, executor: E) -> Result<Self> {
        let connection = connector.connect(uri)?;
        info!("Connected to hypervisor at {}", uri);
        Ok(ConnectionManager {
            connector,
            uri: uri.to_string(),
            held: Mutex::new(Held {
                connection,
                executor,
            }),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Wait for exclusive access, reconnecting first if the held connection
    /// is dead. On reconnect failure the lock is released before returning.
    #[instrument(skip(self), fields(uri = %self.uri))]
    pub fn acquire(&self) -> Result<HypervisorGuard<'_, K::Connection, E>> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| {
            warn!("Hypervisor lock was poisoned, recovering");
            poisoned.into_inner()
        });

        if !held.connection.is_alive() {
            warn!("Hypervisor connection is dead, reconnecting");
            if let Err(e) = held.connection.close() {
                debug!("Closing dead connection failed: {}", e);
            }
            held.connection = self.connector.connect(&self.uri)?;
            info!("Reconnected to hypervisor at {}", self.uri);
        }

        Ok(HypervisorGuard {
            held,
            uri: &self.uri,
        })
    }
}
