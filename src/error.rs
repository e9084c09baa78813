use std::fmt;

use crate::{builder::BuilderError, executor::ExecuteError};

/// Failure of a single item inside a batch operation, kept so the aggregate
/// error can tell which VM failed and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub name: String,
    pub reason: String,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.reason)
    }
}

fn names(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(thiserror::Error, Debug)]
pub enum PilotError {
    /// The named domain is not defined on the hypervisor
    #[error("Domain {0} not found")]
    NotFound(String),
    /// Input rejected before anything was created
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("Could not connect to hypervisor at {uri}, reason: {reason}")]
    Connection { uri: String, reason: String },
    /// Some items of a batch failed, the others were left in place
    #[error("{operation} failed for: {}", names(.failed))]
    PartialBatch {
        operation: &'static str,
        failed: Vec<ItemFailure>,
    },
    /// The batch was cancelled before every item could be started
    #[error("{operation} cancelled, {} item(s) not started", .skipped.len())]
    Cancelled {
        operation: &'static str,
        failed: Vec<ItemFailure>,
        skipped: Vec<String>,
    },
    #[error("Could not render template {name}, reason: {reason}")]
    Template { name: String, reason: String },
    #[error("Malformed domain descriptor: {0}")]
    Descriptor(String),
    #[error("Hypervisor call failed: {0}")]
    Hypervisor(String),
    #[error("Bootstrap of node {node} failed: {source}")]
    Bootstrap {
        node: String,
        #[source]
        source: Box<PilotError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PilotError {
    /// Names of the items reported as failed by a batch error
    pub fn failed_items(&self) -> Vec<&str> {
        match self {
            PilotError::PartialBatch { failed, .. } | PilotError::Cancelled { failed, .. } => {
                failed.iter().map(|f| f.name.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<BuilderError> for PilotError {
    fn from(e: BuilderError) -> PilotError {
        match e {
            BuilderError::MissingRequiredField(field) => {
                PilotError::Validation(format!("missing required field {}", field))
            }
            BuilderError::BinaryNotFound(msg) => PilotError::Validation(msg),
            BuilderError::InvalidValue(msg) => PilotError::Validation(msg),
        }
    }
}

pub type Result<T, E = PilotError> = std::result::Result<T, E>;
