#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[macro_use]
extern crate serde_derive;

extern crate serde;
extern crate serde_json;
extern crate url;

#[cfg(doctest)]
mod doctests {
    doc_comment::doctest!("../README.md");
}

pub mod bootstrap;
pub mod builder;
pub mod cloud_init;
pub mod connection;
pub mod disk;
pub mod error;
pub mod executor;
pub mod hypervisor;
pub mod models;
pub mod orchestrator;
pub mod template;

#[cfg(test)]
mod testing;

pub use error::{PilotError, Result};
