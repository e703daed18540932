//! env-restore library
//!
//! Snapshot, copy and restore orchestration for stateful services spread
//! over local disk, bare hosts and Kubernetes pods/statefulsets.

pub mod access;
pub mod archive;
pub mod config;
pub mod location;
pub mod orchestrator;
pub mod service;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Error, Result};
