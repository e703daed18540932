//! Utility modules shared across workflows.

pub mod errors;
pub mod logger;

pub use errors::{Error, Result};
