//! Error types shared by every workflow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed location or service spec. Fatal, never retried.
    #[error("Invalid spec {spec:?}: {reason}")]
    Validation { spec: String, reason: String },

    /// Remote list/stat/replica lookups that came back empty or failed.
    #[error("Lookup failed for {target}: {reason}")]
    Lookup { target: String, reason: String },

    /// Mid-stream read or write failure, including a failed fan-out replica.
    #[error("Transfer of {file} failed: {reason}")]
    Transfer { file: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RPC {call} to {endpoint} failed: {reason}")]
    Rpc {
        endpoint: String,
        call: String,
        reason: String,
    },

    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn validation(spec: &str, reason: impl Into<String>) -> Self {
        Error::Validation {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub fn lookup(target: impl ToString, reason: impl ToString) -> Self {
        Error::Lookup {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn transfer(file: impl ToString, reason: impl ToString) -> Self {
        Error::Transfer {
            file: file.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
