//! Remote access to hosts and Kubernetes workloads.
//!
//! The core never talks to a cluster or a host directly; everything remote
//! goes through [`RemoteAccess`]. [`kubectl::Kubectl`] is the production
//! implementation.

pub mod kubectl;

use crate::location::{Location, PodRef};
use crate::utils::errors::{Error, Result};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte source returned by [`RemoteAccess::open_read`].
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink returned by [`RemoteAccess::open_write`]. Callers must
/// `shutdown()` it to commit the write.
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The narrow set of remote operations the orchestrator depends on.
///
/// Locations passed in are always concrete (Host or Pod); StatefulSets are
/// expanded by the caller through [`RemoteAccess::replica_count`].
pub trait RemoteAccess: Send + Sync {
    /// Entry names inside a remote directory.
    fn list_dir<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Size in bytes of a remote file.
    fn stat<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<u64>>;

    fn open_read<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<ByteReader>>;

    fn open_write<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<ByteWriter>>;

    /// Number of live replicas of a statefulset.
    fn replica_count<'a>(&'a self, set: &'a PodRef) -> BoxFuture<'a, Result<usize>>;
}

/// Shared handle; `None` means no remote collaborator was configured.
pub type SharedAccess = Option<Arc<dyn RemoteAccess>>;

/// Resolve the collaborator needed for `location`, failing when absent.
pub fn require<'a>(access: &'a SharedAccess, location: &Location) -> Result<&'a dyn RemoteAccess> {
    access.as_deref().ok_or_else(|| {
        Error::Configuration(format!(
            "{location} needs remote access but none is configured"
        ))
    })
}
