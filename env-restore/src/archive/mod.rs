//! Archives: per-service inventories of timestamped backup files.
//!
//! An [`Archive`] is one storage location holding `<RFC3339>.bak` files for
//! one logical service. An [`ArchiveSet`] groups the archives of a whole
//! environment and drives snapshot selection (see [`selector`]).

pub mod filter;
pub mod local;
pub mod selector;

use crate::access::{self, SharedAccess};
use crate::location::Location;
use crate::utils::errors::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{stream, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

pub use filter::TimeFilter;
pub use selector::{ArchiveFileSet, Snapshots};

/// Extension every backup file carries.
pub const BACKUP_EXTENSION: &str = ".bak";

/// Timestamp encoded in a backup file name, or `None` if the name does not
/// follow the `<RFC3339 timestamp>.bak` convention.
pub fn parse_backup_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(BACKUP_EXTENSION)?;
    DateTime::parse_from_rfc3339(stem)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// File name for a backup taken at `ts`.
pub fn backup_name(ts: &DateTime<Utc>) -> String {
    format!(
        "{}{}",
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        BACKUP_EXTENSION
    )
}

/// Bounded fan-out used while listing archives.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Maximum archives (or statefulset replicas) listed concurrently
    pub max_parallel: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

/// Non-owning link from a replica archive back to its statefulset archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    /// Logical name shared by the parent and all of its replicas
    pub name: String,
    /// Statefulset name
    pub set: String,
    pub replica: usize,
}

/// One timestamped backup artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    /// Name of the archive (and service) the file belongs to
    pub archive: String,
    /// Concrete readable location of the file (never a StatefulSet)
    pub location: Location,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Replica the file was found on, for statefulset archives
    pub replica: Option<usize>,
}

impl ArchiveFile {
    /// Build a file entry for `name` inside `dir`, if the name is a backup.
    pub fn from_name(archive: &str, dir: &Location, name: &str, replica: Option<usize>) -> Option<Self> {
        let timestamp = parse_backup_name(name)?;
        Some(Self {
            archive: archive.to_string(),
            location: dir.join(name),
            name: name.to_string(),
            timestamp,
            replica,
        })
    }
}

impl fmt::Display for ArchiveFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.archive, self.name)?;
        if let Some(replica) = self.replica {
            write!(f, "@{replica}")?;
        }
        Ok(())
    }
}

/// A storage location holding backups of one logical service.
#[derive(Debug, Clone)]
pub struct Archive {
    pub name: String,
    pub location: Location,
    pub parent: Option<ParentRef>,
    files: Vec<ArchiveFile>,
    filtered: Vec<ArchiveFile>,
}

impl Archive {
    pub fn new(name: impl Into<String>, location: Location) -> Self {
        Self {
            name: name.into(),
            location,
            parent: None,
            files: Vec::new(),
            filtered: Vec::new(),
        }
    }

    pub fn from_spec(name: impl Into<String>, spec: &str) -> Result<Self> {
        Ok(Self::new(name, Location::parse(spec)?))
    }

    /// Per-replica Pod archive of a StatefulSet archive.
    pub fn pod_archive(&self, replica: usize) -> Result<Archive> {
        let Location::StatefulSet { set, .. } = &self.location else {
            return Err(Error::Configuration(format!(
                "archive {} ({}) is not a statefulset",
                self.name, self.location
            )));
        };

        let mut archive = Archive::new(self.name.clone(), self.location.pod_location(replica)?);
        archive.parent = Some(ParentRef {
            name: self.name.clone(),
            set: set.name.clone(),
            replica,
        });
        Ok(archive)
    }

    /// Every backup file found by the last fetch, most recent first.
    pub fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    /// Files surviving the current filter, most recent first.
    pub fn filtered(&self) -> &[ArchiveFile] {
        &self.filtered
    }

    /// Refresh the file inventory. Safe to call again.
    pub async fn files_fetch(&mut self, remote: &SharedAccess, options: &FetchOptions) -> Result<()> {
        let mut files = match &self.location {
            Location::StatefulSet { set, .. } => {
                let access = access::require(remote, &self.location)?;
                let replicas = access.replica_count(set).await?;
                debug!("Listing {} statefulset replicas of {}", replicas, self.name);

                let pods = (0..replicas)
                    .map(|replica| self.pod_archive(replica))
                    .collect::<Result<Vec<_>>>()?;

                let results: Vec<Result<Vec<ArchiveFile>>> = stream::iter(pods.iter())
                    .map(|pod| list_files(&pod.name, &pod.location, pod.parent.as_ref().map(|p| p.replica), remote))
                    .buffer_unordered(options.max_parallel.max(1))
                    .collect()
                    .await;

                let mut files = Vec::new();
                for result in results {
                    files.extend(result?);
                }
                files
            }
            location => list_files(&self.name, location, None, remote).await?,
        };

        files.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.replica.cmp(&b.replica))
                .then_with(|| a.name.cmp(&b.name))
        });

        debug!("Fetched {} files from archive {}", files.len(), self.name);
        self.filtered = files.clone();
        self.files = files;
        Ok(())
    }

    /// Recompute the filtered view from the full inventory.
    pub fn apply_filter(&mut self, filter: Option<&TimeFilter>) {
        self.filtered = match filter {
            Some(filter) => self
                .files
                .iter()
                .filter(|f| filter.matches(&f.timestamp))
                .cloned()
                .collect(),
            None => self.files.clone(),
        };
    }

    /// Most recent filtered file strictly before `t`.
    pub fn latest_before(&self, t: &DateTime<Utc>) -> Option<&ArchiveFile> {
        // filtered is sorted most recent first
        self.filtered.iter().find(|f| f.timestamp < *t)
    }

    #[cfg(test)]
    pub(crate) fn set_files(&mut self, mut files: Vec<ArchiveFile>) {
        files.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.filtered = files.clone();
        self.files = files;
    }
}

/// List one concrete directory and keep the names that parse as backups.
async fn list_files(
    archive: &str,
    dir: &Location,
    replica: Option<usize>,
    remote: &SharedAccess,
) -> Result<Vec<ArchiveFile>> {
    let names = match dir {
        Location::Local { path } => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || local::list_file_names(&path))
                .await?
                .map_err(|e| Error::lookup(dir, e))?
        }
        Location::StatefulSet { .. } => {
            return Err(Error::Configuration(format!(
                "{dir} must be expanded into pods before listing"
            )))
        }
        _ => access::require(remote, dir)?.list_dir(dir).await?,
    };

    Ok(names
        .iter()
        .filter_map(|name| ArchiveFile::from_name(archive, dir, name, replica))
        .collect())
}

/// The archives of one environment plus the selection cursor.
pub struct ArchiveSet {
    archives: Vec<Archive>,
    pub(crate) seek_time: DateTime<Utc>,
    pub(crate) current: Option<ArchiveFileSet>,
    pub(crate) exhausted: bool,
}

impl ArchiveSet {
    pub fn new(archives: Vec<Archive>) -> Self {
        Self {
            archives,
            seek_time: far_future(),
            current: None,
            exhausted: false,
        }
    }

    /// Build from `name -> spec` pairs. Any malformed spec fails the whole set.
    pub fn from_specs(specs: &BTreeMap<String, String>) -> Result<Self> {
        let archives = specs
            .iter()
            .map(|(name, spec)| Archive::from_spec(name.clone(), spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(archives))
    }

    pub fn archives(&self) -> &[Archive] {
        &self.archives
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn archive(&self, name: &str) -> Option<&Archive> {
        self.archives.iter().find(|a| a.name == name)
    }

    /// Fetch every archive concurrently. All fetches finish before this
    /// returns; the first failure is reported.
    pub async fn files_fetch(&mut self, remote: &SharedAccess, options: &FetchOptions) -> Result<()> {
        info!("Fetching file lists for {} archives", self.archives.len());

        let results: Vec<Result<()>> = stream::iter(self.archives.iter_mut())
            .map(|archive| archive.files_fetch(remote, options))
            .buffer_unordered(options.max_parallel.max(1))
            .collect()
            .await;

        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Apply one filter to every archive.
    pub fn apply_filter(&mut self, filter: Option<&TimeFilter>) {
        for archive in &mut self.archives {
            archive.apply_filter(filter);
        }
    }
}

/// Cursor value that sits after every real backup.
pub(crate) fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}
