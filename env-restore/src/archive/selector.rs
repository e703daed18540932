//! Backward time-walk producing consistent snapshot candidates.
//!
//! Each call to [`ArchiveSet::next_snapshot`] yields one [`ArchiveFileSet`]:
//! the most recent file of every archive strictly before the seek cursor.
//! Between calls the cursor moves back to the latest instant at which some
//! archive's pick changes, so candidates never repeat and the walk ends after
//! at most as many steps as there are distinct timestamps.
//!
//! The walk also ends once an archive that contributed to the previous
//! candidate has no older file: going further back could only drop services.
//! Archives that never had an eligible file do not stop the walk; they just
//! leave every candidate incomplete.

use super::{far_future, ArchiveFile, ArchiveSet};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::debug;

/// Minimum spread between the newest and oldest file that marks a candidate
/// as skewed.
pub fn skew_threshold() -> Duration {
    Duration::seconds(1)
}

/// One candidate snapshot: at most one file per archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFileSet {
    files: Vec<ArchiveFile>,
    archive_count: usize,
    seek_time: DateTime<Utc>,
    complete: bool,
    skewed: bool,
}

impl ArchiveFileSet {
    fn new(mut files: Vec<ArchiveFile>, archive_count: usize, seek_time: DateTime<Utc>) -> Self {
        files.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.archive.cmp(&b.archive))
        });

        let complete = files.len() == archive_count;
        let mut set = Self {
            files,
            archive_count,
            seek_time,
            complete,
            skewed: false,
        };
        set.skewed = set.span() >= skew_threshold();
        set
    }

    /// Selected files, most recent first.
    pub fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn archive_count(&self) -> usize {
        self.archive_count
    }

    /// Cursor the candidate was selected against.
    pub fn seek_time(&self) -> DateTime<Utc> {
        self.seek_time
    }

    /// Every archive contributed a file.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Files are spread over a second or more.
    pub fn is_skewed(&self) -> bool {
        self.skewed
    }

    pub fn is_consistent(&self) -> bool {
        self.complete && !self.skewed
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.files.first().map(|f| f.timestamp)
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.files.last().map(|f| f.timestamp)
    }

    /// Distance between the newest and the oldest file.
    pub fn span(&self) -> Duration {
        match (self.newest(), self.oldest()) {
            (Some(newest), Some(oldest)) => newest - oldest,
            _ => Duration::zero(),
        }
    }

    pub fn file(&self, archive: &str) -> Option<&ArchiveFile> {
        self.files.iter().find(|f| f.archive == archive)
    }

    /// Names of the archives referenced by this candidate.
    pub fn archive_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.archive.clone()).collect()
    }
}

impl ArchiveSet {
    /// Restart the walk from `t`.
    pub fn seek_to(&mut self, t: DateTime<Utc>) {
        self.seek_time = t;
        self.current = None;
        self.exhausted = false;
    }

    /// Restart the walk from the newest backup.
    pub fn seek_latest(&mut self) {
        self.seek_to(far_future());
    }

    pub fn seek_time(&self) -> DateTime<Utc> {
        self.seek_time
    }

    /// Most recently produced candidate.
    pub fn current(&self) -> Option<&ArchiveFileSet> {
        self.current.as_ref()
    }

    /// Next (older) candidate, or `None` when the history is exhausted.
    /// Once exhausted, keeps returning `None` until the next seek.
    pub fn next_snapshot(&mut self) -> Option<ArchiveFileSet> {
        if self.exhausted {
            return None;
        }
        let next = self.select_next();
        self.exhausted = next.is_none();
        next
    }

    fn select_next(&mut self) -> Option<ArchiveFileSet> {
        let mut previous: Option<HashSet<String>> = None;

        if let Some(current) = self.current.take() {
            let next = self
                .archives()
                .iter()
                .filter_map(|a| a.latest_before(&self.seek_time))
                .map(|f| f.timestamp)
                .max()?;
            debug!("Advancing seek cursor from {} to {}", self.seek_time, next);
            self.seek_time = next;
            previous = Some(current.files.into_iter().map(|f| f.archive).collect());
        }

        let seek_time = self.seek_time;
        let files: Vec<ArchiveFile> = self
            .archives()
            .iter()
            .filter_map(|a| a.latest_before(&seek_time).cloned())
            .collect();

        if files.is_empty() {
            return None;
        }

        if let Some(previous) = previous {
            let selected: HashSet<&str> = files.iter().map(|f| f.archive.as_str()).collect();
            if let Some(ran_out) = previous.iter().find(|a| !selected.contains(a.as_str())) {
                debug!("Archive history exhausted in {}", ran_out);
                return None;
            }
        }

        let set = ArchiveFileSet::new(files, self.len(), seek_time);
        self.current = Some(set.clone());
        Some(set)
    }

    /// Iterator over the remaining candidates.
    pub fn snapshots(&mut self) -> Snapshots<'_> {
        Snapshots { set: self }
    }
}

/// Lazy, finite sequence of candidates from an [`ArchiveSet`].
pub struct Snapshots<'a> {
    set: &'a mut ArchiveSet,
}

impl Iterator for Snapshots<'_> {
    type Item = ArchiveFileSet;

    fn next(&mut self) -> Option<ArchiveFileSet> {
        self.set.next_snapshot()
    }
}
