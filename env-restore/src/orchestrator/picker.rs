//! Policies choosing one snapshot out of the selector's candidates.

use crate::archive::ArchiveFileSet;
use tracing::{info, warn};

/// Given candidates newest first, return the one to act on.
pub trait SnapshotPicker: Send + Sync {
    fn pick(&self, candidates: &mut dyn Iterator<Item = ArchiveFileSet>) -> Option<ArchiveFileSet>;
}

/// Newest candidate that is complete and not skewed.
///
/// With `allow_inconsistent` the newest candidate is taken as is, after
/// logging what is wrong with it.
#[derive(Debug, Clone, Default)]
pub struct LatestConsistent {
    pub allow_inconsistent: bool,
}

impl SnapshotPicker for LatestConsistent {
    fn pick(&self, candidates: &mut dyn Iterator<Item = ArchiveFileSet>) -> Option<ArchiveFileSet> {
        for candidate in candidates {
            if candidate.is_consistent() {
                info!("Picked snapshot at {}", describe(&candidate));
                return Some(candidate);
            }

            warn!(
                "Snapshot at {} is {}",
                describe(&candidate),
                problems(&candidate)
            );
            if self.allow_inconsistent {
                return Some(candidate);
            }
        }
        None
    }
}

/// First candidate, whatever its consistency flags.
#[derive(Debug, Clone, Default)]
pub struct FirstCandidate;

impl SnapshotPicker for FirstCandidate {
    fn pick(&self, candidates: &mut dyn Iterator<Item = ArchiveFileSet>) -> Option<ArchiveFileSet> {
        candidates.next()
    }
}

fn describe(candidate: &ArchiveFileSet) -> String {
    candidate
        .newest()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

/// Human readable consistency problems of a candidate.
pub fn problems(candidate: &ArchiveFileSet) -> String {
    let mut problems = Vec::new();
    if !candidate.is_complete() {
        problems.push(format!(
            "incomplete ({} of {} archives)",
            candidate.len(),
            candidate.archive_count()
        ));
    }
    if candidate.is_skewed() {
        problems.push(format!("skewed by {}s", candidate.span().num_seconds()));
    }
    if problems.is_empty() {
        "consistent".to_string()
    } else {
        problems.join(", ")
    }
}
