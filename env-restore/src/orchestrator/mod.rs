//! Environment-wide workflows: snapshot, copy and restore.
//!
//! ```text
//! archive specs ─> ArchiveSet ─> files_fetch ─> selector ─> picker ─┐
//!                                                                   │
//!        env_copy:    Transfer per file (bounded, concurrent) <─────┤
//!        env_restore: Prepare ─> stage + Restore per file ─> Finalize
//! ```

pub mod picker;

use crate::access::SharedAccess;
use crate::archive::{ArchiveFile, ArchiveFileSet, ArchiveSet, FetchOptions, TimeFilter};
use crate::service::rpc::ServiceRpc;
use crate::service::{Service, ServiceSet};
use crate::transfer::progress::ProgressWatcher;
use crate::transfer::{destination_for, Transfer, TransferOptions, TransferStats};
use crate::utils::errors::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use picker::SnapshotPicker;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Which backups the selector considers.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Only candidates strictly older than this instant; newest when unset
    pub before: Option<DateTime<Utc>>,
    pub filter: Option<TimeFilter>,
}

/// Drives snapshot, copy and restore workflows against one set of
/// collaborators.
pub struct Orchestrator {
    remote: SharedAccess,
    rpc: Arc<dyn ServiceRpc>,
    transfer: Transfer,
    progress: ProgressWatcher,
    fetch: FetchOptions,
    max_parallel_files: usize,
}

impl Orchestrator {
    pub fn new(
        remote: SharedAccess,
        rpc: Arc<dyn ServiceRpc>,
        transfer: TransferOptions,
        fetch: FetchOptions,
    ) -> Self {
        Self {
            transfer: Transfer::new(remote.clone(), transfer),
            remote,
            rpc,
            progress: ProgressWatcher::new(),
            fetch,
            max_parallel_files: 4,
        }
    }

    /// Bound on concurrent file copies in [`Orchestrator::env_copy`].
    pub fn with_max_parallel_files(mut self, max_parallel_files: usize) -> Self {
        self.max_parallel_files = max_parallel_files.max(1);
        self
    }

    /// Byte counters of every transfer this orchestrator runs.
    pub fn progress(&self) -> &ProgressWatcher {
        &self.progress
    }

    /// Build, fetch and position an archive set.
    async fn load(&self, specs: &BTreeMap<String, String>, selection: &Selection) -> Result<ArchiveSet> {
        let mut archives = ArchiveSet::from_specs(specs)?;
        if archives.is_empty() {
            return Err(Error::Configuration("no archives configured".into()));
        }

        archives.files_fetch(&self.remote, &self.fetch).await?;
        archives.apply_filter(selection.filter.as_ref());
        match selection.before {
            Some(t) => archives.seek_to(t),
            None => archives.seek_latest(),
        }
        Ok(archives)
    }

    async fn choose(
        &self,
        specs: &BTreeMap<String, String>,
        picker: &dyn SnapshotPicker,
        selection: &Selection,
    ) -> Result<ArchiveFileSet> {
        let mut archives = self.load(specs, selection).await?;
        let snapshot = picker
            .pick(&mut archives.snapshots())
            .ok_or_else(|| Error::Configuration("no snapshot candidate was picked".into()))?;

        info!(
            "Selected snapshot of {} archives, newest {}",
            snapshot.len(),
            snapshot
                .newest()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );
        Ok(snapshot)
    }

    /// Up to `limit` candidates, newest first.
    pub async fn list(
        &self,
        specs: &BTreeMap<String, String>,
        selection: &Selection,
        limit: usize,
    ) -> Result<Vec<ArchiveFileSet>> {
        let mut archives = self.load(specs, selection).await?;
        Ok(archives.snapshots().take(limit).collect())
    }

    /// Ask every service endpoint to take a snapshot. All endpoints are
    /// attempted; every failure is reported.
    pub async fn env_snap(&self, services: &ServiceSet) -> Result<usize> {
        let expanded = services.expand(&self.remote).await?;
        let endpoints = expanded.endpoints()?;
        info!("Triggering backups on {} endpoints", endpoints.len());

        let results = join_all(endpoints.iter().map(|(endpoint, service)| async move {
            let result = self.rpc.backup(endpoint).await;
            match &result {
                Ok(()) => info!("Backup triggered on {} ({})", endpoint, service.name),
                Err(e) => error!("Backup failed on {} ({}): {}", endpoint, service.name, e),
            }
            result
        }))
        .await;

        let mut errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
        match errors.len() {
            0 => Ok(endpoints.len()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Copy a picked snapshot between environments, archive name to archive
    /// name.
    pub async fn env_copy(
        &self,
        from: &BTreeMap<String, String>,
        to: &BTreeMap<String, String>,
        picker: &dyn SnapshotPicker,
        selection: &Selection,
    ) -> Result<ArchiveFileSet> {
        let destinations = ArchiveSet::from_specs(to)?;
        let snapshot = self.choose(from, picker, selection).await?;

        // Every target must exist before a single byte moves.
        let mut plan = Vec::with_capacity(snapshot.len());
        for file in snapshot.files() {
            let archive = destinations.archive(&file.archive).ok_or_else(|| {
                Error::Configuration(format!(
                    "destination has no archive named {:?}",
                    file.archive
                ))
            })?;
            plan.push((file, destination_for(file, &archive.location)));
        }

        info!("Copying {} files", plan.len());
        let results: Vec<Result<TransferStats>> = stream::iter(plan.iter())
            .map(|(file, destination)| self.transfer.copy(file, destination, &self.progress))
            .buffer_unordered(self.max_parallel_files)
            .collect()
            .await;

        results.into_iter().collect::<Result<Vec<_>>>()?;
        info!("Copy complete");
        Ok(snapshot)
    }

    /// Restore a picked snapshot into live services.
    pub async fn env_restore(
        &self,
        from: &BTreeMap<String, String>,
        services: &ServiceSet,
        picker: &dyn SnapshotPicker,
        selection: &Selection,
    ) -> Result<ArchiveFileSet> {
        let snapshot = self.choose(from, picker, selection).await?;
        let names = snapshot.archive_names();
        let targets = services.restrict_to(names.iter().map(String::as_str))?;
        let replicas = targets.expand(&self.remote).await?;

        info!(
            "Restoring {} files into {} services ({} instances)",
            snapshot.len(),
            targets.len(),
            replicas.len()
        );

        self.prepare(&replicas).await?;
        for file in snapshot.files() {
            self.restore_file(file, &targets, &replicas).await?;
        }
        self.finalize(&replicas).await?;

        info!("Restore complete");
        Ok(snapshot)
    }

    /// Stop traffic, drain and clear every endpoint.
    async fn prepare(&self, replicas: &ServiceSet) -> Result<()> {
        info!("Prepare: stopping, draining and resetting services");
        let rpc = &self.rpc;
        replicas
            .do_once_per_endpoint(|endpoint, _| async move {
                rpc.start_stop(&endpoint, false).await?;
                rpc.wait_for_drain(&endpoint).await?;
                rpc.reset(&endpoint).await
            })
            .await
            .inspect_err(|e| warn!("Prepare failed: {}", e))?;
        Ok(())
    }

    /// Stage one file for its service, then have every instance load it.
    async fn restore_file(&self, file: &ArchiveFile, targets: &ServiceSet, replicas: &ServiceSet) -> Result<()> {
        let service = targets.service(&file.archive).ok_or_else(|| {
            Error::Configuration(format!("no service named {:?}", file.archive))
        })?;

        let staged = destination_for(file, service.stage());
        self.transfer.copy(file, &staged, &self.progress).await?;

        let instances: Vec<&Service> = replicas
            .services()
            .iter()
            .filter(|s| s.name == file.archive)
            .collect();
        for instance in instances {
            let endpoint = instance.endpoint()?;
            let path = destination_for(file, instance.stage()).path_str();
            info!("Restore: {} from {}", endpoint, path);
            self.rpc.restore(&endpoint, &path).await?;
        }
        Ok(())
    }

    /// Realign logs and resume traffic on every endpoint.
    async fn finalize(&self, replicas: &ServiceSet) -> Result<()> {
        info!("Finalize: realigning logs and resuming traffic");
        let rpc = &self.rpc;
        replicas
            .do_once_per_endpoint(|endpoint, _| async move {
                rpc.realign_log(&endpoint).await?;
                rpc.start_stop(&endpoint, true).await
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::picker::{FirstCandidate, LatestConsistent};
    use super::*;
    use crate::archive::backup_name;
    use crate::testing::{MemoryAccess, RecordingRpc};
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn specs(pairs: &[(&str, String)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(n, s)| (n.to_string(), s.clone())).collect()
    }

    /// Write `<root>/<archive>/<ts>.bak` containing `<archive>@<ts>`.
    fn backup(root: &Path, archive: &str, ts: DateTime<Utc>) -> String {
        let dir = root.join(archive);
        fs::create_dir_all(&dir).unwrap();
        let name = backup_name(&ts);
        fs::write(dir.join(&name), format!("{archive}@{ts}")).unwrap();
        name
    }

    fn local_archives(root: &Path, names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("local|{}", root.join(n).display())))
            .collect()
    }

    struct Fixture {
        memory: MemoryAccess,
        rpc: RecordingRpc,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let memory = MemoryAccess::new();
        let rpc = RecordingRpc::new();
        let orchestrator = Orchestrator::new(
            Some(Arc::new(memory.clone())),
            Arc::new(rpc.clone()),
            TransferOptions::default(),
            FetchOptions::default(),
        );
        Fixture { memory, rpc, orchestrator }
    }

    #[tokio::test]
    async fn test_restore_phases_run_in_order_once_per_endpoint() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let name = backup(temp_dir.path(), "accounts", at(10, 0, 0));
        backup(temp_dir.path(), "ledger", at(10, 0, 0));
        backup(temp_dir.path(), "search", at(10, 0, 0));
        let archives = local_archives(temp_dir.path(), &["accounts", "ledger", "search"]);

        // accounts and ledger share one process; unused is not in the snapshot.
        let services = ServiceSet::from_specs(&specs(&[
            ("accounts", "host|dev|9000|/stage/accounts".into()),
            ("ledger", "host|dev|9000|/stage/ledger".into()),
            ("search", "host|other|9100|/stage/search".into()),
            ("unused", "host|idle|9200|/stage/unused".into()),
        ]))?;

        let f = fixture();
        let snapshot = f
            .orchestrator
            .env_restore(&archives, &services, &LatestConsistent::default(), &Selection::default())
            .await?;
        assert_eq!(snapshot.len(), 3);

        assert_eq!(
            f.rpc.log(),
            vec![
                "dev:9000 StartStop(false)".to_string(),
                "dev:9000 WaitForDrain".to_string(),
                "dev:9000 Reset".to_string(),
                "other:9100 StartStop(false)".to_string(),
                "other:9100 WaitForDrain".to_string(),
                "other:9100 Reset".to_string(),
                format!("dev:9000 Restore(/stage/accounts/{name})"),
                format!("dev:9000 Restore(/stage/ledger/{name})"),
                format!("other:9100 Restore(/stage/search/{name})"),
                "dev:9000 LogRealign".to_string(),
                "dev:9000 StartStop(true)".to_string(),
                "other:9100 LogRealign".to_string(),
                "other:9100 StartStop(true)".to_string(),
            ]
        );

        let staged = f.memory.written(&format!("host|dev|/stage/ledger/{name}")).unwrap();
        assert_eq!(staged, format!("ledger@{}", at(10, 0, 0)).into_bytes());
        assert!(f.memory.committed(&format!("host|other|/stage/search/{name}")));
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_into_statefulset_stages_every_replica() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let name = backup(temp_dir.path(), "ledger", at(10, 0, 0));
        let archives = local_archives(temp_dir.path(), &["ledger"]);
        let services = ServiceSet::from_specs(&specs(&[(
            "ledger",
            "statefulset|prod/ledger|7000|/stage/<pod>".into(),
        )]))?;

        let f = fixture();
        f.memory.set_replicas("prod/ledger", 2);
        f.orchestrator
            .env_restore(&archives, &services, &FirstCandidate, &Selection::default())
            .await?;

        for replica in 0..2 {
            let key = format!("pod|prod/ledger-{replica}|/stage/ledger-{replica}/{name}");
            assert!(f.memory.committed(&key), "{key}");
        }
        let restores: Vec<_> = f
            .rpc
            .log()
            .into_iter()
            .filter(|l| l.contains("Restore("))
            .collect();
        assert_eq!(
            restores,
            vec![
                format!("ledger-0.ledger.prod:7000 Restore(/stage/ledger-0/{name})"),
                format!("ledger-1.ledger.prod:7000 Restore(/stage/ledger-1/{name})"),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_prepare_failure_stops_before_any_transfer() -> Result<()> {
        let temp_dir = TempDir::new()?;
        backup(temp_dir.path(), "accounts", at(10, 0, 0));
        let archives = local_archives(temp_dir.path(), &["accounts"]);
        let services = ServiceSet::from_specs(&specs(&[(
            "accounts",
            "host|dev|9000|/stage/accounts".into(),
        )]))?;

        let f = fixture();
        f.rpc.fail("dev:9000", "Reset");
        let err = f
            .orchestrator
            .env_restore(&archives, &services, &FirstCandidate, &Selection::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rpc { .. }), "{err}");
        assert!(f.memory.written_keys().is_empty());
        assert!(!f.rpc.log().iter().any(|l| l.contains("Restore(")));
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_needs_a_service_per_archive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        backup(temp_dir.path(), "accounts", at(10, 0, 0));
        backup(temp_dir.path(), "ledger", at(10, 0, 0));
        let archives = local_archives(temp_dir.path(), &["accounts", "ledger"]);
        let services = ServiceSet::from_specs(&specs(&[(
            "accounts",
            "host|dev|9000|/stage/accounts".into(),
        )]))?;

        let f = fixture();
        let err = f
            .orchestrator
            .env_restore(&archives, &services, &FirstCandidate, &Selection::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(f.rpc.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_env_snap_attempts_all_and_aggregates() {
        let services = ServiceSet::from_specs(&specs(&[
            ("a", "host|h1|9000|/s".into()),
            ("b", "host|h2|9000|/s".into()),
            ("c", "host|h3|9000|/s".into()),
            ("d", "host|h3|9000|/t".into()),
        ]))
        .unwrap();

        let f = fixture();
        f.rpc.fail("h1:9000", "Backup");
        f.rpc.fail("h3:9000", "Backup");
        let err = f.orchestrator.env_snap(&services).await.unwrap_err();

        match err {
            Error::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {other}"),
        }
        let mut called: Vec<_> = f.rpc.calls().into_iter().map(|(e, _)| e).collect();
        called.sort();
        assert_eq!(called, vec!["h1:9000", "h2:9000", "h3:9000"]);
    }

    #[tokio::test]
    async fn test_env_snap_success_counts_endpoints() {
        let services = ServiceSet::from_specs(&specs(&[
            ("a", "host|h1|9000|/s".into()),
            ("b", "host|h1|9000|/t".into()),
        ]))
        .unwrap();
        let f = fixture();
        assert_eq!(f.orchestrator.env_snap(&services).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_env_copy_matches_archive_names() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let name = backup(src.path(), "accounts", at(10, 0, 0));
        backup(src.path(), "ledger", at(10, 0, 0));
        backup(src.path(), "ledger", at(9, 0, 0));

        let f = fixture();
        let snapshot = f
            .orchestrator
            .env_copy(
                &local_archives(src.path(), &["accounts", "ledger"]),
                &local_archives(dst.path(), &["accounts", "ledger"]),
                &LatestConsistent::default(),
                &Selection::default(),
            )
            .await?;

        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            fs::read_to_string(dst.path().join("ledger").join(&name))?,
            format!("ledger@{}", at(10, 0, 0))
        );
        assert!(dst.path().join("accounts").join(&name).exists());
        assert!(!dst.path().join("ledger").join(backup_name(&at(9, 0, 0))).exists());

        let totals = f.orchestrator.progress().totals();
        assert_eq!(totals.total_files, 2);
        assert!(totals.is_complete());
        Ok(())
    }

    #[tokio::test]
    async fn test_env_copy_honors_seek() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        backup(src.path(), "ledger", at(10, 0, 0));
        let older = backup(src.path(), "ledger", at(9, 0, 0));

        let f = fixture();
        let selection = Selection {
            before: Some(at(10, 0, 0)),
            filter: None,
        };
        f.orchestrator
            .env_copy(
                &local_archives(src.path(), &["ledger"]),
                &local_archives(dst.path(), &["ledger"]),
                &FirstCandidate,
                &selection,
            )
            .await?;

        let copied: Vec<_> = fs::read_dir(dst.path().join("ledger"))?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(copied, vec![older]);
        Ok(())
    }

    #[tokio::test]
    async fn test_env_copy_missing_destination_moves_nothing() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        backup(src.path(), "accounts", at(10, 0, 0));
        backup(src.path(), "ledger", at(10, 0, 0));

        let f = fixture();
        let err = f
            .orchestrator
            .env_copy(
                &local_archives(src.path(), &["accounts", "ledger"]),
                &local_archives(dst.path(), &["accounts"]),
                &FirstCandidate,
                &Selection::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)), "{err}");
        assert!(!dst.path().join("accounts").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_no_candidate_is_an_error() -> Result<()> {
        let src = TempDir::new()?;
        fs::create_dir_all(src.path().join("ledger"))?;
        let f = fixture();
        let err = f
            .orchestrator
            .env_copy(
                &local_archives(src.path(), &["ledger"]),
                &local_archives(src.path(), &["ledger"]),
                &FirstCandidate,
                &Selection::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_with_filter_and_limit() -> Result<()> {
        let src = TempDir::new()?;
        for h in [1, 2, 3, 4] {
            backup(src.path(), "a", at(h, 0, 0));
            backup(src.path(), "b", at(h, 0, 0));
        }

        let f = fixture();
        let archives = local_archives(src.path(), &["a", "b"]);
        let all = f.orchestrator.list(&archives, &Selection::default(), 10).await?;
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|c| c.is_consistent()));

        let limited = f.orchestrator.list(&archives, &Selection::default(), 2).await?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].newest(), Some(at(4, 0, 0)));

        let selection = Selection {
            before: None,
            filter: Some("hour=2".parse()?),
        };
        let filtered = f.orchestrator.list(&archives, &selection, 10).await?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].newest(), Some(at(2, 0, 0)));
        Ok(())
    }
}
