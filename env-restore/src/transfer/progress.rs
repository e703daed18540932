//! Byte-level progress tracking for transfers.
//!
//! Every transfer registers a [`Watch`] with the shared [`ProgressWatcher`]
//! and feeds it the bytes it reads. A renderer polls the watcher on its own
//! schedule; the only thing it shares with the copy internals is the atomic
//! counter of each watch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Incremental update function: called with the number of bytes just read.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Progress information aggregated over one or more transfers
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes to transfer (0 when unknown)
    pub total_bytes: u64,

    /// Bytes read so far
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// Number of files finished
    pub files_processed: usize,

    /// Number of files watched
    pub total_files: usize,

    /// Most recently started unfinished file
    pub current_file: Option<String>,
}

impl TransferProgress {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
            files_processed: 0,
            total_files,
            current_file: None,
        }
    }

    /// Update progress with new transferred bytes
    pub fn update(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            ((self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.files_processed == self.total_files
    }
}

/// One in-flight (or finished) transfer.
#[derive(Debug)]
pub struct Watch {
    pub label: String,
    pub total: u64,
    read: AtomicU64,
    finished: AtomicBool,
}

impl Watch {
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Mark the watch done. Done watches still count toward the totals.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }
}

/// Point-in-time view of a single watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchProgress {
    pub label: String,
    pub read: u64,
    pub total: u64,
    pub finished: bool,
}

/// Thread-safe aggregate of every watch registered during a workflow.
#[derive(Clone, Default)]
pub struct ProgressWatcher {
    watches: Arc<Mutex<Vec<Arc<Watch>>>>,
}

impl ProgressWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer of `total` bytes (0 if unknown).
    pub fn register(&self, label: impl Into<String>, total: u64) -> Arc<Watch> {
        let watch = Arc::new(Watch {
            label: label.into(),
            total,
            read: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });
        self.lock().push(Arc::clone(&watch));
        watch
    }

    /// Register a transfer and return its incremental update function.
    pub fn watch(&self, label: impl Into<String>, total: u64) -> ProgressFn {
        updater(self.register(label, total))
    }

    /// Copy of every watch's current counters.
    pub fn snapshot(&self) -> Vec<WatchProgress> {
        self.lock()
            .iter()
            .map(|w| WatchProgress {
                label: w.label.clone(),
                read: w.read(),
                total: w.total,
                finished: w.is_finished(),
            })
            .collect()
    }

    /// Aggregate progress over all watches (speed and ETA left at zero).
    pub fn totals(&self) -> TransferProgress {
        let watches = self.snapshot();
        let total_bytes = watches.iter().map(|w| w.total).sum();
        let mut progress = TransferProgress::new(total_bytes, watches.len());
        progress.files_processed = watches.iter().filter(|w| w.finished).count();
        progress.current_file = watches
            .iter()
            .rev()
            .find(|w| !w.finished)
            .map(|w| w.label.clone());
        progress.update(watches.iter().map(|w| w.read).sum());
        progress
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Watch>>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Update function adding to `watch`'s counter.
pub fn updater(watch: Arc<Watch>) -> ProgressFn {
    Arc::new(move |bytes: u64| {
        watch.read.fetch_add(bytes, Ordering::Relaxed);
    })
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
            progress: TransferProgress::new(total_bytes, total_files),
        }
    }

    /// Fold in a fresh aggregate and recompute speed and ETA.
    pub fn observe(&mut self, latest: TransferProgress) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();
        let transferred = latest.transferred_bytes;

        let mut bytes_per_second = self.progress.bytes_per_second;
        if elapsed > 0.0 {
            let bytes_diff = transferred.saturating_sub(self.last_bytes);
            bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        self.progress = latest;
        self.progress.bytes_per_second = bytes_per_second;
        self.progress.eta_seconds = if bytes_per_second > 0 {
            self.progress.total_bytes.saturating_sub(transferred) / bytes_per_second
        } else {
            0
        };

        self.last_update_time = now;
        self.last_bytes = transferred;
        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// Log aggregate progress every `interval` until `cancel` fires.
pub fn spawn_reporter(
    watcher: ProgressWatcher,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut tracker = ProgressTracker::new(0, 0);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let totals = watcher.totals();
            if totals.total_files == 0 || totals.is_complete() {
                continue;
            }

            let progress = tracker.observe(totals);
            info!(
                "{}/{} files, {} of {} ({:.1}%), {}, eta {}{}",
                progress.files_processed,
                progress.total_files,
                format_bytes(progress.transferred_bytes),
                format_bytes(progress.total_bytes),
                progress.percent_complete,
                format_speed(progress.bytes_per_second),
                format_duration(progress.eta_seconds),
                progress
                    .current_file
                    .as_deref()
                    .map(|f| format!(" [{f}]"))
                    .unwrap_or_default(),
            );
        }

        let totals = watcher.totals();
        if totals.total_files > 0 {
            info!(
                "Transferred {} in {} files (avg {})",
                format_bytes(totals.transferred_bytes),
                totals.total_files,
                format_speed(tracker.average_speed())
            );
        }
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_transfer_progress_update() {
        let mut progress = TransferProgress::new(1000, 1);
        progress.update(500);
        assert_eq!(progress.transferred_bytes, 500);
        assert!((progress.percent_complete - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_unknown_total_reports_zero_percent() {
        let mut progress = TransferProgress::new(0, 1);
        progress.update(4096);
        assert_eq!(progress.percent_complete, 0.0);
    }

    #[test]
    fn test_watch_updates_are_incremental() {
        let watcher = ProgressWatcher::new();
        let update = watcher.watch("a.bak", 100);
        update(10);
        update(15);

        let snapshot = watcher.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].read, 25);
        assert_eq!(snapshot[0].total, 100);
    }

    #[test]
    fn test_totals_across_watches() {
        let watcher = ProgressWatcher::new();
        let a = watcher.register("a", 100);
        let b = watcher.register("b", 300);
        updater(Arc::clone(&a))(100);
        updater(Arc::clone(&b))(50);
        a.finish();

        let totals = watcher.totals();
        assert_eq!(totals.total_bytes, 400);
        assert_eq!(totals.transferred_bytes, 150);
        assert_eq!(totals.files_processed, 1);
        assert_eq!(totals.total_files, 2);
        assert_eq!(totals.current_file.as_deref(), Some("b"));
    }

    #[test]
    fn test_concurrent_updates_never_regress() {
        let watcher = ProgressWatcher::new();
        let update = watcher.watch("shared", 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let update = Arc::clone(&update);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        update(1);
                    }
                })
            })
            .collect();

        let mut last = 0;
        while handles.iter().any(|h| !h.is_finished()) {
            let now = watcher.totals().transferred_bytes;
            assert!(now >= last);
            last = now;
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(watcher.totals().transferred_bytes, 8000);
    }

    #[test]
    fn test_tracker_speed() {
        let watcher = ProgressWatcher::new();
        let update = watcher.watch("f", 1000);
        let mut tracker = ProgressTracker::new(0, 0);

        update(100);
        tracker.observe(watcher.totals());
        thread::sleep(Duration::from_millis(100));
        update(400);
        let progress = tracker.observe(watcher.totals());

        assert_eq!(progress.transferred_bytes, 500);
        assert!(progress.bytes_per_second > 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
