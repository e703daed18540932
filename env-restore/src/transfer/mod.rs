//! Streaming copy of backup files between locations.
//!
//! A copy runs as independent tasks connected by bounded channels:
//!
//! ```text
//!                    ┌──> progress (counts bytes read)
//! source reader ─────┼──> writer #0
//!                    └──> writer #N-1   (one per StatefulSet replica)
//! ```
//!
//! The reader hands the same chunk to every channel. A full channel blocks
//! the reader, so the slowest destination sets the pace. Progress is driven
//! by bytes read, not bytes confirmed written.

pub mod progress;
pub mod progress_stream;

use crate::access::{self, ByteWriter, SharedAccess};
use crate::archive::ArchiveFile;
use crate::location::Location;
use crate::utils::errors::{Error, Result};
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use progress::{ProgressFn, ProgressWatcher};
use progress_stream::ProgressStream;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

type Chunk = io::Result<Bytes>;

/// Tuning knobs for streaming copies.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Read size of the source stream in bytes
    pub chunk_size: usize,

    /// Chunks buffered per destination before the reader blocks
    pub channel_depth: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            channel_depth: 8,
        }
    }
}

/// Result of a successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_read: u64,
    /// Bytes written per concrete destination
    pub written: Vec<(Location, u64)>,
}

/// Marker carried inside the I/O error handed to destinations when the
/// transfer is aborted by another stage.
#[derive(Debug)]
struct Aborted(String);

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer aborted: {}", self.0)
    }
}

impl std::error::Error for Aborted {}

fn is_aborted(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<Aborted>())
}

/// What a stage reports when it stops.
enum StageOutcome {
    Read(u64),
    Progress,
    Written(usize, u64),
}

/// Stage failure; `secondary` ones only echo a failure that happened
/// elsewhere and are reported only when nothing better is available.
struct StageError {
    error: Error,
    secondary: bool,
}

impl StageError {
    fn primary(error: Error) -> Self {
        Self { error, secondary: false }
    }

    fn secondary(error: Error) -> Self {
        Self { error, secondary: true }
    }
}

type StageResult = std::result::Result<StageOutcome, StageError>;

/// The streaming copy engine.
#[derive(Clone)]
pub struct Transfer {
    remote: SharedAccess,
    options: TransferOptions,
}

impl Transfer {
    pub fn new(remote: SharedAccess, options: TransferOptions) -> Self {
        Self { remote, options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Copy `source` to `destination`, reporting read progress to `watcher`.
    ///
    /// A StatefulSet destination receives a full copy on every live replica;
    /// the copy only succeeds if every replica does.
    pub async fn copy(
        &self,
        source: &ArchiveFile,
        destination: &Location,
        watcher: &ProgressWatcher,
    ) -> Result<TransferStats> {
        let label = source.to_string();
        let (reader, size) = self.open_source(&source.location).await?;
        let targets = self.resolve_destinations(destination).await?;

        info!(
            "Copying {} ({} bytes) to {} destination(s)",
            label,
            size,
            targets.len()
        );

        let watch = watcher.register(label.clone(), size);
        let result = self
            .run_stages(&label, reader, targets, progress::updater(watch.clone()))
            .await;
        watch.finish();

        match &result {
            Ok(stats) => info!("Copied {} ({} bytes)", label, stats.bytes_read),
            Err(e) => warn!("Copy of {} failed: {}", label, e),
        }
        result
    }

    /// Open the source for reading and report its size.
    async fn open_source(
        &self,
        location: &Location,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64)> {
        match location {
            Location::StatefulSet { .. } => Err(Error::Configuration(format!(
                "{location} cannot be a copy source: a statefulset has no single byte stream"
            ))),
            Location::Local { path } => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| Error::lookup(location, e))?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| Error::lookup(location, e))?
                    .len();
                Ok((Box::new(file), size))
            }
            _ => {
                let access = access::require(&self.remote, location)?;
                let size = access.stat(location).await?;
                let reader = access.open_read(location).await?;
                Ok((reader, size))
            }
        }
    }

    /// Concrete destinations: one, or one per live replica.
    async fn resolve_destinations(&self, destination: &Location) -> Result<Vec<Location>> {
        match destination {
            Location::StatefulSet { set, .. } => {
                let access = access::require(&self.remote, destination)?;
                let replicas = access.replica_count(set).await?;
                if replicas == 0 {
                    return Err(Error::lookup(
                        destination,
                        "statefulset has no live replicas",
                    ));
                }
                (0..replicas)
                    .map(|replica| destination.pod_location(replica))
                    .collect()
            }
            other => Ok(vec![other.clone()]),
        }
    }

    async fn run_stages(
        &self,
        label: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        targets: Vec<Location>,
        update: ProgressFn,
    ) -> Result<TransferStats> {
        let depth = self.options.channel_depth.max(1);
        let mut stages: JoinSet<StageResult> = JoinSet::new();

        let (progress_tx, progress_rx) = mpsc::channel::<Chunk>(depth);
        stages.spawn(progress_stage(progress_rx, update));

        let mut senders = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let (tx, rx) = mpsc::channel::<Chunk>(depth);
            senders.push(tx);
            stages.spawn(write_stage(
                index,
                target.clone(),
                self.remote.clone(),
                rx,
                label.to_string(),
            ));
        }

        stages.spawn(read_stage(
            reader,
            self.options.chunk_size.max(1),
            progress_tx,
            senders,
            label.to_string(),
        ));

        let mut bytes_read = 0;
        let mut written = vec![0u64; targets.len()];
        let mut primary: Option<Error> = None;
        let mut secondary: Option<Error> = None;

        // Drain every stage before deciding; nothing is left blocked.
        while let Some(joined) = stages.join_next().await {
            match joined {
                Ok(Ok(StageOutcome::Read(n))) => bytes_read = n,
                Ok(Ok(StageOutcome::Written(index, n))) => written[index] = n,
                Ok(Ok(StageOutcome::Progress)) => {}
                Ok(Err(StageError { error, secondary: false })) => {
                    primary.get_or_insert(error);
                }
                Ok(Err(StageError { error, secondary: true })) => {
                    secondary.get_or_insert(error);
                }
                Err(e) => {
                    primary.get_or_insert(Error::from(e));
                }
            }
        }

        if let Some(error) = primary.or(secondary) {
            return Err(error);
        }

        Ok(TransferStats {
            bytes_read,
            written: targets.into_iter().zip(written).collect(),
        })
    }
}

/// Read the source and hand every chunk to each consumer.
async fn read_stage(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
    progress: mpsc::Sender<Chunk>,
    destinations: Vec<mpsc::Sender<Chunk>>,
    label: String,
) -> StageResult {
    let mut chunks = ReaderStream::with_capacity(reader, chunk_size);
    let mut bytes_read = 0u64;

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let reason = format!("source read failed: {e}");
                abort_all(&destinations, &reason).await;
                return Err(StageError::primary(Error::transfer(&label, reason)));
            }
        };
        bytes_read += chunk.len() as u64;

        // Progress never fails the copy; a closed progress channel is ignored.
        let _ = progress.send(Ok(chunk.clone())).await;

        for (index, destination) in destinations.iter().enumerate() {
            if destination.send(Ok(chunk.clone())).await.is_err() {
                let reason = format!("destination #{index} stopped receiving");
                abort_all(&destinations, &reason).await;
                return Err(StageError::secondary(Error::transfer(&label, reason)));
            }
        }
    }

    debug!("Read {} bytes from {}", bytes_read, label);
    Ok(StageOutcome::Read(bytes_read))
}

/// Tell every destination still listening that the stream is broken, so
/// none of them commits a truncated file.
async fn abort_all(destinations: &[mpsc::Sender<Chunk>], reason: &str) {
    for destination in destinations {
        let _ = destination
            .send(Err(io::Error::other(Aborted(reason.to_string()))))
            .await;
    }
}

async fn progress_stage(rx: mpsc::Receiver<Chunk>, update: ProgressFn) -> StageResult {
    let mut counted = ProgressStream::new(Box::pin(receiver_stream(rx)), update);
    while counted.next().await.is_some() {}
    Ok(StageOutcome::Progress)
}

async fn write_stage(
    index: usize,
    target: Location,
    remote: SharedAccess,
    rx: mpsc::Receiver<Chunk>,
    label: String,
) -> StageResult {
    let mut input = StreamReader::new(Box::pin(receiver_stream(rx)));

    let classify = |e: io::Error| {
        let error = Error::transfer(&label, format!("writing {target}: {e}"));
        if is_aborted(&e) {
            StageError::secondary(error)
        } else {
            StageError::primary(error)
        }
    };

    let written = match &target {
        Location::Local { path } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(&classify)?;
            }
            let mut file = tokio::fs::File::create(path).await.map_err(&classify)?;

            let copied = tokio::io::copy(&mut input, &mut file).await;
            // Flush to disk and close even when the copy failed.
            let flushed = file.flush().await;
            let synced = file.sync_all().await;
            drop(file);

            match (copied, flushed, synced) {
                (Ok(copied), Ok(()), Ok(())) => copied,
                (copied, flushed, synced) => {
                    let _ = tokio::fs::remove_file(path).await;
                    let e = copied.err().or(flushed.err()).or(synced.err());
                    return Err(classify(e.unwrap_or_else(|| io::Error::other("write failed"))));
                }
            }
        }
        Location::StatefulSet { .. } => {
            return Err(StageError::primary(Error::Configuration(format!(
                "{target} must be expanded into replicas before writing"
            ))));
        }
        _ => {
            let access = access::require(&remote, &target).map_err(StageError::primary)?;
            let mut sink: ByteWriter = access
                .open_write(&target)
                .await
                .map_err(StageError::primary)?;
            let copied = tokio::io::copy(&mut input, &mut sink)
                .await
                .map_err(&classify)?;
            sink.shutdown().await.map_err(&classify)?;
            copied
        }
    };

    debug!("Wrote {} bytes to {}", written, target);
    Ok(StageOutcome::Written(index, written))
}

fn receiver_stream(rx: mpsc::Receiver<Chunk>) -> impl Stream<Item = Chunk> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) })
}

/// Destination of `file` inside the archive at `destination`: same file name,
/// the destination's directory (or path template).
pub fn destination_for(file: &ArchiveFile, destination: &Location) -> Location {
    destination.join(&file.name)
}
