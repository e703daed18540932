//! In-memory collaborators for unit tests.

use crate::access::{ByteReader, ByteWriter, RemoteAccess};
use crate::location::{Location, PodRef};
use crate::service::rpc::{RpcCall, ServiceRpc};
use crate::service::Endpoint;
use crate::utils::errors::{Error, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

fn key(spec: &str) -> String {
    Location::parse(spec)
        .map(|l| l.to_string())
        .unwrap_or_else(|e| panic!("bad test location {spec}: {e}"))
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    replicas: HashMap<String, usize>,
    fail_list: HashSet<String>,
    fail_read_after: HashMap<String, usize>,
    fail_write_after: HashMap<String, usize>,
    gates: HashMap<String, Arc<Notify>>,
    written: BTreeMap<String, Vec<u8>>,
    committed: HashSet<String>,
}

/// [`RemoteAccess`] over a map of `location spec -> bytes`.
#[derive(Clone, Default)]
pub struct MemoryAccess {
    state: Arc<Mutex<State>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put(&self, spec: &str, bytes: &[u8]) {
        self.lock().files.insert(key(spec), bytes.to_vec());
    }

    pub fn set_replicas(&self, set: &str, replicas: usize) {
        self.lock().replicas.insert(set.to_string(), replicas);
    }

    pub fn fail_list(&self, dir: &str) {
        self.lock().fail_list.insert(key(dir));
    }

    pub fn fail_read_after(&self, spec: &str, bytes: usize) {
        self.lock().fail_read_after.insert(key(spec), bytes);
    }

    pub fn fail_write_after(&self, spec: &str, bytes: usize) {
        self.lock().fail_write_after.insert(key(spec), bytes);
    }

    /// Hold `open_write` for `spec` until the returned notify fires.
    pub fn gate_writes(&self, spec: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().gates.insert(key(spec), Arc::clone(&gate));
        gate
    }

    /// Bytes received so far by the writer for `spec`.
    pub fn written(&self, spec: &str) -> Option<Vec<u8>> {
        self.lock().written.get(&key(spec)).cloned()
    }

    pub fn written_keys(&self) -> Vec<String> {
        self.lock().written.keys().cloned().collect()
    }

    /// Whether the writer for `spec` was shut down cleanly.
    pub fn committed(&self, spec: &str) -> bool {
        self.lock().committed.contains(&key(spec))
    }
}

impl RemoteAccess for MemoryAccess {
    fn list_dir<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<Vec<String>>> {
        async move {
            let dir = location.to_string();
            let state = self.lock();
            if state.fail_list.contains(&dir) {
                return Err(Error::lookup(location, "injected list failure"));
            }
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            Ok(state
                .files
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(str::to_string)
                .collect())
        }
        .boxed()
    }

    fn stat<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<u64>> {
        async move {
            self.lock()
                .files
                .get(&location.to_string())
                .map(|b| b.len() as u64)
                .ok_or_else(|| Error::lookup(location, "no such file"))
        }
        .boxed()
    }

    fn open_read<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<ByteReader>> {
        async move {
            let key = location.to_string();
            let state = self.lock();
            let bytes = state
                .files
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::lookup(location, "no such file"))?;
            let fail_after = state.fail_read_after.get(&key).copied();
            Ok(Box::new(MemoryReader {
                bytes,
                position: 0,
                fail_after,
            }) as ByteReader)
        }
        .boxed()
    }

    fn open_write<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<ByteWriter>> {
        async move {
            let key = location.to_string();
            let gate = self.lock().gates.get(&key).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            let limit = {
                let mut state = self.lock();
                state.written.insert(key.clone(), Vec::new());
                state.fail_write_after.get(&key).copied()
            };
            Ok(Box::new(MemoryWriter {
                key,
                limit,
                state: Arc::clone(&self.state),
            }) as ByteWriter)
        }
        .boxed()
    }

    fn replica_count<'a>(&'a self, set: &'a PodRef) -> BoxFuture<'a, Result<usize>> {
        async move {
            self.lock()
                .replicas
                .get(&set.to_string())
                .copied()
                .ok_or_else(|| Error::lookup(set, "statefulset not found"))
        }
        .boxed()
    }
}

struct MemoryReader {
    bytes: Vec<u8>,
    position: usize,
    fail_after: Option<usize>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let end = match self.fail_after {
            Some(limit) if self.position >= limit => {
                return Poll::Ready(Err(io::Error::other("injected read failure")))
            }
            Some(limit) => limit.min(self.bytes.len()),
            None => self.bytes.len(),
        };
        let n = (end - self.position).min(buf.remaining());
        let start = self.position;
        buf.put_slice(&self.bytes[start..start + n]);
        self.position += n;
        Poll::Ready(Ok(()))
    }
}

struct MemoryWriter {
    key: String,
    limit: Option<usize>,
    state: Arc<Mutex<State>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        let written = state.written.entry(self.key.clone()).or_default();
        if let Some(limit) = self.limit {
            if written.len() + buf.len() > limit {
                return Poll::Ready(Err(io::Error::other("injected write failure")));
            }
        }
        written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        let bytes = state.written.get(&self.key).cloned().unwrap_or_default();
        state.files.insert(self.key.clone(), bytes);
        state.committed.insert(self.key.clone());
        Poll::Ready(Ok(()))
    }
}

/// [`ServiceRpc`] that records every call and fails the ones it is told to.
#[derive(Clone, Default)]
pub struct RecordingRpc {
    calls: Arc<Mutex<Vec<(String, RpcCall)>>>,
    failures: Arc<Mutex<HashSet<(String, &'static str)>>>,
}

impl RecordingRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail calls named `function` (wire name) against `endpoint`.
    pub fn fail(&self, endpoint: &str, function: &'static str) {
        self.failures.lock().unwrap().insert((endpoint.to_string(), function));
    }

    pub fn calls(&self) -> Vec<(String, RpcCall)> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls rendered as `endpoint call`, for compact assertions.
    pub fn log(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|(endpoint, call)| format!("{endpoint} {call}"))
            .collect()
    }
}

impl ServiceRpc for RecordingRpc {
    fn call<'a>(&'a self, endpoint: &'a Endpoint, call: RpcCall) -> BoxFuture<'a, Result<()>> {
        async move {
            let endpoint = endpoint.to_string();
            let failing = self
                .failures
                .lock()
                .unwrap()
                .contains(&(endpoint.clone(), call.name()));
            self.calls.lock().unwrap().push((endpoint.clone(), call.clone()));
            if failing {
                return Err(Error::Rpc {
                    endpoint,
                    call: call.to_string(),
                    reason: "injected failure".into(),
                });
            }
            Ok(())
        }
        .boxed()
    }
}
