//! Remote procedure calls against managed services.
//!
//! Every call is a JSON envelope `{"UUID", "Fn", "Body"}` POSTed to
//! `http://<host>:<port>/rpc`. A reply with an `"Error"` field, or a non-2xx
//! status, fails the call.

use super::Endpoint;
use crate::utils::errors::{Error, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// The operations a managed service exposes to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCall {
    /// Take an internal snapshot
    Backup,
    /// Clear the data store
    Reset,
    /// Load the staged file at `path`
    Restore { path: String },
    /// Realign the replicated log with freshly restored data
    RealignLog,
    /// Open (`accept = true`) or close the traffic gate
    StartStop { accept: bool },
    /// Block until in-flight requests have drained
    WaitForDrain,
}

impl RpcCall {
    /// Function name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::Backup => "Backup",
            RpcCall::Reset => "Reset",
            RpcCall::Restore { .. } => "Restore",
            RpcCall::RealignLog => "LogRealign",
            RpcCall::StartStop { .. } => "StartStop",
            RpcCall::WaitForDrain => "WaitForDrain",
        }
    }

    fn body(&self) -> Value {
        match self {
            RpcCall::Restore { path } => json!({ "Path": path }),
            RpcCall::StartStop { accept } => json!({ "Accept": accept }),
            _ => json!({}),
        }
    }
}

impl fmt::Display for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcCall::Restore { path } => write!(f, "Restore({path})"),
            RpcCall::StartStop { accept } => write!(f, "StartStop({accept})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Transport for [`RpcCall`]s. The named helpers are what workflows use.
pub trait ServiceRpc: Send + Sync {
    fn call<'a>(&'a self, endpoint: &'a Endpoint, call: RpcCall) -> BoxFuture<'a, Result<()>>;

    fn backup<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<()>> {
        self.call(endpoint, RpcCall::Backup)
    }

    fn reset<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<()>> {
        self.call(endpoint, RpcCall::Reset)
    }

    fn restore<'a>(&'a self, endpoint: &'a Endpoint, path: &str) -> BoxFuture<'a, Result<()>> {
        self.call(endpoint, RpcCall::Restore { path: path.to_string() })
    }

    fn realign_log<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<()>> {
        self.call(endpoint, RpcCall::RealignLog)
    }

    fn start_stop<'a>(&'a self, endpoint: &'a Endpoint, accept: bool) -> BoxFuture<'a, Result<()>> {
        self.call(endpoint, RpcCall::StartStop { accept })
    }

    fn wait_for_drain<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<()>> {
        self.call(endpoint, RpcCall::WaitForDrain)
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(rename = "UUID")]
    uuid: Uuid,
    #[serde(rename = "Fn")]
    function: &'a str,
    #[serde(rename = "Body")]
    body: Value,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

/// [`ServiceRpc`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    client: Client,
}

impl HttpServiceClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn send(&self, endpoint: &Endpoint, call: &RpcCall) -> Result<()> {
        let url = format!("http://{endpoint}/rpc");
        let envelope = Envelope {
            uuid: Uuid::new_v4(),
            function: call.name(),
            body: call.body(),
        };
        debug!("RPC {} -> {} ({})", call, endpoint, envelope.uuid);

        let rpc_error = |reason: String| Error::Rpc {
            endpoint: endpoint.to_string(),
            call: call.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| rpc_error(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| rpc_error(e.to_string()))?;
        if !status.is_success() {
            return Err(rpc_error(format!("status {status}: {}", text.trim())));
        }

        // An empty body is a plain acknowledgement.
        if text.trim().is_empty() {
            return Ok(());
        }
        let reply: Reply = serde_json::from_str(&text)?;
        match reply.error {
            Some(error) if !error.is_empty() => Err(rpc_error(error)),
            _ => Ok(()),
        }
    }
}

impl ServiceRpc for HttpServiceClient {
    fn call<'a>(&'a self, endpoint: &'a Endpoint, call: RpcCall) -> BoxFuture<'a, Result<()>> {
        async move { self.send(endpoint, &call).await }.boxed()
    }
}
