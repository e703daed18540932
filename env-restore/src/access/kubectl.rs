//! [`RemoteAccess`] backed by the `kubectl` and `ssh` command line tools.
//!
//! Pods are reached with `kubectl exec`, hosts with `ssh`. Reads and writes
//! stream through the child's stdout/stdin; the child's exit status is
//! checked when the stream ends so a failed `cat` surfaces as an I/O error
//! instead of a silently short file.
//!
//! Writes land in `<path>.partial` and are renamed into place only after a
//! clean shutdown. A writer dropped before that kills the remote `cat` and
//! removes the partial file.

use super::{ByteReader, ByteWriter, RemoteAccess};
use crate::location::{Location, PodRef};
use crate::utils::errors::{Error, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Kubectl {
    kubectl: String,
    context: Option<String>,
    ssh: String,
}

impl Kubectl {
    pub fn new(kubectl: impl Into<String>, context: Option<String>, ssh: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
            context,
            ssh: ssh.into(),
        }
    }

    /// Command running `script` through `sh -c` where `location` lives.
    fn shell(&self, location: &Location, script: &str) -> Result<Command> {
        match location {
            Location::Pod { pod, .. } => {
                let mut cmd = self.kubectl_command();
                cmd.arg("exec").arg("-i").arg("-n").arg(&pod.namespace).arg(&pod.name);
                if let Some(container) = &pod.container {
                    cmd.arg("-c").arg(container);
                }
                cmd.arg("--").arg("sh").arg("-c").arg(script);
                Ok(cmd)
            }
            Location::Host { host, .. } => {
                let mut cmd = Command::new(&self.ssh);
                cmd.arg("-o").arg("BatchMode=yes").arg(host).arg(script);
                Ok(cmd)
            }
            other => Err(Error::Configuration(format!(
                "{other} is not reachable through kubectl or ssh"
            ))),
        }
    }

    fn kubectl_command(&self) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd
    }

    async fn output(&self, mut cmd: Command, target: &str) -> Result<String> {
        debug!("Running remote command {:?}", cmd);
        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::lookup(target, e))?;

        if !output.status.success() {
            return Err(Error::lookup(
                target,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Kubectl {
    /// Lazy future running `script` at `location`; nothing runs until polled.
    fn remote_script(&self, location: &Location, script: String) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let location = location.clone();
        async move {
            let cmd = this.shell(&location, &script)?;
            this.output(cmd, &location.to_string()).await.map(|_| ())
        }
        .boxed()
    }
}

impl RemoteAccess for Kubectl {
    fn list_dir<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<Vec<String>>> {
        async move {
            let script = format!("ls -1 -- {}", shell_quote(&location.path_str()));
            let stdout = self.output(self.shell(location, &script)?, &location.to_string()).await?;
            Ok(stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect())
        }
        .boxed()
    }

    fn stat<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<u64>> {
        async move {
            let script = format!("stat -c %s -- {}", shell_quote(&location.path_str()));
            let stdout = self.output(self.shell(location, &script)?, &location.to_string()).await?;
            stdout
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::lookup(location, format!("unexpected stat output {stdout:?}: {e}")))
        }
        .boxed()
    }

    fn open_read<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<ByteReader>> {
        async move {
            let script = format!("cat -- {}", shell_quote(&location.path_str()));
            let mut cmd = self.shell(location, &script)?;
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|e| Error::lookup(location, e))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::lookup(location, "child stdout not captured"))?;

            Ok(Box::new(ChildReader {
                stdout,
                exit: Some(spawn_exit_watch(child)),
            }) as ByteReader)
        }
        .boxed()
    }

    fn open_write<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<ByteWriter>> {
        async move {
            let path = location.path_str();
            let partial = format!("{path}{PARTIAL_SUFFIX}");
            let dir = path.rsplit_once('/').map(|(d, _)| d).filter(|d| !d.is_empty()).unwrap_or("/");
            let script = format!(
                "mkdir -p -- {} && cat > {}",
                shell_quote(dir),
                shell_quote(&partial)
            );
            let mut cmd = self.shell(location, &script)?;
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|e| Error::transfer(location, e))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::transfer(location, "child stdin not captured"))?;

            let commit = self.remote_script(
                location,
                format!("mv -f -- {} {}", shell_quote(&partial), shell_quote(&path)),
            );
            let discard = self.remote_script(location, format!("rm -f -- {}", shell_quote(&partial)));

            Ok(Box::new(ChildWriter {
                stdin: Some(stdin),
                exit: Some(spawn_exit_watch(child)),
                commit: Some(commit),
                discard: Some(discard),
            }) as ByteWriter)
        }
        .boxed()
    }

    fn replica_count<'a>(&'a self, set: &'a PodRef) -> BoxFuture<'a, Result<usize>> {
        async move {
            let mut cmd = self.kubectl_command();
            cmd.arg("get")
                .arg("statefulset")
                .arg(&set.name)
                .arg("-n")
                .arg(&set.namespace)
                .arg("-o")
                .arg("jsonpath={.status.replicas}");
            let target = format!("statefulset {set}");
            let stdout = self.output(cmd, &target).await?;
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed
                .parse::<usize>()
                .map_err(|e| Error::lookup(&target, format!("unexpected replica count {trimmed:?}: {e}")))
        }
        .boxed()
    }
}

/// Suffix of a remote file still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

type ExitWatch = JoinHandle<io::Result<(ExitStatus, String)>>;

/// Wait for the child in the background, draining stderr so it never blocks.
fn spawn_exit_watch(mut child: Child) -> ExitWatch {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut message = String::new();
        if let Some(mut stderr) = stderr {
            stderr.read_to_string(&mut message).await?;
        }
        let status = child.wait().await?;
        Ok((status, message))
    })
}

fn poll_exit(exit: &mut Option<ExitWatch>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let Some(handle) = exit.as_mut() else {
        return Poll::Ready(Ok(()));
    };
    let joined = ready!(handle.poll_unpin(cx));
    *exit = None;

    match joined {
        Ok(Ok((status, _))) if status.success() => Poll::Ready(Ok(())),
        Ok(Ok((status, stderr))) => Poll::Ready(Err(io::Error::other(format!(
            "remote command exited with {status}: {}",
            stderr.trim()
        )))),
        Ok(Err(e)) => Poll::Ready(Err(e)),
        Err(e) => Poll::Ready(Err(io::Error::other(e))),
    }
}

struct ChildReader {
    stdout: ChildStdout,
    exit: Option<ExitWatch>,
}

impl AsyncRead for ChildReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }
        // EOF on stdout: only a clean exit makes it a real end of file.
        poll_exit(&mut self.exit, cx)
    }
}

struct ChildWriter {
    stdin: Option<ChildStdin>,
    exit: Option<ExitWatch>,
    commit: Option<BoxFuture<'static, Result<()>>>,
    discard: Option<BoxFuture<'static, Result<()>>>,
}

impl ChildWriter {
    fn stdin(&mut self) -> io::Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer already shut down"))
    }
}

impl AsyncWrite for ChildWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let stdin = self.stdin()?;
        Pin::new(stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            ready!(Pin::new(stdin).poll_shutdown(cx))?;
            // Closing stdin is what lets the remote `cat` finish.
            self.stdin = None;
        }
        ready!(poll_exit(&mut self.exit, cx))?;

        if let Some(commit) = self.commit.as_mut() {
            let committed = ready!(commit.poll_unpin(cx));
            self.commit = None;
            committed.map_err(io::Error::other)?;
            self.discard = None;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for ChildWriter {
    fn drop(&mut self) {
        if self.discard.is_none() {
            return;
        }
        // Not committed: the partial file is never renamed into place.
        if let Some(exit) = self.exit.take() {
            exit.abort();
        }
        self.stdin = None;

        if let (Some(discard), Ok(runtime)) =
            (self.discard.take(), tokio::runtime::Handle::try_current())
        {
            runtime.spawn(async move {
                if let Err(e) = discard.await {
                    warn!("Failed to remove partial upload: {}", e);
                }
            });
        }
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
