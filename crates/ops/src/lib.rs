//! Hydro ops: follow a container's output line by line.

#![forbid(unsafe_code)]

use std::pin::Pin;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// Container engine contract: attach to a container's combined output.
#[async_trait::async_trait]
pub trait ContainerClient: Send + Sync {
    async fn attach(&self, id: &str) -> Result<LogReader>;
}

/// Attaches through `docker logs --follow`.
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self { bin: std::env::var("HYDRO_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()) }
    }
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self { Self { bin: bin.into() } }
}

#[async_trait::async_trait]
impl ContainerClient for DockerCli {
    async fn attach(&self, id: &str) -> Result<LogReader> {
        debug!(bin = %self.bin, container = %id, "attaching");
        let mut child = Command::new(&self.bin)
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} logs", self.bin))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("{} produced no stdout", self.bin))?;
        // Keep the child alive for as long as the reader is; dropping it kills the process.
        Ok(Box::pin(ChildOutput { _child: child, out: stdout }))
    }
}

struct ChildOutput {
    _child: tokio::process::Child,
    out: tokio::process::ChildStdout,
}

impl AsyncRead for ChildOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.out).poll_read(cx, buf)
    }
}

/// Attach to `id` and hand every complete line to `sink` until the stream
/// ends or `cancel` fires. A trailing partial line is flushed at EOF.
/// Returns the number of lines forwarded.
pub async fn follow_run<F>(client: &dyn ContainerClient, id: &str, cancel: CancellationToken, mut sink: F) -> Result<usize>
where
    F: FnMut(&str),
{
    let reader = client.attach(id).await.with_context(|| format!("attaching to {id}"))?;
    info!(container = %id, "following output");
    let n = pump_lines(ReaderStream::new(reader), &cancel, &mut sink)
        .await
        .with_context(|| format!("reading output of {id}"))?;
    info!(container = %id, lines = n, "output ended");
    Ok(n)
}

async fn pump_lines<S, F>(stream: S, cancel: &CancellationToken, sink: &mut F) -> std::io::Result<usize>
where
    S: futures::Stream<Item = std::io::Result<bytes::Bytes>>,
    F: FnMut(&str),
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let mut lines = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => { debug!("follow cancelled"); return Ok(lines); }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(pos);
                        let _ = buf.split_to(1); // '\n'
                        sink(String::from_utf8_lossy(&line).trim_end_matches('\r'));
                        lines += 1;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, lines, "output stream error");
                    return Err(e);
                }
                None => break,
            }
        }
    }
    if !buf.is_empty() {
        sink(String::from_utf8_lossy(&buf).as_ref());
        lines += 1;
    }
    Ok(lines)
}
