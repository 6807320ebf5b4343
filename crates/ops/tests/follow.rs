#![forbid(unsafe_code)]

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{anyhow, Result};
use hydro_ops::{follow_run, ContainerClient, LogReader};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Serves a canned output, optionally failing once it is exhausted.
struct Canned {
    output: &'static [u8],
    fail_after: bool,
    attach_error: bool,
}

struct CannedReader {
    data: &'static [u8],
    fail_after: bool,
}

impl AsyncRead for CannedReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.data.is_empty() {
            if self.fail_after {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "engine went away")));
            }
            return Poll::Ready(Ok(()));
        }
        let n = buf.remaining().min(self.data.len());
        buf.put_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl ContainerClient for Canned {
    async fn attach(&self, id: &str) -> Result<LogReader> {
        if self.attach_error {
            return Err(anyhow!("no such container: {id}"));
        }
        Ok(Box::pin(CannedReader { data: self.output, fail_after: self.fail_after }))
    }
}

#[tokio::test]
async fn forwards_every_line_in_order() {
    let client = Canned { output: b"1\n2\n3\n4\n5\n", fail_after: false, attach_error: false };
    let mut seen = Vec::new();
    let n = follow_run(&client, "c1", CancellationToken::new(), |l| seen.push(l.to_string())).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(seen, vec!["1", "2", "3", "4", "5"]);
}

#[tokio::test]
async fn read_error_surfaces_to_the_caller() {
    let client = Canned { output: b"", fail_after: true, attach_error: false };
    let mut seen = 0usize;
    let err = follow_run(&client, "c1", CancellationToken::new(), |_| seen += 1).await.unwrap_err();
    assert_eq!(seen, 0);
    assert!(format!("{err:#}").contains("engine went away"));
}

#[tokio::test]
async fn attach_error_forwards_nothing() {
    let client = Canned { output: b"x\n", fail_after: false, attach_error: true };
    let mut seen = 0usize;
    let err = follow_run(&client, "ghost", CancellationToken::new(), |_| seen += 1).await.unwrap_err();
    assert_eq!(seen, 0);
    assert!(format!("{err:#}").contains("no such container: ghost"));
}

#[tokio::test]
async fn cancelled_token_stops_before_reading() {
    let client = Canned { output: b"a\nb\n", fail_after: false, attach_error: false };
    let cancel = CancellationToken::new();
    cancel.cancel();
    let n = follow_run(&client, "c1", cancel, |_| {}).await.unwrap();
    assert_eq!(n, 0);
}
