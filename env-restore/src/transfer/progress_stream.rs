//! Progress-counting stream wrapper.

use super::progress::ProgressFn;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Stream wrapper that reports the bytes passing through it.
///
/// Increments are batched and flushed at most every `update_interval`, plus
/// once at the end of the stream, so the callback always sees every byte.
pub struct ProgressStream<S> {
    inner: S,
    bytes_seen: u64,
    pending: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: ProgressFn,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, callback: ProgressFn) -> Self {
        Self::with_interval(inner, callback, Duration::from_millis(100))
    }

    pub fn with_interval(inner: S, callback: ProgressFn, update_interval: Duration) -> Self {
        Self {
            inner,
            bytes_seen: 0,
            pending: 0,
            last_update: Instant::now(),
            update_interval,
            callback,
        }
    }

    /// Total bytes that passed through the stream
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    fn flush(&mut self) {
        if self.pending > 0 {
            (self.callback)(self.pending);
            self.pending = 0;
        }
        self.last_update = Instant::now();
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let chunk_size = bytes.len() as u64;
                self.bytes_seen += chunk_size;
                self.pending += chunk_size;

                if self.last_update.elapsed() >= self.update_interval {
                    self.flush();
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.flush();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.flush();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reports_every_byte_on_completion() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let callback: ProgressFn = Arc::new(move |n| {
            sink.fetch_add(n, Ordering::Relaxed);
        });

        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
            Ok(Bytes::from_static(b"")),
        ];
        let mut progress =
            ProgressStream::with_interval(stream::iter(chunks), callback, Duration::from_secs(3600));

        while let Some(chunk) = progress.next().await {
            chunk.unwrap();
        }

        assert_eq!(progress.bytes_seen(), 8);
        assert_eq!(seen.load(Ordering::Relaxed), 8);
    }
}
