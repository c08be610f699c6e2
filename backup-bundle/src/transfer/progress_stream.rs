//! Byte-counting stream wrapper for archive uploads.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Callback for progress updates: (bytes so far, expected total)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Stream wrapper that counts bytes passing through it.
///
/// The count is shared through an atomic so the uploader can compare it with
/// the announced object size once the request finishes.
pub struct ProgressStream<S> {
    inner: S,
    transferred: Arc<AtomicU64>,
    expected: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: Option<ProgressCallback>,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, expected: u64) -> Self {
        Self {
            inner,
            transferred: Arc::new(AtomicU64::new(0)),
            expected,
            last_update: Instant::now(),
            update_interval: Duration::from_secs(5),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Shared counter of bytes yielded so far
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.transferred)
    }

    fn report(&self, done: u64) {
        if let Some(callback) = &self.callback {
            callback(done, self.expected);
        }
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
                let done = self
                    .transferred
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed)
                    + bytes.len() as u64;

                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.update_interval {
                    self.report(done);
                    self.last_update = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                let done = self.transferred.load(Ordering::Relaxed);
                self.report(done);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_counts_all_chunks() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
        ];
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);

        let stream = ProgressStream::new(futures_util::stream::iter(chunks), 8).with_callback(
            Arc::new(move |done, total| sink.lock().unwrap().push((done, total))),
        );
        let counter = stream.counter();

        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected.len(), 2);
        assert_eq!(counter.load(Ordering::Relaxed), 8);
        assert_eq!(reports.lock().unwrap().last(), Some(&(8, 8)));
    }
}
