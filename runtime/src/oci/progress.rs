//! Progress-tracking reader.
//!
//! Wraps a byte stream (blocking `Read` or tokio `AsyncRead`), counts bytes,
//! measures throughput and reports through a callback at most once per
//! interval plus once at end of stream. An optional deadline turns every
//! read after it into a `TimedOut` error; a cancelled token fails reads too,
//! including one already waiting on a stalled stream.

use std::future::Future;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

/// Default minimum time between two progress callbacks.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Short label of the stream (e.g. the tail of a layer digest)
    pub label: String,
    /// Bytes read so far
    pub transferred: u64,
    /// Expected total, 0 if unknown
    pub total: u64,
    /// Average throughput since the first read
    pub bytes_per_sec: f64,
    /// True for the final update at end of stream
    pub finished: bool,
}

impl ProgressUpdate {
    /// Completion in percent, if the total is known.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some((self.transferred as f64 / self.total as f64 * 100.0).min(100.0))
        }
    }
}

/// Receives progress updates from a running build.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

pub type ProgressCallback = Box<dyn FnMut(&ProgressUpdate) + Send>;

pub struct ProgressReader<R> {
    inner: R,
    label: String,
    total: u64,
    transferred: u64,
    started: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
    deadline: Option<Instant>,
    deadline_timer: Option<Pin<Box<Sleep>>>,
    cancel: Option<CancellationToken>,
    cancel_wait: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    callback: Option<ProgressCallback>,
    finished: bool,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, label: impl Into<String>, total: u64) -> Self {
        Self {
            inner,
            label: label.into(),
            total,
            transferred: 0,
            started: Instant::now(),
            last_emit: None,
            interval: DEFAULT_PROGRESS_INTERVAL,
            deadline: None,
            deadline_timer: None,
            cancel: None,
            cancel_wait: None,
            callback: None,
            finished: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fail reads with `TimedOut` once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Fail reads once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(&ProgressUpdate) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.transferred as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn check_interrupted(&self) -> io::Result<()> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(cancelled_error(&self.label));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(deadline_error(&self.label)),
            _ => Ok(()),
        }
    }

    /// Account for one completed read of `n` bytes (0 = end of stream).
    fn record(&mut self, n: usize, requested: usize) {
        self.transferred += n as u64;
        let eof = n == 0 && requested > 0;
        if eof && self.finished {
            return;
        }
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if eof || due {
            self.finished = eof;
            self.last_emit = Some(now);
            self.emit(eof);
        }
    }

    fn emit(&mut self, finished: bool) {
        if self.callback.is_none() {
            return;
        }
        let update = ProgressUpdate {
            label: self.label.clone(),
            transferred: self.transferred,
            total: self.total,
            bytes_per_sec: self.bytes_per_sec(),
            finished,
        };
        if let Some(callback) = self.callback.as_mut() {
            callback(&update);
        }
    }
}

fn deadline_error(label: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("deadline exceeded while reading {}", label),
    )
}

fn cancelled_error(label: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("cancelled while reading {}", label),
    )
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_interrupted()?;
        let n = self.inner.read(buf)?;
        self.record(n, buf.len());
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_interrupted()?;

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.record(n, buf.remaining() + n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if let Some(token) = &this.cancel {
                    let wait = this.cancel_wait.get_or_insert_with(|| {
                        let token = token.clone();
                        let wait: Pin<Box<dyn Future<Output = ()> + Send>> =
                            Box::pin(async move { token.cancelled().await });
                        wait
                    });
                    if wait.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(cancelled_error(&this.label)));
                    }
                }
                // A stalled stream must still observe the deadline.
                let Some(deadline) = this.deadline else {
                    return Poll::Pending;
                };
                let timer = this.deadline_timer.get_or_insert_with(|| {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        deadline,
                    )))
                });
                match timer.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(deadline_error(&this.label))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}
