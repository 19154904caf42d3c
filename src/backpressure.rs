//! Flow control between a byte producer and its consumer.
//!
//! [`BackpressureHandler::apply_backpressure`] moves the source into a
//! producer task and hands back a [`ControlledStream`]. The producer stays
//! parked until the consumer first polls the stream, so an unread stream
//! holds no decoded bytes. From then on it keeps count of bytes it has sent
//! but the consumer has not yet taken. Once that count exceeds the
//! high-water mark it stops pulling from the source, and it only resumes
//! when the count is back at or below the mark *and* the memory budget is
//! not exhausted.
//!
//! Must be called from within a Tokio runtime.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::BackpressureConfig;
use crate::error::{Error, Result};
use crate::memory::MemoryMonitor;

/// Maps memory usage (percent of budget) to an extra wait before the next
/// unit is accepted
pub type DelayPolicy = Arc<dyn Fn(f64) -> Duration + Send + Sync>;

/// Default tiers: ≥90% waits 100ms, ≥70% 50ms, ≥50% 10ms, otherwise none
pub fn tiered_delay(usage_percent: f64) -> Duration {
    if usage_percent >= 90.0 {
        Duration::from_millis(100)
    } else if usage_percent >= 70.0 {
        Duration::from_millis(50)
    } else if usage_percent >= 50.0 {
        Duration::from_millis(10)
    } else {
        Duration::ZERO
    }
}

/// Builds flow-controlled sources and sinks that share one memory monitor
#[derive(Clone)]
pub struct BackpressureHandler {
    monitor: Arc<MemoryMonitor>,
    config: BackpressureConfig,
    delay_policy: DelayPolicy,
    cancel: CancellationToken,
}

impl BackpressureHandler {
    pub fn new(monitor: Arc<MemoryMonitor>, config: BackpressureConfig) -> Self {
        Self {
            monitor,
            config,
            delay_policy: Arc::new(tiered_delay),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the adaptive delay tiers
    pub fn with_delay_policy(mut self, policy: DelayPolicy) -> Self {
        self.delay_policy = policy;
        self
    }

    /// Stop every producer built from this handler when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    /// Wrap `source` so its production pauses once more than
    /// `high_water_mark` bytes are buffered
    pub fn apply_backpressure<S>(&self, source: S, high_water_mark: usize) -> ControlledStream
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        self.spawn(source, high_water_mark, None)
    }

    /// [`apply_backpressure`](Self::apply_backpressure) at the configured
    /// mark, plus a usage-dependent delay before each unit is pulled
    pub fn apply_adaptive_backpressure<S>(&self, source: S) -> ControlledStream
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        self.spawn(
            source,
            self.config.high_water_mark,
            Some(Arc::clone(&self.delay_policy)),
        )
    }

    /// Wrap a writer so writes are refused once the budget is exhausted
    pub fn wrap_sink<W>(&self, writer: W) -> ControlledSink<W>
    where
        W: AsyncWrite + Unpin,
    {
        ControlledSink {
            inner: writer,
            monitor: Arc::clone(&self.monitor),
            written: 0,
        }
    }

    fn spawn<S>(&self, source: S, high_water_mark: usize, delay: Option<DelayPolicy>) -> ControlledStream
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            buffered: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            drained: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let producer = Producer {
            shared: Arc::clone(&shared),
            tx,
            monitor: Arc::clone(&self.monitor),
            high_water_mark,
            poll_interval: self.config.poll_interval,
            stall_timeout: self.config.stall_timeout,
            delay,
            cancel: self.cancel.clone(),
        };
        let task = tokio::spawn(producer.run(source.boxed()));

        ControlledStream { rx, shared, task }
    }
}

impl std::fmt::Debug for BackpressureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Shared {
    /// Bytes sent by the producer and not yet taken by the consumer
    buffered: AtomicUsize,
    paused: AtomicBool,
    /// Set by the consumer's first poll
    started: AtomicBool,
    /// Signalled on the first poll and whenever the consumer takes a unit
    drained: Notify,
}

struct Producer {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Result<Bytes>>,
    monitor: Arc<MemoryMonitor>,
    high_water_mark: usize,
    poll_interval: Duration,
    stall_timeout: Option<Duration>,
    delay: Option<DelayPolicy>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(self, mut source: futures::stream::BoxStream<'static, Result<Bytes>>) {
        if let Err(e) = self.wait_for_demand().await {
            let _ = self.tx.send(Err(e));
            return;
        }

        loop {
            if let Err(e) = self.wait_for_capacity().await {
                let _ = self.tx.send(Err(e));
                return;
            }
            if let Err(e) = self.adaptive_delay().await {
                let _ = self.tx.send(Err(e));
                return;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = self.tx.send(Err(Error::Cancelled));
                    return;
                }
                next = source.next() => next,
            };

            match next {
                Some(Ok(unit)) => {
                    self.shared.buffered.fetch_add(unit.len(), Ordering::SeqCst);
                    if self.tx.send(Ok(unit)).is_err() {
                        // consumer is gone
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = self.tx.send(Err(e));
                    return;
                }
                None => return,
            }
        }
    }

    /// Suspend until the consumer polls for the first time
    async fn wait_for_demand(&self) -> Result<()> {
        while !self.shared.started.load(Ordering::SeqCst) {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shared.drained.notified() => {}
            }
        }
        Ok(())
    }

    /// Suspend until buffered bytes are at or below the mark and the budget
    /// allows more work
    async fn wait_for_capacity(&self) -> Result<()> {
        let mut stalled_since: Option<Instant> = None;

        loop {
            let buffered = self.shared.buffered.load(Ordering::SeqCst);
            let within_budget = !self.monitor.is_over_limit();
            if buffered <= self.high_water_mark && within_budget {
                if self.shared.paused.swap(false, Ordering::SeqCst) {
                    trace!(buffered, "producer resumed");
                }
                return Ok(());
            }

            if !self.shared.paused.swap(true, Ordering::SeqCst) {
                trace!(
                    buffered,
                    high_water_mark = self.high_water_mark,
                    within_budget,
                    "producer paused"
                );
            }

            // nothing buffered means the consumer cannot relieve the pressure
            if !within_budget && buffered == 0 {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if self.stall_timeout.is_some_and(|limit| since.elapsed() >= limit) {
                    debug!("producer stalled on exhausted memory budget");
                    self.monitor.ensure_within_budget()?;
                }
            } else {
                stalled_since = None;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shared.drained.notified() => {}
                _ = tokio::time::sleep(self.poll_interval), if !within_budget => {}
            }
        }
    }

    async fn adaptive_delay(&self) -> Result<()> {
        let Some(policy) = &self.delay else {
            return Ok(());
        };
        let delay = policy(self.monitor.usage_percentage());
        if delay.is_zero() {
            return Ok(());
        }
        trace!(delay_ms = delay.as_millis() as u64, "adaptive delay");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Consumer side of a flow-controlled source
///
/// Yields the source's units in order, followed by its error if it failed.
/// Nothing is pulled from the source before the first poll. Dropping the
/// stream stops the producer.
pub struct ControlledStream {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl ControlledStream {
    /// Bytes produced but not yet consumed
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    /// Whether the producer is currently holding off the source
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }
}

impl Stream for ControlledStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.shared.started.swap(true, Ordering::SeqCst) {
            this.shared.drained.notify_one();
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(unit))) => {
                this.shared.buffered.fetch_sub(unit.len(), Ordering::SeqCst);
                this.shared.drained.notify_one();
                Poll::Ready(Some(Ok(unit)))
            }
            other => other,
        }
    }
}

impl Drop for ControlledStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Writer that refuses writes once the memory budget is exhausted
///
/// A refused write is failed, never buffered.
pub struct ControlledSink<W> {
    inner: W,
    monitor: Arc<MemoryMonitor>,
    written: u64,
}

impl<W: AsyncWrite + Unpin> ControlledSink<W> {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.monitor.ensure_within_budget()?;
        self.inner
            .write_all(data)
            .await
            .map_err(|e| Error::stream("writing to sink", e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .await
            .map_err(|e| Error::stream("flushing sink", e))
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| Error::stream("closing sink", e))
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
