//! Archive stream extraction under a memory budget.
//!
//! [`ArchiveStreamExtractor`] enumerates an archive's records in directory
//! order and turns each admitted record into an [`ArchiveEntry`] whose
//! content is a backpressure-controlled stream. Two modes are offered:
//!
//! - [`extract`](ArchiveStreamExtractor::extract) collects every entry and
//!   hands them back together. Success is all-or-nothing: on failure every
//!   stream opened so far is dropped, which stops its producer.
//! - [`extract_with`](ArchiveStreamExtractor::extract_with) feeds entries to
//!   an [`EntryHandler`] on up to `workers` concurrent workers. Each worker
//!   passes memory admission before it opens an entry.
//!
//! In both modes only the orchestrating loop touches the progress tracker.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveEntry, ArchiveReader, EntryRecord};
use crate::backpressure::{BackpressureHandler, ControlledStream, DelayPolicy};
use crate::config::ExtractConfig;
use crate::error::{BoxError, Error, ExtractionState, Result};
use crate::filter::{EntryFilter, FilterCriteria};
use crate::memory::{MemoryBudget, MemoryMonitor};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::zip::ZipArchiveReader;

/// Per-entry callback, run by the orchestrator after an entry is yielded
pub type EntryCallback =
    Arc<dyn Fn(&EntryRecord) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Consumer of admitted entries in [`ArchiveStreamExtractor::extract_with`]
///
/// Up to `workers` calls run concurrently. Errors from reading the entry's
/// content should be returned as they are; failures of the handler's own
/// work can be wrapped with [`Error::callback`].
#[async_trait]
pub trait EntryHandler: Send + Sync {
    async fn handle(&self, entry: ArchiveEntry) -> Result<()>;
}

/// Runtime options for one extractor
#[derive(Clone, Default)]
pub struct ExtractOptions {
    pub config: ExtractConfig,
    /// Entries this filter rejects are skipped; `None` admits everything
    pub filter: Option<Arc<EntryFilter>>,
    /// Shared monitor; when absent one is built over the process probe
    pub monitor: Option<Arc<MemoryMonitor>>,
    pub on_entry: Option<EntryCallback>,
    pub on_progress: Option<ProgressCallback>,
    /// Use adaptive backpressure with this delay policy
    pub delay_policy: Option<DelayPolicy>,
    pub cancel: CancellationToken,
}

impl ExtractOptions {
    /// Options from a loaded config, compiling its filter section
    pub fn from_config(config: ExtractConfig) -> Result<Self> {
        config.validate()?;
        let filter = match &config.filter {
            Some(filter_config) => Some(Arc::new(EntryFilter::new(
                FilterCriteria::from_config(filter_config),
            )?)),
            None => None,
        };
        Ok(Self {
            config,
            filter,
            ..Self::default()
        })
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<MemoryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_entry_callback(mut self, callback: EntryCallback) -> Self {
        self.on_entry = Some(callback);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_delay_policy(mut self, policy: DelayPolicy) -> Self {
        self.delay_policy = Some(policy);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

impl std::fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("config", &self.config)
            .field("filter", &self.filter.is_some())
            .field("monitor", &self.monitor)
            .field("on_entry", &self.on_entry.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("delay_policy", &self.delay_policy.is_some())
            .finish()
    }
}

/// Summary of a successful [`extract_with`](ArchiveStreamExtractor::extract_with) run
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionReport {
    pub state: ExtractionState,
    /// Records enumerated from the archive
    pub entries_total: usize,
    /// Entries handed to the handler
    pub entries_processed: usize,
    /// Entries the filter left out
    pub entries_skipped: usize,
    /// Sum of the declared sizes of processed entries
    pub bytes_declared: u64,
    pub elapsed: Duration,
}

enum Outcome {
    Processed(EntryRecord),
    Skipped(EntryRecord),
}

/// Memory-bounded extractor
pub struct ArchiveStreamExtractor {
    options: ExtractOptions,
    monitor: Arc<MemoryMonitor>,
    backpressure: BackpressureHandler,
}

impl ArchiveStreamExtractor {
    pub fn new(options: ExtractOptions) -> Result<Self> {
        options.config.validate()?;

        let monitor = match &options.monitor {
            Some(monitor) => Arc::clone(monitor),
            None => Arc::new(MemoryMonitor::for_process(MemoryBudget::from_config(
                &options.config.memory,
            )?)),
        };

        let mut backpressure =
            BackpressureHandler::new(Arc::clone(&monitor), options.config.backpressure.clone())
                .with_cancellation(options.cancel.clone());
        if let Some(policy) = &options.delay_policy {
            backpressure = backpressure.with_delay_policy(Arc::clone(policy));
        }

        Ok(Self {
            options,
            monitor,
            backpressure,
        })
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    /// Extract every admitted entry of a ZIP archive held in memory
    pub async fn extract(&self, data: impl Into<Bytes>) -> Result<Vec<ArchiveEntry>> {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::archive_open("archive is empty"));
        }
        self.extract_from(&ZipArchiveReader::from_bytes(data)).await
    }

    /// Extract every admitted entry from any archive reader
    pub async fn extract_from<A>(&self, reader: &A) -> Result<Vec<ArchiveEntry>>
    where
        A: ArchiveReader + ?Sized,
    {
        let started = Instant::now();
        let records = self.enumerate(reader).await?;
        let mut tracker = self.tracker(records.len());
        let mut entries = Vec::new();

        for (position, record) in records.into_iter().enumerate() {
            self.ensure_not_cancelled()?;

            if self.admits(&record) {
                let entry = self.open_entry(reader, record).await?;
                self.after_entry(&mut tracker, position + 1, Some(entry.record()))?;
                entries.push(entry);
            } else {
                self.after_entry(&mut tracker, position + 1, None)?;
            }
        }

        info!(
            entries = entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction completed"
        );
        Ok(entries)
    }

    /// Run `handler` over every admitted entry of a ZIP archive held in memory
    pub async fn extract_with<H>(&self, data: impl Into<Bytes>, handler: &H) -> Result<ExtractionReport>
    where
        H: EntryHandler + ?Sized,
    {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::archive_open("archive is empty"));
        }
        self.extract_with_from(&ZipArchiveReader::from_bytes(data), handler)
            .await
    }

    /// Run `handler` over every admitted entry from any archive reader
    pub async fn extract_with_from<A, H>(&self, reader: &A, handler: &H) -> Result<ExtractionReport>
    where
        A: ArchiveReader + ?Sized,
        H: EntryHandler + ?Sized,
    {
        let started = Instant::now();
        let records = self.enumerate(reader).await?;
        let entries_total = records.len();
        let mut tracker = self.tracker(entries_total);

        let workers = self.options.config.workers.max(1);
        let mut outcomes = stream::iter(records)
            .map(|record| self.process(reader, handler, record))
            .buffer_unordered(workers);

        let mut report = ExtractionReport {
            state: ExtractionState::Completed,
            entries_total,
            entries_processed: 0,
            entries_skipped: 0,
            bytes_declared: 0,
            elapsed: Duration::ZERO,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.options.cancel.cancelled() => return Err(Error::Cancelled),
                next = outcomes.next() => next,
            };
            let Some(outcome) = next else { break };

            let done = report.entries_processed + report.entries_skipped + 1;
            match outcome? {
                Outcome::Processed(record) => {
                    report.entries_processed += 1;
                    report.bytes_declared += record.uncompressed_size;
                    self.after_entry(&mut tracker, done, Some(&record))?;
                }
                Outcome::Skipped(_) => {
                    report.entries_skipped += 1;
                    self.after_entry(&mut tracker, done, None)?;
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            processed = report.entries_processed,
            skipped = report.entries_skipped,
            bytes = report.bytes_declared,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "extraction completed"
        );
        Ok(report)
    }

    async fn process<A, H>(&self, reader: &A, handler: &H, record: EntryRecord) -> Result<Outcome>
    where
        A: ArchiveReader + ?Sized,
        H: EntryHandler + ?Sized,
    {
        if !self.admits(&record) {
            return Ok(Outcome::Skipped(record));
        }
        let entry = self.open_entry(reader, record).await?;
        let record = entry.record().clone();
        handler.handle(entry).await?;
        debug!(entry = %record.name, "entry handled");
        Ok(Outcome::Processed(record))
    }

    async fn enumerate<A>(&self, reader: &A) -> Result<Vec<EntryRecord>>
    where
        A: ArchiveReader + ?Sized,
    {
        self.ensure_not_cancelled()?;
        self.monitor.ensure_within_budget()?;

        let records = reader.records().await?;
        info!(
            entries = records.len(),
            workers = self.options.config.workers,
            limit = ?self.monitor.budget().limit_bytes(),
            "extraction started"
        );
        Ok(records)
    }

    fn admits(&self, record: &EntryRecord) -> bool {
        self.options
            .filter
            .as_ref()
            .is_none_or(|filter| filter.matches(record))
    }

    /// Turn a record into an entry, opening and wrapping its content stream
    async fn open_entry<A>(&self, reader: &A, record: EntryRecord) -> Result<ArchiveEntry>
    where
        A: ArchiveReader + ?Sized,
    {
        if record.is_directory {
            debug!(entry = %record.name, "directory entry");
            return Ok(ArchiveEntry::directory(record));
        }

        self.admit(&record.name).await?;

        let source = reader
            .open(&record)
            .await
            .map_err(|e| Error::entry_open(&record.name, e))?;
        debug!(entry = %record.name, size = record.uncompressed_size, "entry opened");

        Ok(ArchiveEntry::file(record, self.wrap(source)))
    }

    fn wrap(&self, source: crate::archive::ByteStream) -> ControlledStream {
        if self.options.delay_policy.is_some() {
            self.backpressure.apply_adaptive_backpressure(source)
        } else {
            self.backpressure
                .apply_backpressure(source, self.options.config.backpressure.high_water_mark)
        }
    }

    /// Wait, with bounded retries and backoff, for room in the memory budget
    async fn admit(&self, name: &str) -> Result<()> {
        let policy = &self.options.config.admission;
        let mut delay = policy.initial_delay;

        for attempt in 1..=policy.max_retries {
            if !self.monitor.is_over_limit() {
                return Ok(());
            }
            warn!(
                entry = %name,
                attempt,
                usage = self.monitor.current_usage(),
                delay_ms = delay.as_millis() as u64,
                "memory budget exhausted, delaying entry admission"
            );
            tokio::select! {
                biased;
                _ = self.options.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay
                .mul_f64(policy.backoff_multiplier)
                .min(policy.max_delay);
        }

        self.monitor.ensure_within_budget()
    }

    fn tracker(&self, total: usize) -> ProgressTracker {
        ProgressTracker::new(total as u64).with_monitor(Arc::clone(&self.monitor))
    }

    /// Bookkeeping after a record was yielded (`Some`) or filtered out (`None`)
    fn after_entry(
        &self,
        tracker: &mut ProgressTracker,
        done: usize,
        yielded: Option<&EntryRecord>,
    ) -> Result<()> {
        tracker.update(done as u64);
        if let Some(on_progress) = &self.options.on_progress {
            on_progress(&tracker.get_progress());
        }
        self.monitor.check_and_alert();

        if let (Some(record), Some(on_entry)) = (yielded, &self.options.on_entry) {
            on_entry(record)
                .map_err(|e| Error::callback(format!("entry callback for {}", record.name), e))?;
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ArchiveStreamExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStreamExtractor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
