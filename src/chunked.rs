//! Splitting byte sequences and streams into bounded-size chunks.
//!
//! Chunks partition their input exactly: concatenated in order they
//! reproduce it, every chunk but the last has the configured size, and the
//! last holds the remainder. Input held in [`Bytes`] is sliced, not copied.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MemoryMonitor;
use crate::progress::{ProgressCallback, ProgressTracker};

/// Outcome of one chunking call
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub chunks: Vec<Bytes>,
    /// Sum of all chunk lengths; equals the input length
    pub total_size: u64,
    pub duration: Duration,
    pub memory_usage_at_completion: u64,
}

impl ChunkResult {
    pub fn duration_millis(&self) -> u128 {
        self.duration.as_millis()
    }

    /// Reassemble the chunks into one contiguous buffer
    pub fn concat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.total_size as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

/// Optional knobs for a chunking call
#[derive(Clone, Default)]
pub struct ChunkOptions {
    /// Invoked after each chunk is finalized; `processed` counts bytes
    pub on_progress: Option<ProgressCallback>,
    /// Expected total bytes for streams, used for the progress percentage
    pub total_hint: Option<u64>,
}

impl ChunkOptions {
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_total_hint(mut self, total: u64) -> Self {
        self.total_hint = Some(total);
        self
    }
}

/// Splits data into bounded chunks under a memory budget
#[derive(Debug, Clone)]
pub struct ChunkedProcessor {
    monitor: Arc<MemoryMonitor>,
}

fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidArgument("chunk size must be at least 1".into()));
    }
    Ok(())
}

impl ChunkedProcessor {
    pub fn new(monitor: Arc<MemoryMonitor>) -> Self {
        Self { monitor }
    }

    /// Split `data` into `ceil(len / chunk_size)` chunks
    ///
    /// Fails with [`Error::InvalidArgument`] for a zero chunk size and with
    /// [`Error::MemoryBudgetExceeded`] if the budget is exhausted at the start.
    pub fn process_in_chunks(
        &self,
        data: impl Into<Bytes>,
        chunk_size: usize,
        options: &ChunkOptions,
    ) -> Result<ChunkResult> {
        validate_chunk_size(chunk_size)?;
        self.monitor.ensure_within_budget()?;

        let data = data.into();
        let started = Instant::now();
        let mut tracker =
            ProgressTracker::new(data.len() as u64).with_monitor(Arc::clone(&self.monitor));
        let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            chunks.push(data.slice(offset..end));
            offset = end;

            if let Some(callback) = &options.on_progress {
                tracker.update(offset as u64);
                callback(&tracker.get_progress());
            }
        }

        debug!(len = data.len(), chunk_size, chunks = chunks.len(), "split buffer into chunks");
        Ok(ChunkResult {
            chunks,
            total_size: data.len() as u64,
            duration: started.elapsed(),
            memory_usage_at_completion: self.monitor.current_usage(),
        })
    }

    /// Re-chunk a stream of arbitrarily sized units
    ///
    /// Large units are split and small ones are carried over until a full
    /// chunk is available; a short final chunk is emitted at end of stream.
    /// The budget is checked before each unit is pulled from `source`, and a
    /// breach ends the stream with [`Error::MemoryBudgetExceeded`]. Source
    /// errors are passed through unchanged.
    pub fn process_stream_in_chunks<S>(
        &self,
        source: S,
        chunk_size: usize,
        options: &ChunkOptions,
    ) -> Result<BoxStream<'static, Result<Bytes>>>
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        validate_chunk_size(chunk_size)?;

        let state = Rechunker {
            source: source.boxed(),
            chunk_size,
            carry: BytesMut::new(),
            ready: VecDeque::new(),
            source_done: false,
            monitor: Arc::clone(&self.monitor),
            tracker: ProgressTracker::new(options.total_hint.unwrap_or(0))
                .with_monitor(Arc::clone(&self.monitor)),
            total_known: options.total_hint.is_some(),
            on_progress: options.on_progress.clone(),
        };

        Ok(stream::try_unfold(state, |mut state| async move {
            Ok(state.next_chunk().await?.map(|chunk| (chunk, state)))
        })
        .boxed())
    }

    /// Drain a stream into an all-or-nothing [`ChunkResult`]
    ///
    /// Any failure discards the chunks gathered so far.
    pub async fn collect_stream_in_chunks<S>(
        &self,
        source: S,
        chunk_size: usize,
        options: &ChunkOptions,
    ) -> Result<ChunkResult>
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        let started = Instant::now();
        let mut chunks = Vec::new();
        let mut total_size = 0u64;

        let mut stream = self.process_stream_in_chunks(source, chunk_size, options)?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total_size += chunk.len() as u64;
            chunks.push(chunk);
        }

        Ok(ChunkResult {
            chunks,
            total_size,
            duration: started.elapsed(),
            memory_usage_at_completion: self.monitor.current_usage(),
        })
    }
}

struct Rechunker {
    source: BoxStream<'static, Result<Bytes>>,
    chunk_size: usize,
    carry: BytesMut,
    ready: VecDeque<Bytes>,
    source_done: bool,
    monitor: Arc<MemoryMonitor>,
    tracker: ProgressTracker,
    total_known: bool,
    on_progress: Option<ProgressCallback>,
}

impl Rechunker {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                self.report(chunk.len());
                return Ok(Some(chunk));
            }

            if self.source_done {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                self.ready.push_back(self.carry.split().freeze());
                continue;
            }

            self.monitor.ensure_within_budget()?;
            match self.source.next().await {
                Some(unit) => self.accept(unit?),
                None => self.source_done = true,
            }
        }
    }

    fn accept(&mut self, mut unit: Bytes) {
        if !self.carry.is_empty() {
            let take = (self.chunk_size - self.carry.len()).min(unit.len());
            self.carry.extend_from_slice(&unit.split_to(take));
            if self.carry.len() == self.chunk_size {
                self.ready.push_back(self.carry.split().freeze());
            }
        }
        while unit.len() >= self.chunk_size {
            self.ready.push_back(unit.split_to(self.chunk_size));
        }
        if !unit.is_empty() {
            self.carry.extend_from_slice(&unit);
        }
    }

    fn report(&mut self, len: usize) {
        let processed = self.tracker.processed() + len as u64;
        if !self.total_known {
            // without a hint the total grows with what has been seen
            self.tracker.set_total(processed);
        }
        self.tracker.update(processed.min(self.tracker.total()));
        if let Some(callback) = &self.on_progress {
            callback(&self.tracker.get_progress());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FixedProbe;
    use crate::memory::MemoryBudget;
    use crate::progress::ProgressSnapshot;
    use std::sync::Mutex;

    fn processor(limit: Option<u64>, usage: u64) -> (ChunkedProcessor, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe::new(usage));
        let budget = limit.map(MemoryBudget::new).unwrap_or_default();
        let monitor = Arc::new(MemoryMonitor::new(budget, probe.clone()));
        (ChunkedProcessor::new(monitor), probe)
    }

    fn units(sizes: &[usize]) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        let mut next = 0u8;
        let units: Vec<Result<Bytes>> = sizes
            .iter()
            .map(|&n| {
                let unit: Vec<u8> = (0..n)
                    .map(|_| {
                        next = next.wrapping_add(1);
                        next
                    })
                    .collect();
                Ok(Bytes::from(unit))
            })
            .collect();
        stream::iter(units)
    }

    #[test]
    fn test_fixed_size_slicing() {
        let (p, _) = processor(None, 0);
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let result = p.process_in_chunks(data.clone(), 300, &ChunkOptions::default()).unwrap();

        let lengths: Vec<usize> = result.chunks.iter().map(Bytes::len).collect();
        assert_eq!(lengths, vec![300, 300, 300, 100]);
        assert_eq!(result.total_size, 1000);
        assert_eq!(result.concat(), Bytes::from(data));
    }

    #[test]
    fn test_exact_multiple_and_empty_input() {
        let (p, _) = processor(None, 0);
        let result = p.process_in_chunks(vec![1u8; 600], 300, &ChunkOptions::default()).unwrap();
        assert_eq!(result.chunks.len(), 2);
        assert!(result.chunks.iter().all(|c| c.len() == 300));

        let empty = p.process_in_chunks(Vec::new(), 300, &ChunkOptions::default()).unwrap();
        assert!(empty.chunks.is_empty());
        assert_eq!(empty.total_size, 0);
    }

    #[test]
    fn test_round_trip_over_sizes() {
        let (p, _) = processor(None, 0);
        let data: Vec<u8> = (0..257u32).map(|i| (i * 7) as u8).collect();
        for size in [1, 2, 16, 100, 256, 257, 1000] {
            let result = p.process_in_chunks(data.clone(), size, &ChunkOptions::default()).unwrap();
            assert_eq!(result.concat().as_ref(), data.as_slice(), "chunk size {size}");
            assert_eq!(result.total_size, data.len() as u64);
            assert_eq!(result.chunks.len(), data.len().div_ceil(size));
        }
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let (p, _) = processor(None, 0);
        assert!(matches!(
            p.process_in_chunks(vec![1u8], 0, &ChunkOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(p
            .process_stream_in_chunks(units(&[1]), 0, &ChunkOptions::default())
            .is_err());
    }

    #[test]
    fn test_zero_budget_fails() {
        let (p, _) = processor(Some(0), 0);
        assert!(matches!(
            p.process_in_chunks(vec![1u8; 10], 4, &ChunkOptions::default()),
            Err(Error::MemoryBudgetExceeded { .. })
        ));
    }

    #[test]
    fn test_progress_reports_bytes() {
        let (p, _) = processor(None, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = ChunkOptions::default().with_progress(Arc::new(move |snapshot: &ProgressSnapshot| {
            sink.lock().unwrap().push((snapshot.processed, snapshot.percentage));
        }));

        p.process_in_chunks(vec![0u8; 1000], 300, &options).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(300, 30.0), (600, 60.0), (900, 90.0), (1000, 100.0)]
        );
    }

    #[tokio::test]
    async fn test_stream_rechunking() {
        let (p, _) = processor(None, 0);
        let sizes = [5, 1, 1, 20, 3, 0, 7];
        let expected: Vec<u8> = units(&sizes)
            .map(|u| u.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();

        let result = p
            .collect_stream_in_chunks(units(&sizes), 8, &ChunkOptions::default())
            .await
            .unwrap();
        let lengths: Vec<usize> = result.chunks.iter().map(Bytes::len).collect();
        assert_eq!(lengths, vec![8, 8, 8, 8, 5]);
        assert_eq!(result.total_size, 37);
        assert_eq!(result.concat().as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_stream_source_error_propagates() {
        let (p, _) = processor(None, 0);
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(Error::stream(
                "reading",
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            )),
        ]);
        let err = p
            .collect_stream_in_chunks(source, 2, &ChunkOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stream { .. }));
    }

    #[tokio::test]
    async fn test_stream_budget_breach_midway() {
        let (p, probe) = processor(Some(1000), 0);
        let mut chunks = p
            .process_stream_in_chunks(units(&[4, 4, 4]), 4, &ChunkOptions::default())
            .unwrap();

        assert_eq!(chunks.next().await.unwrap().unwrap().len(), 4);
        probe.set(2000);
        assert!(matches!(
            chunks.next().await,
            Some(Err(Error::MemoryBudgetExceeded { .. }))
        ));
        assert!(chunks.next().await.is_none());
    }
}
