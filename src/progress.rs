//! Processed/total counters with derived percentage, rate and ETA.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::memory::MemoryMonitor;

/// Point-in-time progress reading
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
    /// Rounded percentage within `[0, 100]`
    pub percentage: f64,
    pub memory_usage_bytes: u64,
    /// Units processed per second since the tracker was created
    pub rate: f64,
    pub elapsed: Duration,
    /// Estimated time to completion, absent while the rate is zero
    pub eta: Option<Duration>,
    pub timestamp: SystemTime,
}

/// Callback receiving progress snapshots
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Accumulates progress for one run
///
/// Updates take `&mut self`: the tracker has a single writer, and whoever
/// orchestrates a run serializes updates into it.
#[derive(Debug)]
pub struct ProgressTracker {
    processed: u64,
    total: u64,
    started: Instant,
    monitor: Option<Arc<MemoryMonitor>>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            processed: 0,
            total,
            started: Instant::now(),
            monitor: None,
        }
    }

    /// Report memory usage from `monitor` in every snapshot
    pub fn with_monitor(mut self, monitor: Arc<MemoryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Record the processed count. Callers keep `processed <= total`.
    pub fn update(&mut self, processed: u64) {
        self.processed = processed;
    }

    /// Replace the total, for work whose size is discovered as it runs
    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn get_progress(&self) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        self.snapshot_at(elapsed)
    }

    fn snapshot_at(&self, elapsed: Duration) -> ProgressSnapshot {
        let percentage = if self.total == 0 {
            100.0
        } else {
            (self.processed as f64 / self.total as f64 * 100.0)
                .round()
                .clamp(0.0, 100.0)
        };

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        };

        let remaining = self.total.saturating_sub(self.processed);
        let eta = (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate));

        ProgressSnapshot {
            processed: self.processed,
            total: self.total,
            percentage,
            memory_usage_bytes: self.monitor.as_ref().map_or(0, |m| m.current_usage()),
            rate,
            elapsed,
            eta,
            timestamp: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FixedProbe;
    use crate::memory::MemoryBudget;

    #[test]
    fn test_percentage_rounds() {
        let mut tracker = ProgressTracker::new(3);
        tracker.update(1);
        assert_eq!(tracker.get_progress().percentage, 33.0);
        tracker.update(2);
        assert_eq!(tracker.get_progress().percentage, 67.0);
        tracker.update(3);
        assert_eq!(tracker.get_progress().percentage, 100.0);
    }

    #[test]
    fn test_percentage_is_monotonic_and_bounded() {
        let mut tracker = ProgressTracker::new(997);
        let mut last = 0.0;
        for processed in (0..=997).step_by(7).chain(std::iter::once(997)) {
            tracker.update(processed);
            let pct = tracker.get_progress().percentage;
            assert!((0.0..=100.0).contains(&pct));
            assert!(pct >= last);
            last = pct;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_zero_elapsed_has_zero_rate() {
        let mut tracker = ProgressTracker::new(10);
        tracker.update(5);
        let snapshot = tracker.snapshot_at(Duration::ZERO);
        assert_eq!(snapshot.rate, 0.0);
        assert_eq!(snapshot.eta, None);
    }

    #[test]
    fn test_rate_and_eta() {
        let mut tracker = ProgressTracker::new(100);
        tracker.update(50);
        let snapshot = tracker.snapshot_at(Duration::from_secs(10));
        assert_eq!(snapshot.rate, 5.0);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_empty_total_is_complete() {
        assert_eq!(ProgressTracker::new(0).get_progress().percentage, 100.0);
    }

    #[test]
    fn test_reports_memory_usage() {
        let monitor = Arc::new(MemoryMonitor::new(
            MemoryBudget::unbounded(),
            Arc::new(FixedProbe::new(4096)),
        ));
        let tracker = ProgressTracker::new(1).with_monitor(monitor);
        assert_eq!(tracker.get_progress().memory_usage_bytes, 4096);
    }
}
