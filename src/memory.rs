//! Memory budget and the monitor every admission point consults.
//!
//! The monitor is pull-based: it samples its [`MemoryProbe`] only when asked
//! and owns no timers or background threads. It never frees memory or stops
//! work itself; callers decide what to do with what it reports.

use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

use crate::config::MemoryConfig;
use crate::error::{Error, Result};

/// Default warning threshold, in percent of the limit
pub const DEFAULT_WARNING_THRESHOLD_PERCENT: u8 = 80;

/// Memory ceiling for one extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    limit_bytes: Option<u64>,
    warning_threshold_percent: u8,
}

impl MemoryBudget {
    /// Budget with the given limit and the default warning threshold
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes: Some(limit_bytes),
            warning_threshold_percent: DEFAULT_WARNING_THRESHOLD_PERCENT,
        }
    }

    /// Budget that never reports itself exceeded
    pub fn unbounded() -> Self {
        Self {
            limit_bytes: None,
            warning_threshold_percent: DEFAULT_WARNING_THRESHOLD_PERCENT,
        }
    }

    /// Set the warning threshold
    ///
    /// Values outside 1..=100 are rejected.
    pub fn with_warning_threshold(mut self, percent: u8) -> Result<Self> {
        if !(1..=100).contains(&percent) {
            return Err(Error::InvalidArgument(format!(
                "warning threshold must be within 1..=100 percent, got {percent}"
            )));
        }
        self.warning_threshold_percent = percent;
        Ok(self)
    }

    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        let budget = match config.limit_bytes {
            Some(limit) => Self::new(limit),
            None => Self::unbounded(),
        };
        budget.with_warning_threshold(config.warning_threshold_percent)
    }

    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit_bytes
    }

    pub fn warning_threshold_percent(&self) -> u8 {
        self.warning_threshold_percent
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Source of the current memory usage figure
pub trait MemoryProbe: Send + Sync {
    /// Current usage in bytes
    fn current_usage(&self) -> u64;
}

/// Samples the resident set size of the current process
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("cannot determine current process id; memory usage will read as 0");
        }
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_usage(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Snapshot handed to the memory alert callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStatus {
    pub usage_bytes: u64,
    pub limit_bytes: Option<u64>,
    pub percentage: f64,
}

/// Callback invoked when usage crosses the warning threshold
pub type MemoryAlert = Arc<dyn Fn(MemoryStatus) + Send + Sync>;

/// Classifies sampled usage against a [`MemoryBudget`]
///
/// One monitor is built per extraction run and shared by reference with
/// every component that makes admission decisions.
pub struct MemoryMonitor {
    budget: MemoryBudget,
    probe: Arc<dyn MemoryProbe>,
    alert: Option<MemoryAlert>,
}

impl MemoryMonitor {
    pub fn new(budget: MemoryBudget, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            budget,
            probe,
            alert: None,
        }
    }

    /// Monitor sampling this process through [`ProcessMemoryProbe`]
    pub fn for_process(budget: MemoryBudget) -> Self {
        Self::new(budget, Arc::new(ProcessMemoryProbe::new()))
    }

    /// Monitor that never reports pressure
    pub fn unbounded() -> Self {
        Self::new(MemoryBudget::unbounded(), Arc::new(ProcessMemoryProbe::new()))
    }

    /// Register the callback run by [`check_and_alert`](Self::check_and_alert)
    pub fn with_alert(mut self, alert: MemoryAlert) -> Self {
        self.alert = Some(alert);
        self
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn current_usage(&self) -> u64 {
        self.probe.current_usage()
    }

    fn is_exhausted(&self, usage: u64) -> bool {
        self.budget.limit_bytes.is_some_and(|limit| usage >= limit)
    }

    fn percentage_of(&self, usage: u64) -> f64 {
        match self.budget.limit_bytes {
            None => 0.0,
            Some(0) => 100.0,
            Some(limit) => (usage as f64 / limit as f64 * 100.0).clamp(0.0, 100.0),
        }
    }

    /// Whether usage has reached the limit. Always false when unbounded.
    pub fn is_over_limit(&self) -> bool {
        self.budget.limit_bytes.is_some() && self.is_exhausted(self.current_usage())
    }

    /// Whether usage is at or past the warning threshold
    pub fn is_over_warning_threshold(&self) -> bool {
        self.budget.limit_bytes.is_some()
            && self.usage_percentage() >= self.budget.warning_threshold_percent as f64
    }

    /// Usage as a percentage of the limit, within `[0, 100]`; 0 when unbounded
    pub fn usage_percentage(&self) -> f64 {
        if self.budget.limit_bytes.is_none() {
            return 0.0;
        }
        self.percentage_of(self.current_usage())
    }

    /// Sampled usage, limit and percentage in one reading
    pub fn status(&self) -> MemoryStatus {
        let usage_bytes = self.current_usage();
        MemoryStatus {
            usage_bytes,
            limit_bytes: self.budget.limit_bytes,
            percentage: self.percentage_of(usage_bytes),
        }
    }

    /// Fail with [`Error::MemoryBudgetExceeded`] if the budget is exhausted
    pub fn ensure_within_budget(&self) -> Result<()> {
        let Some(limit_bytes) = self.budget.limit_bytes else {
            return Ok(());
        };
        let usage_bytes = self.current_usage();
        if self.is_exhausted(usage_bytes) {
            return Err(Error::MemoryBudgetExceeded {
                usage_bytes,
                limit_bytes,
            });
        }
        Ok(())
    }

    /// Run the alert callback if usage is over the warning threshold
    ///
    /// Returns whether the threshold was crossed.
    pub fn check_and_alert(&self) -> bool {
        if self.budget.limit_bytes.is_none() {
            return false;
        }
        let status = self.status();
        if status.percentage < self.budget.warning_threshold_percent as f64 {
            return false;
        }
        warn!(
            usage = status.usage_bytes,
            limit = ?status.limit_bytes,
            percentage = status.percentage,
            "memory usage over warning threshold"
        );
        if let Some(alert) = &self.alert {
            alert(status);
        }
        true
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("budget", &self.budget)
            .field("has_alert", &self.alert.is_some())
            .finish()
    }
}

/// Probe reporting a fixed figure that tests can move
#[cfg(test)]
pub(crate) mod testing {
    use super::MemoryProbe;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    pub struct FixedProbe(AtomicU64);

    impl FixedProbe {
        pub fn new(usage: u64) -> Self {
            Self(AtomicU64::new(usage))
        }

        pub fn set(&self, usage: u64) {
            self.0.store(usage, Ordering::SeqCst);
        }
    }

    impl MemoryProbe for FixedProbe {
        fn current_usage(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedProbe;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(limit: Option<u64>, usage: u64) -> (MemoryMonitor, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe::new(usage));
        let budget = limit.map(MemoryBudget::new).unwrap_or_default();
        (MemoryMonitor::new(budget, probe.clone()), probe)
    }

    #[test]
    fn test_unbounded_never_over() {
        let (monitor, _) = monitor(None, u64::MAX);
        assert!(!monitor.is_over_limit());
        assert!(!monitor.is_over_warning_threshold());
        assert_eq!(monitor.usage_percentage(), 0.0);
        assert!(monitor.ensure_within_budget().is_ok());
    }

    #[test]
    fn test_thresholds() {
        let (monitor, probe) = monitor(Some(1000), 500);
        assert_eq!(monitor.usage_percentage(), 50.0);
        assert!(!monitor.is_over_warning_threshold());

        probe.set(800);
        assert!(monitor.is_over_warning_threshold());
        assert!(!monitor.is_over_limit());

        probe.set(1000);
        assert!(monitor.is_over_limit());

        probe.set(5000);
        assert_eq!(monitor.usage_percentage(), 100.0);
    }

    #[test]
    fn test_zero_limit_is_always_exceeded() {
        let (monitor, _) = monitor(Some(0), 0);
        assert!(monitor.is_over_limit());
        assert!(matches!(
            monitor.ensure_within_budget(),
            Err(Error::MemoryBudgetExceeded { limit_bytes: 0, .. })
        ));
    }

    #[test]
    fn test_alert_fires_only_past_threshold() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let probe = Arc::new(FixedProbe::new(100));
        let monitor = MemoryMonitor::new(
            MemoryBudget::new(1000).with_warning_threshold(50).unwrap(),
            probe.clone(),
        )
        .with_alert(Arc::new(move |status: MemoryStatus| {
            assert!(status.percentage >= 50.0);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!monitor.check_and_alert());
        probe.set(600);
        assert!(monitor.check_and_alert());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_warning_threshold_bounds() {
        assert!(MemoryBudget::new(10).with_warning_threshold(0).is_err());
        assert!(MemoryBudget::new(10).with_warning_threshold(101).is_err());
        assert_eq!(
            MemoryBudget::new(10)
                .with_warning_threshold(100)
                .unwrap()
                .warning_threshold_percent(),
            100
        );
    }

    #[test]
    fn test_process_probe_reports_usage() {
        assert!(ProcessMemoryProbe::new().current_usage() > 0);
    }
}
