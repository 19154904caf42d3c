//! Configuration types for boundzip.
//!
//! Everything here is plain data that can be loaded from JSON. Runtime-only
//! pieces (callbacks, the custom filter predicate, the cancellation token)
//! are attached separately through
//! [`ExtractOptions`](crate::extractor::ExtractOptions).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::DEFAULT_WARNING_THRESHOLD_PERCENT;

/// Memory budget settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Ceiling on process memory in bytes (None = unbounded)
    #[serde(default)]
    pub limit_bytes: Option<u64>,

    /// Percentage of the limit at which alerts fire (default: 80)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold_percent: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_bytes: None,
            warning_threshold_percent: DEFAULT_WARNING_THRESHOLD_PERCENT,
        }
    }
}

/// Backpressure settings for entry content streams
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Buffered-but-unconsumed bytes above which the producer pauses (default: 64 KiB)
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// How often a paused producer re-samples the memory budget (default: 10ms)
    #[serde(default = "default_poll_interval", with = "duration_millis")]
    pub poll_interval: Duration,

    /// How long a producer may wait on an exhausted budget with nothing
    /// buffered before failing (default: 30s, None = wait until cancelled)
    #[serde(default = "default_stall_timeout", with = "optional_duration_millis")]
    pub stall_timeout: Option<Duration>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water_mark: default_high_water_mark(),
            poll_interval: default_poll_interval(),
            stall_timeout: default_stall_timeout(),
        }
    }
}

/// Bounded retry policy for admitting a new entry under memory pressure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Retries after the first failed admission check (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 50ms)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Ceiling on the delay between retries (default: 1s)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Serializable part of the entry filter
///
/// The custom predicate cannot be expressed as data; attach it with
/// [`FilterCriteria::with_predicate`](crate::filter::FilterCriteria::with_predicate).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub min_size: Option<u64>,

    #[serde(default)]
    pub max_size: Option<u64>,

    /// Allowed content types, e.g. `text/plain` or `image/*`
    #[serde(default)]
    pub allowed_content_types: Option<Vec<String>>,

    /// Allowed extensions without the leading dot, compared case-insensitively
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,

    /// Longest entry name the security gate admits (default: 1024 characters)
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            min_size: None,
            max_size: None,
            allowed_content_types: None,
            allowed_extensions: None,
            max_name_length: default_max_name_length(),
        }
    }
}

/// Complete configuration for one extraction run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub filter: Option<FilterConfig>,

    /// Chunk size used when content is split for the caller (default: 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Entries processed concurrently by `extract_with` (default: 1)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            backpressure: BackpressureConfig::default(),
            admission: AdmissionConfig::default(),
            filter: None,
            chunk_size: default_chunk_size(),
            workers: default_workers(),
        }
    }
}

impl ExtractConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read configuration {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject settings no run could use
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::InvalidArgument("workers must be at least 1".into()));
        }
        if self.backpressure.high_water_mark == 0 {
            return Err(Error::InvalidArgument(
                "backpressure.high_water_mark must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.memory.warning_threshold_percent) {
            return Err(Error::InvalidArgument(format!(
                "memory.warning_threshold_percent must be within 1..=100, got {}",
                self.memory.warning_threshold_percent
            )));
        }
        if !(self.admission.backoff_multiplier.is_finite() && self.admission.backoff_multiplier >= 1.0)
        {
            return Err(Error::InvalidArgument(
                "admission.backoff_multiplier must be a finite value >= 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_warning_threshold() -> u8 {
    DEFAULT_WARNING_THRESHOLD_PERCENT
}

fn default_high_water_mark() -> usize {
    64 * 1024
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_stall_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_name_length() -> usize {
    1024
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_workers() -> usize {
    1
}

// Durations are written as whole milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config = ExtractConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ExtractConfig::default());
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.workers, 1);
        assert_eq!(config.memory.warning_threshold_percent, 80);
        assert_eq!(config.backpressure.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_partial_json() {
        let config = ExtractConfig::from_json_str(
            r#"{
                "memory": { "limit_bytes": 52428800 },
                "backpressure": { "high_water_mark": 1024, "stall_timeout": null },
                "filter": { "exclude": ["**/*.exe"], "max_size": 1000 },
                "workers": 4
            }"#,
        )
        .unwrap();
        assert_eq!(config.memory.limit_bytes, Some(50 * 1024 * 1024));
        assert_eq!(config.backpressure.high_water_mark, 1024);
        assert_eq!(config.backpressure.stall_timeout, None);
        let filter = config.filter.unwrap();
        assert_eq!(filter.max_size, Some(1000));
        assert_eq!(filter.max_name_length, 1024);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ExtractConfig::from_json_str(r#"{ "chunk_size": 0 }"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(ExtractConfig::from_json_str(r#"{ "workers": 0 }"#).is_err());
        assert!(
            ExtractConfig::from_json_str(r#"{ "memory": { "warning_threshold_percent": 0 } }"#)
                .is_err()
        );
        assert!(ExtractConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_round_trip_keeps_millis() {
        let mut config = ExtractConfig {
            chunk_size: 10,
            workers: 2,
            ..ExtractConfig::default()
        };
        config.admission.initial_delay = Duration::from_millis(125);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ExtractConfig::from_json_str(&json).unwrap(), config);
    }
}
