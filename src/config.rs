//! Runtime configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a working
//! configuration. Defaults follow the executor receive-queue settings of the host framework:
//! 1024 slots, backpressure at 90% / released at 40%, 1s read timeout, 1ms flush interval.

use crate::error::ConfigError;
use crate::ring::ProducerType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub instrumentation: InstrumentationConfig,
    pub policy: PolicyConfig,
    pub scheduler_thread: ThreadPlacement,
}

/// Settings applied to every unit's inbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of slots; must be a power of two.
    pub capacity: usize,
    pub producer_type: ProducerType,
    /// Backlog ratio (of capacity) at or below which throttling is released.
    pub low_water_mark: f64,
    /// Backlog ratio (of capacity), overflow included, at or above which producers are throttled.
    pub high_water_mark: f64,
    pub enable_backpressure: bool,
    pub read_timeout_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            producer_type: ProducerType::Multi,
            low_water_mark: 0.4,
            high_water_mark: 0.9,
            enable_backpressure: false,
            read_timeout_ms: 1000,
            flush_interval_ms: 1,
        }
    }
}

impl QueueConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Low water mark as an item count.
    pub fn low_water_count(&self) -> u64 {
        (self.capacity as f64 * self.low_water_mark) as u64
    }

    /// High water mark as an item count.
    pub fn high_water_count(&self) -> u64 {
        (self.capacity as f64 * self.high_water_mark) as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "queue.capacity must be a non-zero power of two, got {}",
                self.capacity
            )));
        }
        let in_range = |ratio: f64| ratio > 0.0 && ratio <= 1.0;
        if !in_range(self.low_water_mark) || !in_range(self.high_water_mark) {
            return Err(ConfigError::Invalid(format!(
                "water marks must be in (0, 1], got low={} high={}",
                self.low_water_mark, self.high_water_mark
            )));
        }
        let (low, high) = (self.low_water_count(), self.high_water_count());
        if high == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue.high_water_mark {} of capacity {} rounds down to zero items",
                self.high_water_mark, self.capacity
            )));
        }
        if low >= high {
            return Err(ConfigError::Invalid(format!(
                "low water mark ({low} items) must be below high water mark ({high} items) \
                 for capacity {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

/// Global toggles for queue timing instrumentation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    pub track_wait_time: bool,
    pub track_empty_time: bool,
}

/// How `unit_reset` stamps a unit that still has backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyStamp {
    /// Waited time restarts at the reset: "time since last serviced".
    #[default]
    Refresh,
    /// Waited time keeps counting from the original empty to non-empty transition.
    Preserve,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub ready_stamp: ReadyStamp,
    /// Notify waiters when a reset leaves a unit eligible.
    pub signal_on_reset: bool,
}

/// Optional placement of the scheduler thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPlacement {
    pub core: Option<usize>,
    pub priority: Option<i32>,
}

impl RuntimeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_input_yields_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.queue.low_water_count(), 409);
        assert_eq!(config.queue.high_water_count(), 921);
        assert_eq!(config.queue.read_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_parses_sections() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [queue]
            capacity = 64
            producer_type = "single"
            enable_backpressure = true

            [instrumentation]
            track_wait_time = true

            [policy]
            ready_stamp = "preserve"
            signal_on_reset = true

            [scheduler_thread]
            core = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.capacity, 64);
        assert_eq!(config.queue.producer_type, ProducerType::Single);
        assert!(config.queue.enable_backpressure);
        assert!(config.instrumentation.track_wait_time);
        assert!(!config.instrumentation.track_empty_time);
        assert_eq!(config.policy.ready_stamp, ReadyStamp::Preserve);
        assert!(config.policy.signal_on_reset);
        assert_eq!(config.scheduler_thread.core, Some(2));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let capacity = RuntimeConfig::from_toml_str("[queue]\ncapacity = 100\n");
        assert!(matches!(capacity, Err(ConfigError::Invalid(_))));

        let marks = RuntimeConfig::from_toml_str(
            "[queue]\nlow_water_mark = 0.9\nhigh_water_mark = 0.5\n",
        );
        assert!(matches!(marks, Err(ConfigError::Invalid(_))));

        let parse = RuntimeConfig::from_toml_str("[queue\n");
        assert!(matches!(parse, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_rejects_marks_that_truncate_to_unusable_counts() {
        let single_slot = QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        };
        assert_eq!(single_slot.high_water_count(), 0);
        assert!(matches!(single_slot.validate(), Err(ConfigError::Invalid(_))));

        let collapsed = QueueConfig {
            capacity: 4,
            low_water_mark: 0.5,
            high_water_mark: 0.6,
            ..QueueConfig::default()
        };
        assert_eq!(collapsed.low_water_count(), collapsed.high_water_count());
        assert!(matches!(collapsed.validate(), Err(ConfigError::Invalid(_))));

        let small = QueueConfig {
            capacity: 4,
            ..QueueConfig::default()
        };
        assert_eq!((small.low_water_count(), small.high_water_count()), (1, 3));
        assert!(small.validate().is_ok());
    }

    #[test]
    fn test_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\ncapacity = 16").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queue.capacity, 16);

        let missing = RuntimeConfig::from_file("/nonexistent/fog-scheduler.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
