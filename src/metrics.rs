//! Metrics sinks and serializable queue statistics.
//!
//! Queues report wait-latency and empty-time intervals through the [`MetricsSink`] trait. Two
//! sinks are provided: [`DurationMetric`], which aggregates in place, and [`ChannelMetricsSink`],
//! which moves the aggregation off the hot path by sending events through a bounded
//! `crossbeam_channel` to a background thread.

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Label used for queue timing updates.
pub const DEFAULT_LABEL: &str = "default";

/// Number of recent samples kept per label for percentile queries.
const SAMPLE_WINDOW: usize = 10_000;

/// Capacity of the event channel between hot path and aggregator.
const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// Receiver of labeled incremental duration updates.
pub trait MetricsSink: Send + Sync {
    fn inc_by(&self, label: &str, delta: Duration);
}

/// Running statistics for one label.
#[derive(Debug, Clone, Default)]
struct DurationStats {
    count: u64,
    total: Duration,
    samples: VecDeque<Duration>,
}

impl DurationStats {
    fn record(&mut self, delta: Duration) {
        self.count += 1;
        self.total += delta;
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
    }

    fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.total.as_nanos() / u128::from(self.count)) as u64)
    }

    /// Nearest-rank percentile over the sample window.
    fn percentile(sorted: &[Duration], pct: f64) -> Option<Duration> {
        if sorted.is_empty() {
            return None;
        }
        let len = sorted.len();
        let idx = ((len as f64 * pct / 100.0).ceil() as usize).saturating_sub(1);
        Some(sorted[idx.min(len - 1)])
    }

    fn snapshot(&self) -> DurationSnapshot {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        DurationSnapshot {
            count: self.count,
            total: self.total,
            average: self.average(),
            max: sorted.last().copied(),
            p50: Self::percentile(&sorted, 50.0),
            p99: Self::percentile(&sorted, 99.0),
        }
    }
}

/// Point-in-time view of one label's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSnapshot {
    pub count: u64,
    #[serde(with = "duration_micros")]
    pub total: Duration,
    #[serde(with = "duration_micros")]
    pub average: Duration,
    #[serde(with = "duration_micros_option")]
    pub max: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub p50: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub p99: Option<Duration>,
}

/// In-process labeled duration metric, the default [`MetricsSink`].
#[derive(Debug, Default)]
pub struct DurationMetric {
    name: String,
    stats: Mutex<HashMap<String, DurationStats>>,
}

impl DurationMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self, label: &str, delta: Duration) {
        let mut stats = self.stats.lock();
        match stats.get_mut(label) {
            Some(entry) => entry.record(delta),
            None => {
                let mut entry = DurationStats::default();
                entry.record(delta);
                stats.insert(label.to_string(), entry);
            }
        }
    }

    /// Total accumulated for `label`, zero if never updated.
    pub fn total(&self, label: &str) -> Duration {
        self.stats
            .lock()
            .get(label)
            .map(|entry| entry.total)
            .unwrap_or_default()
    }

    pub fn count(&self, label: &str) -> u64 {
        self.stats
            .lock()
            .get(label)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Snapshot every label. Sorting happens outside the lock.
    pub fn snapshot(&self) -> HashMap<String, DurationSnapshot> {
        let stats = self.stats.lock().clone();
        stats
            .iter()
            .map(|(label, entry)| (label.clone(), entry.snapshot()))
            .collect()
    }
}

impl MetricsSink for DurationMetric {
    fn inc_by(&self, label: &str, delta: Duration) {
        self.record(label, delta);
    }
}

#[derive(Debug)]
struct MetricsEvent {
    label: String,
    delta: Duration,
}

/// Sink that forwards updates to a background aggregator thread.
///
/// `inc_by` never blocks: when the channel is full the event is dropped and counted. Dropping
/// every clone of the sink disconnects the channel and ends the aggregator thread.
#[derive(Clone)]
pub struct ChannelMetricsSink {
    events_tx: Sender<MetricsEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelMetricsSink {
    /// Spawn the aggregator feeding `target` and return the sink plus the thread handle.
    pub fn spawn(target: Arc<DurationMetric>) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (events_tx, events_rx) =
            crossbeam_channel::bounded::<MetricsEvent>(EVENT_CHANNEL_CAPACITY);
        let thread_name = format!("metrics-{}", target.name());
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                // Ends once every sender is dropped.
                for event in events_rx.iter() {
                    target.record(&event.label, event.delta);
                }
            })?;
        Ok((
            Self {
                events_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        ))
    }

    /// Events discarded because the aggregator fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricsSink for ChannelMetricsSink {
    fn inc_by(&self, label: &str, delta: Duration) {
        let event = MetricsEvent {
            label: label.to_string(),
            delta,
        };
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(label, "metrics aggregator gone; dropping update");
            }
        }
    }
}

/// Snapshot of one queue's counters and timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub capacity: usize,
    pub population: u64,
    pub arrivals: u64,
    pub consumed: u64,
    pub overflow: u64,
    pub throttled: bool,
    pub corrupt_slots: u64,
    #[serde(with = "duration_micros")]
    pub total_wait: Duration,
    #[serde(with = "duration_micros")]
    pub total_empty: Duration,
}

pub(crate) mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    // Microseconds as f64 for sub-millisecond precision
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1_000_000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(micros / 1_000_000.0))
    }
}

pub(crate) mod duration_micros_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1_000_000.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(deserializer)?;
        Ok(opt.map(|micros| Duration::from_secs_f64(micros / 1_000_000.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_metric_aggregates_per_label() {
        let metric = DurationMetric::new("wait-latency");
        metric.inc_by(DEFAULT_LABEL, Duration::from_millis(10));
        metric.inc_by(DEFAULT_LABEL, Duration::from_millis(20));
        metric.inc_by("other", Duration::from_millis(5));

        assert_eq!(metric.count(DEFAULT_LABEL), 2);
        assert_eq!(metric.total(DEFAULT_LABEL), Duration::from_millis(30));
        assert_eq!(metric.total("missing"), Duration::ZERO);

        let snapshot = metric.snapshot();
        let default = &snapshot[DEFAULT_LABEL];
        assert_eq!(default.average, Duration::from_millis(15));
        assert_eq!(default.p50, Some(Duration::from_millis(10)));
        assert_eq!(default.max, Some(Duration::from_millis(20)));
        assert_eq!(snapshot["other"].count, 1);
    }

    #[test]
    fn test_channel_sink_feeds_aggregator() {
        let target = Arc::new(DurationMetric::new("empty-time"));
        let (sink, handle) = ChannelMetricsSink::spawn(target.clone()).unwrap();

        sink.inc_by(DEFAULT_LABEL, Duration::from_millis(4));
        sink.inc_by(DEFAULT_LABEL, Duration::from_millis(6));
        drop(sink);
        handle.join().unwrap();

        assert_eq!(target.count(DEFAULT_LABEL), 2);
        assert_eq!(target.total(DEFAULT_LABEL), Duration::from_millis(10));
    }

    #[test]
    fn test_queue_stats_serialize_durations_as_micros() {
        let stats = QueueStats {
            name: "bolt-1".to_string(),
            capacity: 8,
            population: 1,
            arrivals: 3,
            consumed: 2,
            overflow: 0,
            throttled: false,
            corrupt_slots: 0,
            total_wait: Duration::from_secs(2),
            total_empty: Duration::ZERO,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_wait"], 2_000_000.0);
        let back: QueueStats = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats);
    }
}
