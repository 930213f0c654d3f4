//! Longest-waiting-first scheduling over bounded signaling queues.
//!
//! Producers publish into per-unit [`BoundedSignalingQueue`]s. A publish that takes a queue from
//! empty to non-empty stamps its unit ready in the [`SharedMonitor`] and wakes the scheduler,
//! whose [`WaitSignalPolicy`] always services the unit that has been ready the longest.

pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod ring;
pub mod runtime;
pub mod scheduler;
pub mod threading;
pub mod unit;

pub use config::{PolicyConfig, QueueConfig, ReadyStamp, RuntimeConfig, ThreadPlacement};
pub use error::{CallbackFailure, ConfigError, QueueError, SchedulerError, WaterMark};
pub use metrics::{ChannelMetricsSink, DurationMetric, MetricsSink, QueueStats};
pub use monitor::{CancellationToken, SharedMonitor, UnitId};
pub use queue::{BackpressureCallback, BoundedSignalingQueue, Instrumentation, PublishOutcome};
pub use ring::ProducerType;
pub use runtime::{spawn_flusher, Runtime, RuntimeReport};
pub use scheduler::{RuntimePolicy, UnitReadiness, WaitSignalPolicy};
pub use unit::{
    build_units, CallbackProvider, DrainCallback, ExecutorCallback, ExecutorId, ExecutorRole,
    QueueProbe, RuntimeUnit,
};
