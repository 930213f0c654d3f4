//! Error types shared by the queue, scheduling and configuration layers.

use crate::unit::{ExecutorId, ExecutorRole};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a backpressure callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CallbackFailure(pub String);

impl CallbackFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Which backpressure threshold a callback was invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaterMark {
    Low,
    High,
}

impl fmt::Display for WaterMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaterMark::Low => write!(f, "low"),
            WaterMark::High => write!(f, "high"),
        }
    }
}

/// Errors surfaced by [`BoundedSignalingQueue`](crate::queue::BoundedSignalingQueue).
///
/// `Full` is recoverable: the caller decides whether to retry, back off, or fall back to a
/// blocking publish. `Interrupted` and `Callback` end the current consume call and are meant
/// to be handled by the executor loop.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {queue} is full (capacity {capacity})")]
    Full { queue: String, capacity: usize },

    #[error("batch of {len} items exceeds capacity {capacity} of queue {queue}")]
    BatchTooLarge {
        queue: String,
        len: usize,
        capacity: usize,
    },

    #[error("queue {queue} interrupted at sequence {sequence}")]
    Interrupted { queue: String, sequence: u64 },

    #[error("{mark} water mark callback failed on queue {queue}: {source}")]
    Callback {
        queue: String,
        mark: WaterMark,
        #[source]
        source: CallbackFailure,
    },

    #[error("queue {queue} already has an active consumer")]
    ConsumerBusy { queue: String },
}

/// Errors surfaced by the scheduling policy and the runtime loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler wait cancelled")]
    Cancelled,

    #[error("no queue registered for executor {0}")]
    MissingQueue(ExecutorId),

    #[error("component {component} has unsupported role {role}")]
    UnsupportedRole {
        component: String,
        role: ExecutorRole,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
