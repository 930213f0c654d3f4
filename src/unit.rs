//! Runtime units: one schedulable executor bound to its inbound queue.
//!
//! Units are built once, when the scheduler starts, from the host's callback providers. A unit
//! never owns its queue; it holds a [`QueueProbe`] that the policy uses to read the backlog and
//! an [`ExecutorCallback`] that the runtime loop invokes to drain it.

use crate::error::{QueueError, SchedulerError};
use crate::metrics::QueueStats;
use crate::monitor::{SharedMonitor, UnitId};
use crate::queue::{BoundedSignalingQueue, SubCount};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Host-assigned executor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExecutorId(pub u64);

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor-{}", self.0)
    }
}

/// Role of the component an executor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorRole {
    /// Consumes from an inbound queue. The only role the scheduler runs.
    Bolt,
    /// Emits into the topology; has no inbound queue to drain.
    Spout,
    /// Framework-internal executor.
    System,
}

impl fmt::Display for ExecutorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorRole::Bolt => write!(f, "bolt"),
            ExecutorRole::Spout => write!(f, "spout"),
            ExecutorRole::System => write!(f, "system"),
        }
    }
}

/// Read-only view of a queue, independent of its item type.
pub trait QueueProbe: Send + Sync {
    fn slot(&self) -> UnitId;
    fn name(&self) -> &str;
    fn population(&self) -> u64;
    /// Publish time of the oldest unconsumed item, if one is visible.
    fn oldest_pending_arrival(&self) -> Option<Instant>;
    fn stats(&self) -> QueueStats;
    /// Move parked overflow items into the ring; see
    /// [`BoundedSignalingQueue::flush_overflow`].
    fn flush_overflow(&self) -> Result<usize, QueueError>;
}

impl<T: SubCount + Send> QueueProbe for BoundedSignalingQueue<T> {
    fn slot(&self) -> UnitId {
        BoundedSignalingQueue::slot(self)
    }

    fn name(&self) -> &str {
        BoundedSignalingQueue::name(self)
    }

    fn population(&self) -> u64 {
        BoundedSignalingQueue::population(self)
    }

    fn oldest_pending_arrival(&self) -> Option<Instant> {
        BoundedSignalingQueue::oldest_pending_arrival(self)
    }

    fn stats(&self) -> QueueStats {
        BoundedSignalingQueue::stats(self)
    }

    fn flush_overflow(&self) -> Result<usize, QueueError> {
        BoundedSignalingQueue::flush_overflow(self)
    }
}

/// Work executed when the scheduler picks a unit.
pub trait ExecutorCallback: Send + Sync {
    fn component_id(&self) -> &str;
    fn executor_id(&self) -> ExecutorId;
    fn role(&self) -> ExecutorRole;

    /// Run one scheduling quantum. Returns the number of sequences consumed.
    fn run(&self) -> Result<u64, QueueError>;
}

/// Source of executor callbacks; providers with nothing to run yield `None`.
pub trait CallbackProvider {
    fn callback(&self) -> Option<Arc<dyn ExecutorCallback>>;
}

impl CallbackProvider for Option<Arc<dyn ExecutorCallback>> {
    fn callback(&self) -> Option<Arc<dyn ExecutorCallback>> {
        self.clone()
    }
}

impl CallbackProvider for Arc<dyn ExecutorCallback> {
    fn callback(&self) -> Option<Arc<dyn ExecutorCallback>> {
        Some(self.clone())
    }
}

/// Bolt callback that drains everything published to its queue into a handler.
pub struct DrainCallback<T, H> {
    component_id: String,
    executor_id: ExecutorId,
    queue: Arc<BoundedSignalingQueue<T>>,
    handler: Mutex<H>,
}

impl<T, H> DrainCallback<T, H>
where
    T: SubCount + Send,
    H: FnMut(T, u64, bool) + Send,
{
    pub fn new(
        component_id: impl Into<String>,
        executor_id: ExecutorId,
        queue: Arc<BoundedSignalingQueue<T>>,
        handler: H,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            executor_id,
            queue,
            handler: Mutex::new(handler),
        }
    }
}

impl<T, H> ExecutorCallback for DrainCallback<T, H>
where
    T: SubCount + Send,
    H: FnMut(T, u64, bool) + Send,
{
    fn component_id(&self) -> &str {
        &self.component_id
    }

    fn executor_id(&self) -> ExecutorId {
        self.executor_id
    }

    fn role(&self) -> ExecutorRole {
        ExecutorRole::Bolt
    }

    fn run(&self) -> Result<u64, QueueError> {
        let mut handler = self.handler.lock();
        self.queue
            .consume_batch(|item, sequence, end_of_batch| (*handler)(item, sequence, end_of_batch))
    }
}

/// A schedulable executor. Its readiness stamp lives in the shared monitor under [`Self::id`].
pub struct RuntimeUnit {
    id: UnitId,
    component_id: String,
    executor_id: ExecutorId,
    queue: Arc<dyn QueueProbe>,
    callback: Arc<dyn ExecutorCallback>,
    monitor: Arc<SharedMonitor>,
}

impl RuntimeUnit {
    pub fn new(
        queue: Arc<dyn QueueProbe>,
        callback: Arc<dyn ExecutorCallback>,
        monitor: Arc<SharedMonitor>,
    ) -> Self {
        Self {
            id: queue.slot(),
            component_id: callback.component_id().to_string(),
            executor_id: callback.executor_id(),
            queue,
            callback,
            monitor,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn executor_id(&self) -> ExecutorId {
        self.executor_id
    }

    pub fn queue(&self) -> &Arc<dyn QueueProbe> {
        &self.queue
    }

    pub fn ready_at(&self) -> Option<Instant> {
        self.monitor.ready_at(self.id)
    }

    /// How long the unit has been ready, or `None` if it has nothing to run.
    ///
    /// Takes the monitor lock; the policy reads the same value from its own guard instead.
    pub fn waited_time(&self) -> Option<Duration> {
        self.monitor.waited_time(self.id, Instant::now())
    }

    /// Items still queued for this unit.
    pub fn pending(&self) -> u64 {
        self.queue.population()
    }

    /// When the oldest item still queued for this unit was published.
    pub fn oldest_pending_arrival(&self) -> Option<Instant> {
        self.queue.oldest_pending_arrival()
    }

    pub fn execute(&self) -> Result<u64, QueueError> {
        self.callback.run()
    }
}

impl fmt::Debug for RuntimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeUnit")
            .field("id", &self.id)
            .field("component_id", &self.component_id)
            .field("executor_id", &self.executor_id)
            .field("queue", &self.queue.name())
            .finish()
    }
}

/// Create one unit per bolt callback, pairing it with the queue registered for its executor.
///
/// Providers without a callback are skipped. Any role other than [`ExecutorRole::Bolt`] fails
/// with [`SchedulerError::UnsupportedRole`].
pub fn build_units<'a, P>(
    providers: impl IntoIterator<Item = &'a P>,
    queues: &HashMap<ExecutorId, Arc<dyn QueueProbe>>,
    monitor: &Arc<SharedMonitor>,
) -> Result<Vec<Arc<RuntimeUnit>>, SchedulerError>
where
    P: CallbackProvider + ?Sized + 'a,
{
    let mut units = Vec::new();
    for provider in providers {
        let Some(callback) = provider.callback() else {
            continue;
        };
        let role = callback.role();
        if role != ExecutorRole::Bolt {
            return Err(SchedulerError::UnsupportedRole {
                component: callback.component_id().to_string(),
                role,
            });
        }
        let executor_id = callback.executor_id();
        let queue = queues
            .get(&executor_id)
            .cloned()
            .ok_or(SchedulerError::MissingQueue(executor_id))?;
        let unit = RuntimeUnit::new(queue, callback, monitor.clone());
        debug!(
            unit = %unit.id(),
            component = unit.component_id(),
            executor = %executor_id,
            "registered runtime unit"
        );
        units.push(Arc::new(unit));
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::Instrumentation;

    struct FixedRole {
        executor_id: ExecutorId,
        role: ExecutorRole,
    }

    impl ExecutorCallback for FixedRole {
        fn component_id(&self) -> &str {
            "fixed"
        }

        fn executor_id(&self) -> ExecutorId {
            self.executor_id
        }

        fn role(&self) -> ExecutorRole {
            self.role
        }

        fn run(&self) -> Result<u64, QueueError> {
            Ok(0)
        }
    }

    fn callback(executor_id: u64, role: ExecutorRole) -> Arc<dyn ExecutorCallback> {
        Arc::new(FixedRole {
            executor_id: ExecutorId(executor_id),
            role,
        })
    }

    fn queue(monitor: &Arc<SharedMonitor>, name: &str) -> Arc<BoundedSignalingQueue<u64>> {
        let config = QueueConfig {
            capacity: 8,
            ..QueueConfig::default()
        };
        Arc::new(BoundedSignalingQueue::new(
            name,
            &config,
            monitor.clone(),
            Instrumentation::plain(),
        ))
    }

    #[test]
    fn test_drain_callback_runs_handler_over_backlog() {
        let monitor = SharedMonitor::new();
        let queue = queue(&monitor, "bolt-a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: Arc<dyn ExecutorCallback> = Arc::new(DrainCallback::new(
            "bolt-a",
            ExecutorId(1),
            queue.clone(),
            move |item, _, _| sink.lock().push(item),
        ));

        let probe: Arc<dyn QueueProbe> = queue.clone();
        let unit = RuntimeUnit::new(probe, callback, monitor);
        assert_eq!(unit.id(), queue.slot());
        assert!(unit.waited_time().is_none());

        queue.publish_single(10, true).unwrap();
        queue.publish_single(11, true).unwrap();
        assert!(unit.waited_time().is_some());
        assert_eq!(unit.pending(), 2);

        assert_eq!(unit.execute().unwrap(), 2);
        assert_eq!(*seen.lock(), vec![10, 11]);
        assert_eq!(unit.pending(), 0);
    }

    #[test]
    fn test_build_units_pairs_callbacks_with_queues() {
        let monitor = SharedMonitor::new();
        let first = queue(&monitor, "first");
        let second = queue(&monitor, "second");
        let mut queues: HashMap<ExecutorId, Arc<dyn QueueProbe>> = HashMap::new();
        queues.insert(ExecutorId(1), first.clone() as Arc<dyn QueueProbe>);
        queues.insert(ExecutorId(2), second.clone() as Arc<dyn QueueProbe>);

        let providers = vec![
            Some(callback(2, ExecutorRole::Bolt)),
            None,
            Some(callback(1, ExecutorRole::Bolt)),
        ];

        let units = build_units(&providers, &queues, &monitor).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id(), second.slot());
        assert_eq!(units[1].id(), first.slot());
        assert_eq!(units[1].executor_id(), ExecutorId(1));
    }

    #[test]
    fn test_build_units_rejects_bad_registrations() {
        let monitor = SharedMonitor::new();
        let only = queue(&monitor, "only");
        let mut queues: HashMap<ExecutorId, Arc<dyn QueueProbe>> = HashMap::new();
        queues.insert(ExecutorId(1), only as Arc<dyn QueueProbe>);

        let spout = vec![callback(1, ExecutorRole::Spout)];
        let err = build_units(&spout, &queues, &monitor).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::UnsupportedRole {
                role: ExecutorRole::Spout,
                ..
            }
        ));

        let orphan = vec![callback(9, ExecutorRole::Bolt)];
        let err = build_units(&orphan, &queues, &monitor).unwrap_err();
        assert!(matches!(err, SchedulerError::MissingQueue(ExecutorId(9))));
    }
}
