//! Shared lock/condition pair coordinating readiness between producers and the scheduler.
//!
//! A single [`SharedMonitor`] is injected into every queue and into the scheduling policy. It
//! guards only bookkeeping: per-unit `ready_at` stamps, the set of units available for selection,
//! and per-queue wait/empty timers. Data movement inside the ring buffers never takes this lock.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of a queue slot in the monitor, shared by the queue and its runtime unit.
///
/// Ids are handed out in registration order, which also fixes the policy's scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct UnitId(usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Wait and empty interval accounting for one queue.
///
/// The wait timer runs while a queue holds backlog the consumer has not started on; the empty
/// timer runs while the queue is drained. Both are closed into running totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueTiming {
    wait_start: Option<Instant>,
    empty_start: Option<Instant>,
    total_wait: Duration,
    total_empty: Duration,
}

impl QueueTiming {
    pub fn start_wait(&mut self, now: Instant) {
        self.wait_start = Some(now);
    }

    /// Close the pending wait interval, returning its length if one was open.
    pub fn close_wait(&mut self, now: Instant) -> Option<Duration> {
        let start = self.wait_start.take()?;
        let delta = now.saturating_duration_since(start);
        self.total_wait += delta;
        Some(delta)
    }

    pub fn start_empty(&mut self, now: Instant) {
        self.empty_start = Some(now);
    }

    /// Close the pending empty interval, returning its length if one was open.
    pub fn close_empty(&mut self, now: Instant) -> Option<Duration> {
        let start = self.empty_start.take()?;
        let delta = now.saturating_duration_since(start);
        self.total_empty += delta;
        Some(delta)
    }

    pub fn total_wait(&self) -> Duration {
        self.total_wait
    }

    pub fn total_empty(&self) -> Duration {
        self.total_empty
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_start.is_some()
    }

    pub fn is_empty_timer_running(&self) -> bool {
        self.empty_start.is_some()
    }
}

#[derive(Debug, Default)]
struct SlotState {
    ready_at: Option<Instant>,
    timing: QueueTiming,
}

/// State guarded by the monitor lock.
#[derive(Debug, Default)]
pub struct MonitorState {
    slots: Vec<SlotState>,
    available: BTreeSet<UnitId>,
}

impl MonitorState {
    pub fn ready_at(&self, id: UnitId) -> Option<Instant> {
        self.slots.get(id.0).and_then(|slot| slot.ready_at)
    }

    pub fn set_ready_at(&mut self, id: UnitId, at: Option<Instant>) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.ready_at = at;
        }
    }

    /// Time since `id` became ready, or `None` if it is not eligible.
    pub fn waited_time(&self, id: UnitId, now: Instant) -> Option<Duration> {
        self.ready_at(id)
            .map(|ready_at| now.saturating_duration_since(ready_at))
    }

    pub fn timing(&self, id: UnitId) -> Option<&QueueTiming> {
        self.slots.get(id.0).map(|slot| &slot.timing)
    }

    pub fn timing_mut(&mut self, id: UnitId) -> Option<&mut QueueTiming> {
        self.slots.get_mut(id.0).map(|slot| &mut slot.timing)
    }

    pub fn is_available(&self, id: UnitId) -> bool {
        self.available.contains(&id)
    }

    pub fn make_available(&mut self, id: UnitId) {
        self.available.insert(id);
    }

    pub fn remove_available(&mut self, id: UnitId) -> bool {
        self.available.remove(&id)
    }

    /// Available units in ascending id order.
    pub fn available(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.available.iter().copied()
    }
}

/// One lock and one condition variable shared by every queue and the policy.
#[derive(Debug, Default)]
pub struct SharedMonitor {
    state: Mutex<MonitorState>,
    condition: Condvar,
}

impl SharedMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a slot for a new queue. The returned id doubles as the unit id.
    pub fn register_slot(&self) -> UnitId {
        let mut state = self.state.lock();
        let id = UnitId(state.slots.len());
        state.slots.push(SlotState::default());
        id
    }

    pub fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock()
    }

    /// Block on the shared condition, releasing the lock while parked.
    pub fn wait(&self, guard: &mut MutexGuard<'_, MonitorState>) {
        self.condition.wait(guard);
    }

    /// Block on the shared condition for at most `timeout`.
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, MonitorState>, timeout: Duration) {
        let _ = self.condition.wait_for(guard, timeout);
    }

    pub fn notify_all(&self) {
        self.condition.notify_all();
    }

    /// Record an empty to non-empty transition of `id`'s queue and wake every waiter.
    ///
    /// An available unit that is already stamped keeps its place. A unit that is out for
    /// execution gets the new stamp, since its old one belongs to items already drained.
    pub fn mark_ready(&self, id: UnitId, at: Instant) {
        let mut state = self.state.lock();
        let available = state.is_available(id);
        if let Some(slot) = state.slots.get_mut(id.0) {
            if available {
                slot.ready_at.get_or_insert(at);
            } else {
                slot.ready_at = Some(at);
            }
        }
        self.condition.notify_all();
    }

    pub fn ready_at(&self, id: UnitId) -> Option<Instant> {
        self.state.lock().ready_at(id)
    }

    pub fn waited_time(&self, id: UnitId, now: Instant) -> Option<Duration> {
        self.state.lock().waited_time(id, now)
    }

    /// Run `f` against `id`'s timers while holding the monitor lock.
    pub fn with_timing<R>(&self, id: UnitId, f: impl FnOnce(&mut QueueTiming) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.timing_mut(id).map(f)
    }

    pub fn timing(&self, id: UnitId) -> QueueTiming {
        self.state.lock().timing(id).cloned().unwrap_or_default()
    }

    /// Create a token that can cancel waits on this monitor.
    pub fn cancellation_token(self: &Arc<Self>) -> CancellationToken {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            monitor: self.clone(),
        }
    }
}

/// Cooperative cancellation for threads blocked on a [`SharedMonitor`].
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    monitor: Arc<SharedMonitor>,
}

impl CancellationToken {
    /// Flag cancellation and wake every waiter so it can observe the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // Taking the lock orders this wake-up after any waiter's flag check.
        let _state = self.monitor.state.lock();
        self.monitor.condition.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_registered_in_order() {
        let monitor = SharedMonitor::new();
        let first = monitor.register_slot();
        let second = monitor.register_slot();
        assert!(first < second);
        assert_eq!(second.index(), 1);
        assert_eq!(first.to_string(), "unit-0");
    }

    #[test]
    fn test_mark_ready_keeps_first_stamp_while_available() {
        let monitor = SharedMonitor::new();
        let id = monitor.register_slot();
        monitor.lock().make_available(id);
        let earlier = Instant::now();
        let later = earlier + Duration::from_millis(5);

        monitor.mark_ready(id, earlier);
        monitor.mark_ready(id, later);
        assert_eq!(monitor.ready_at(id), Some(earlier));

        let waited = monitor.waited_time(id, later).unwrap();
        assert_eq!(waited, Duration::from_millis(5));
    }

    #[test]
    fn test_mark_ready_replaces_stale_stamp_of_running_unit() {
        let monitor = SharedMonitor::new();
        let id = monitor.register_slot();
        let stale = Instant::now();
        let fresh = stale + Duration::from_millis(8);

        monitor.lock().set_ready_at(id, Some(stale));
        monitor.mark_ready(id, fresh);
        assert_eq!(monitor.ready_at(id), Some(fresh));
    }

    #[test]
    fn test_timers_accumulate_closed_intervals() {
        let monitor = SharedMonitor::new();
        let id = monitor.register_slot();
        let start = Instant::now();

        monitor.with_timing(id, |timing| timing.start_wait(start));
        let delta = monitor
            .with_timing(id, |timing| timing.close_wait(start + Duration::from_millis(3)))
            .flatten();
        assert_eq!(delta, Some(Duration::from_millis(3)));
        assert_eq!(
            monitor.with_timing(id, |timing| timing.close_wait(start)),
            Some(None)
        );

        monitor.with_timing(id, |timing| timing.start_empty(start));
        monitor.with_timing(id, |timing| timing.close_empty(start + Duration::from_millis(2)));

        let timing = monitor.timing(id);
        assert_eq!(timing.total_wait(), Duration::from_millis(3));
        assert_eq!(timing.total_empty(), Duration::from_millis(2));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let monitor = SharedMonitor::new();
        let token = monitor.cancellation_token();

        let waiter = {
            let monitor = monitor.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                let mut state = monitor.lock();
                while !token.is_cancelled() {
                    monitor.wait(&mut state);
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        waiter.join().unwrap();
        assert!(token.is_cancelled());
    }
}
