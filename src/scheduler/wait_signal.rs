//! Longest-waiting-first policy signalled through the shared monitor.
//!
//! Every queue stamps its unit ready when it goes from empty to non-empty and wakes the
//! scheduler. The policy services whichever available unit has been ready the longest,
//! regardless of how much backlog it holds.
//!
//! Algorithm:
//! 1. Under the monitor lock, scan the available units in ascending id order
//! 2. Keep the unit with the strictly greatest positive waited time (first one wins ties)
//! 3. If none qualifies, park on the shared condition and rescan when woken
//! 4. Remove the chosen unit from the available set and hand it to the caller
//! 5. After execution, `unit_reset` re-stamps or clears readiness and makes the unit available;
//!    a unit with backlog is stamped either at the reset or at its oldest unconsumed arrival

use super::{RuntimePolicy, UnitReadiness};
use crate::config::{PolicyConfig, ReadyStamp};
use crate::error::SchedulerError;
use crate::monitor::{CancellationToken, SharedMonitor, UnitId};
use crate::unit::RuntimeUnit;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Rescan delay when a unit is ready but has not accrued measurable waited time yet.
const FRESH_READY_RESCAN: Duration = Duration::from_millis(1);

pub struct WaitSignalPolicy {
    monitor: Arc<SharedMonitor>,
    units: BTreeMap<UnitId, Arc<RuntimeUnit>>,
    retired: Mutex<BTreeSet<UnitId>>,
    config: PolicyConfig,
}

impl WaitSignalPolicy {
    /// Take ownership of `units` and make every one of them available for selection.
    pub fn new(
        monitor: Arc<SharedMonitor>,
        units: impl IntoIterator<Item = Arc<RuntimeUnit>>,
        config: PolicyConfig,
    ) -> Self {
        let units: BTreeMap<UnitId, Arc<RuntimeUnit>> =
            units.into_iter().map(|unit| (unit.id(), unit)).collect();
        {
            let mut state = monitor.lock();
            for id in units.keys() {
                state.make_available(*id);
            }
        }
        info!(units = units.len(), ?config, "wait/signal policy ready");
        Self {
            monitor,
            units,
            retired: Mutex::new(BTreeSet::new()),
            config,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn unit(&self, id: UnitId) -> Option<&Arc<RuntimeUnit>> {
        self.units.get(&id)
    }
}

impl RuntimePolicy for WaitSignalPolicy {
    fn get_unit_and_set(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<RuntimeUnit>, SchedulerError> {
        let mut state = self.monitor.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }

            let now = Instant::now();
            let mut longest: Option<(UnitId, Duration)> = None;
            let mut fresh = false;
            for id in state.available() {
                match state.waited_time(id, now) {
                    Some(waited) if waited > Duration::ZERO => {
                        if longest.map_or(true, |(_, best)| waited > best) {
                            longest = Some((id, waited));
                        }
                    }
                    Some(_) => fresh = true,
                    None => {}
                }
            }

            if let Some((id, waited)) = longest {
                state.remove_available(id);
                if let Some(unit) = self.units.get(&id) {
                    trace!(unit = %id, waited_us = waited.as_micros() as u64, "selected unit");
                    return Ok(unit.clone());
                }
                continue;
            }

            if fresh {
                self.monitor.wait_for(&mut state, FRESH_READY_RESCAN);
            } else {
                self.monitor.wait(&mut state);
            }
        }
    }

    fn unit_reset(&self, unit: &RuntimeUnit) {
        let id = unit.id();
        if self.retired.lock().contains(&id) {
            debug!(unit = %id, "ignoring reset of retired unit");
            return;
        }

        let mut state = self.monitor.lock();
        // Read under the lock so a concurrent transition cannot slip between read and stamp.
        let pending = unit.pending();
        if pending == 0 {
            state.set_ready_at(id, None);
        } else {
            let now = Instant::now();
            let stamp = match self.config.ready_stamp {
                ReadyStamp::Refresh => now,
                // An item still being filled arrived no earlier than now.
                ReadyStamp::Preserve => unit.oldest_pending_arrival().map_or(now, |at| at.min(now)),
            };
            state.set_ready_at(id, Some(stamp));
        }
        state.make_available(id);
        drop(state);

        if pending > 0 && self.config.signal_on_reset {
            self.monitor.notify_all();
        }
    }

    fn retire(&self, unit: &RuntimeUnit) {
        let id = unit.id();
        if !self.retired.lock().insert(id) {
            return;
        }
        let mut state = self.monitor.lock();
        state.remove_available(id);
        state.set_ready_at(id, None);
        drop(state);
        info!(unit = %id, component = unit.component_id(), "retired unit");
    }

    fn live_units(&self) -> usize {
        self.units.len() - self.retired.lock().len()
    }

    fn units(&self) -> Vec<Arc<RuntimeUnit>> {
        self.units.values().cloned().collect()
    }

    fn describe(&self) -> Vec<UnitReadiness> {
        let retired = self.retired.lock().clone();
        let state = self.monitor.lock();
        let now = Instant::now();
        let readiness: Vec<UnitReadiness> = self
            .units
            .values()
            .map(|unit| UnitReadiness {
                id: unit.id(),
                component_id: unit.component_id().to_string(),
                executor_id: unit.executor_id(),
                waited: state.waited_time(unit.id(), now),
                available: state.is_available(unit.id()),
                retired: retired.contains(&unit.id()),
                pending: unit.pending(),
            })
            .collect();
        drop(state);

        for entry in &readiness {
            info!(
                unit = %entry.id,
                component = %entry.component_id,
                executor = %entry.executor_id,
                waited_us = entry.waited.map(|waited| waited.as_micros() as u64),
                available = entry.available,
                retired = entry.retired,
                pending = entry.pending,
                "unit readiness"
            );
        }
        readiness
    }
}
