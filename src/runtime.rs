//! The scheduler thread and the overflow flusher.
//!
//! [`Runtime::run`] is the consumer loop: ask the policy for a unit, run it, hand it back, and
//! repeat until every unit has been interrupted or the cancellation token fires. The flusher
//! moves overflow items back into their rings at a fixed interval.

use crate::config::ThreadPlacement;
use crate::error::{QueueError, SchedulerError};
use crate::metrics::duration_micros;
use crate::monitor::{CancellationToken, UnitId};
use crate::scheduler::RuntimePolicy;
use crate::threading::apply_placement;
use crate::unit::QueueProbe;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Summary of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeReport {
    /// Units handed out by the policy.
    pub turns: u64,
    /// Sequences consumed by turns that completed normally.
    pub consumed: u64,
    /// Units stopped by an interrupt, in the order they stopped.
    pub retired: Vec<UnitId>,
    pub cancelled: bool,
    #[serde(with = "duration_micros")]
    pub elapsed: Duration,
}

pub struct Runtime {
    policy: Arc<dyn RuntimePolicy>,
    cancel: CancellationToken,
    placement: ThreadPlacement,
}

impl Runtime {
    pub fn new(
        policy: Arc<dyn RuntimePolicy>,
        cancel: CancellationToken,
        placement: ThreadPlacement,
    ) -> Self {
        Self {
            policy,
            cancel,
            placement,
        }
    }

    pub fn policy(&self) -> &Arc<dyn RuntimePolicy> {
        &self.policy
    }

    /// Run the consumer loop on the calling thread.
    ///
    /// Returns once no live unit remains or the token is cancelled. A failing backpressure
    /// callback or a busy consumer aborts the loop with the queue error.
    pub fn run(&self) -> Result<RuntimeReport, SchedulerError> {
        let started = Instant::now();
        let mut report = RuntimeReport::default();
        info!(units = self.policy.live_units(), "scheduler loop started");

        while self.policy.live_units() > 0 {
            let unit = match self.policy.get_unit_and_set(&self.cancel) {
                Ok(unit) => unit,
                Err(SchedulerError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(err) => return Err(err),
            };
            report.turns += 1;

            match unit.execute() {
                Ok(consumed) => {
                    report.consumed += consumed;
                    self.policy.unit_reset(&unit);
                }
                Err(QueueError::Interrupted { queue, sequence }) => {
                    info!(unit = %unit.id(), queue = %queue, sequence, "unit interrupted");
                    self.policy.retire(&unit);
                    report.retired.push(unit.id());
                }
                Err(err) => {
                    error!(unit = %unit.id(), component = unit.component_id(), error = %err, "unit failed");
                    self.policy.unit_reset(&unit);
                    return Err(err.into());
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            turns = report.turns,
            consumed = report.consumed,
            cancelled = report.cancelled,
            "scheduler loop finished"
        );
        Ok(report)
    }

    /// Run the loop on a dedicated thread placed according to the configured placement.
    pub fn spawn(
        self,
        name: &str,
    ) -> Result<JoinHandle<Result<RuntimeReport, SchedulerError>>, SchedulerError> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                apply_placement(&self.placement);
                self.run()
            })
            .map_err(|source| SchedulerError::Spawn {
                name: name.to_string(),
                source,
            })
    }
}

/// Spawn a thread that flushes every queue's overflow buffer each `interval` until cancelled.
pub fn spawn_flusher(
    queues: Vec<Arc<dyn QueueProbe>>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, SchedulerError> {
    let name = "overflow-flusher";
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(queues = queues.len(), ?interval, "overflow flusher started");
            while !cancel.is_cancelled() {
                for queue in &queues {
                    if let Err(err) = queue.flush_overflow() {
                        warn!(queue = queue.name(), error = %err, "overflow flush failed");
                    }
                }
                thread::sleep(interval);
            }
            debug!("overflow flusher stopped");
        })
        .map_err(|source| SchedulerError::Spawn {
            name: name.to_string(),
            source,
        })
}
