//! Scheduling policies choosing which runtime unit the consumer thread services next.

pub mod wait_signal;

use crate::error::SchedulerError;
use crate::monitor::{CancellationToken, UnitId};
use crate::unit::{ExecutorId, RuntimeUnit};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub use wait_signal::WaitSignalPolicy;

/// Policy driven by the single scheduler thread.
///
/// A unit returned by [`get_unit_and_set`](Self::get_unit_and_set) is withheld from selection
/// until it is handed back through [`unit_reset`](Self::unit_reset) or dropped for good through
/// [`retire`](Self::retire).
pub trait RuntimePolicy: Send + Sync {
    /// Block until a unit is eligible, claim it and return it.
    fn get_unit_and_set(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<RuntimeUnit>, SchedulerError>;

    /// Return a unit after one execution turn.
    fn unit_reset(&self, unit: &RuntimeUnit);

    /// Stop scheduling a unit.
    fn retire(&self, unit: &RuntimeUnit);

    /// Units not yet retired.
    fn live_units(&self) -> usize;

    fn units(&self) -> Vec<Arc<RuntimeUnit>>;

    /// Snapshot of every unit's readiness, also written to the log.
    fn describe(&self) -> Vec<UnitReadiness>;
}

/// Readiness of one unit as seen by the policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReadiness {
    pub id: UnitId,
    pub component_id: String,
    pub executor_id: ExecutorId,
    #[serde(with = "crate::metrics::duration_micros_option")]
    pub waited: Option<Duration>,
    pub available: bool,
    pub retired: bool,
    pub pending: u64,
}
