//! Bounded signaling queue: a ring buffer that tells the scheduler when it has work.
//!
//! On top of [`RingBuffer`] the queue adds:
//! - empty to non-empty transition detection, which stamps the owning unit ready in the
//!   [`SharedMonitor`] and wakes the scheduler;
//! - optional wait/empty time instrumentation, fixed at construction via [`Instrumentation`];
//! - low/high water-mark backpressure callbacks;
//! - an interrupt sentinel that ends the consumer's processing of this queue;
//! - an unbounded overflow buffer for producers that must not block.

use crate::config::QueueConfig;
use crate::error::{CallbackFailure, QueueError, WaterMark};
use crate::metrics::{MetricsSink, QueueStats, DEFAULT_LABEL};
use crate::monitor::{SharedMonitor, UnitId};
use crate::ring::{ConsumerToken, Reservation, RingBuffer};
use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest single sleep while waiting out a read timeout.
const READ_PARK_INTERVAL: Duration = Duration::from_micros(100);

/// Number of logical records carried by one queue item.
///
/// Items are usually batches; the consumed counter adds up sub-counts rather than items.
pub trait SubCount {
    fn sub_count(&self) -> u64;
}

impl<T> SubCount for Vec<T> {
    fn sub_count(&self) -> u64 {
        self.len() as u64
    }
}

impl<T> SubCount for Box<[T]> {
    fn sub_count(&self) -> u64 {
        self.len() as u64
    }
}

macro_rules! single_record {
    ($($ty:ty),* $(,)?) => {
        $(impl SubCount for $ty {
            fn sub_count(&self) -> u64 {
                1
            }
        })*
    };
}

single_record!(u8, u16, u32, u64, usize, i32, i64, String, &'static str);

/// Producer-side throttling notifications.
pub trait BackpressureCallback: Send + Sync {
    /// Population reached the high water mark; producers should slow down.
    fn high_water_mark(&self) -> Result<(), CallbackFailure>;

    /// Throttled backlog drained to the low water mark; producers may resume.
    fn low_water_mark(&self) -> Result<(), CallbackFailure>;
}

/// Timing instrumentation chosen when the queue is built.
///
/// A queue without sinks is the plain variant and never touches the monitor for timing.
#[derive(Clone, Default)]
pub struct Instrumentation {
    wait: Option<Arc<dyn MetricsSink>>,
    empty: Option<Arc<dyn MetricsSink>>,
}

impl Instrumentation {
    pub fn plain() -> Self {
        Self::default()
    }

    /// Report wait latency (backlog waiting for the consumer) to `sink`.
    pub fn with_wait_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.wait = Some(sink);
        self
    }

    /// Report time spent empty to `sink`.
    pub fn with_empty_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.empty = Some(sink);
        self
    }

    pub fn is_plain(&self) -> bool {
        self.wait.is_none() && self.empty.is_none()
    }
}

enum Entry<T> {
    Item(T),
    Interrupt,
}

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Sequence of the last item published.
    pub sequence: u64,
    /// The publish moved the queue from empty to non-empty.
    pub became_ready: bool,
}

struct Backpressure {
    enabled: AtomicBool,
    throttled: AtomicBool,
    low_water_mark: AtomicU64,
    high_water_mark: AtomicU64,
    callback: RwLock<Option<Arc<dyn BackpressureCallback>>>,
}

/// Single-consumer, multi-producer queue feeding one runtime unit.
pub struct BoundedSignalingQueue<T> {
    name: String,
    ring: RingBuffer<Entry<T>>,
    monitor: Arc<SharedMonitor>,
    slot: UnitId,
    instrumentation: Instrumentation,
    backpressure: Backpressure,
    overflow: SegQueue<T>,
    overflow_count: AtomicU64,
    /// Item popped from overflow that did not fit yet; also serializes flushers.
    overflow_head: Mutex<Option<T>>,
    /// Publish time of the item in each ring slot, in nanoseconds since `epoch`.
    arrived_at: Box<[AtomicU64]>,
    epoch: Instant,
    arrivals: AtomicU64,
    consumed: AtomicU64,
    corrupt_slots: AtomicU64,
    read_timeout: Duration,
}

impl<T: SubCount> BoundedSignalingQueue<T> {
    /// Build a queue and register its slot with `monitor`.
    ///
    /// # Arguments
    /// * `name` - Label used in logs, errors and [`QueueStats`]
    /// * `config` - Capacity, producer type, water-mark ratios and read timeout
    /// * `monitor` - Shared monitor; the slot allocated here becomes the unit id
    /// * `instrumentation` - Wait/empty sinks, or [`Instrumentation::plain`]
    ///
    /// # Panics
    /// Panics if `config.capacity` is not a non-zero power of two; run
    /// [`QueueConfig::validate`] first.
    pub fn new(
        name: impl Into<String>,
        config: &QueueConfig,
        monitor: Arc<SharedMonitor>,
        instrumentation: Instrumentation,
    ) -> Self {
        let slot = monitor.register_slot();
        Self {
            name: name.into(),
            ring: RingBuffer::new(config.capacity, config.producer_type),
            monitor,
            slot,
            instrumentation,
            backpressure: Backpressure {
                enabled: AtomicBool::new(config.enable_backpressure),
                throttled: AtomicBool::new(false),
                low_water_mark: AtomicU64::new(config.low_water_count()),
                high_water_mark: AtomicU64::new(config.high_water_count()),
                callback: RwLock::new(None),
            },
            overflow: SegQueue::new(),
            overflow_count: AtomicU64::new(0),
            overflow_head: Mutex::new(None),
            arrived_at: (0..config.capacity).map(|_| AtomicU64::new(0)).collect(),
            epoch: Instant::now(),
            arrivals: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            corrupt_slots: AtomicU64::new(0),
            read_timeout: config.read_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Monitor slot of this queue, also the id of the unit that drains it.
    pub fn slot(&self) -> UnitId {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Reserved but unconsumed items: producer sequence minus consumer cursor.
    pub fn population(&self) -> u64 {
        self.ring.population()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Acquire)
    }

    /// Publish time of the oldest unconsumed item.
    ///
    /// # Returns
    /// `None` when the queue is empty or its oldest sequence is still being filled. The value
    /// is exact while the consumer is idle; during a drain it may already name a later item.
    pub fn oldest_pending_arrival(&self) -> Option<Instant> {
        let sequence = self.ring.next_published()?;
        let nanos = self.arrived_at[self.ring.index(sequence)].load(Ordering::Relaxed);
        Some(self.epoch + Duration::from_nanos(nanos))
    }

    pub fn is_throttled(&self) -> bool {
        self.backpressure.throttled.load(Ordering::Acquire)
    }

    pub fn register_backpressure_callback(&self, callback: Arc<dyn BackpressureCallback>) {
        *self.backpressure.callback.write() = Some(callback);
    }

    pub fn enable_backpressure(&self, enabled: bool) {
        self.backpressure.enabled.store(enabled, Ordering::Release);
    }

    /// Override the water marks with absolute item counts.
    ///
    /// # Arguments
    /// * `low` - Backlog at or below which a throttled queue calls `low_water_mark`
    /// * `high` - Backlog (ring plus overflow) at or above which producers are throttled
    pub fn set_water_marks(&self, low: u64, high: u64) {
        debug_assert!(low < high, "low water mark must be below high water mark");
        self.backpressure
            .low_water_mark
            .store(low, Ordering::Release);
        self.backpressure
            .high_water_mark
            .store(high, Ordering::Release);
    }

    /// Publish one item.
    ///
    /// # Arguments
    /// * `item` - Value to enqueue
    /// * `blocking` - Wait for capacity instead of failing with [`QueueError::Full`]; a failed
    ///   non-blocking publish drops the item
    ///
    /// # Returns
    /// The item's sequence and whether it moved the queue from empty to non-empty, or
    /// [`QueueError::Callback`] if the high water mark callback failed after publishing.
    pub fn publish_single(&self, item: T, blocking: bool) -> Result<PublishOutcome, QueueError> {
        let reservation = self.reserve(1, blocking)?;
        self.complete_publish(reservation, std::iter::once(Entry::Item(item)))
    }

    /// Publish a batch as one visible range.
    ///
    /// The transition is reported only when the whole batch landed on an empty queue.
    ///
    /// # Returns
    /// `Ok(None)` for an empty batch, [`QueueError::BatchTooLarge`] when the batch can never fit,
    /// otherwise the outcome for the last sequence of the batch.
    pub fn publish_batch(
        &self,
        items: Vec<T>,
        blocking: bool,
    ) -> Result<Option<PublishOutcome>, QueueError> {
        if items.is_empty() {
            return Ok(None);
        }
        if items.len() > self.capacity() {
            return Err(QueueError::BatchTooLarge {
                queue: self.name.clone(),
                len: items.len(),
                capacity: self.capacity(),
            });
        }
        let reservation = self.reserve(items.len() as u64, blocking)?;
        self.complete_publish(reservation, items.into_iter().map(Entry::Item))
            .map(Some)
    }

    /// Ask the consumer to stop processing this queue once it reaches the sentinel.
    ///
    /// Waits for a free slot; use [`try_publish_interrupt`](Self::try_publish_interrupt) when
    /// the consumer may already be gone.
    pub fn publish_interrupt(&self) -> Result<PublishOutcome, QueueError> {
        let reservation = self.reserve(1, true)?;
        self.complete_publish(reservation, std::iter::once(Entry::Interrupt))
    }

    /// Publish the interrupt sentinel without waiting.
    ///
    /// # Returns
    /// The publish outcome, or [`QueueError::Full`] when the ring has no free slot.
    pub fn try_publish_interrupt(&self) -> Result<PublishOutcome, QueueError> {
        let reservation = self.reserve(1, false)?;
        self.complete_publish(reservation, std::iter::once(Entry::Interrupt))
    }

    /// Publish without blocking, parking the item in the overflow buffer when the ring is full.
    ///
    /// Items already waiting in overflow go first, so a new item is parked behind them even if
    /// the ring has room. Returns `Ok(None)` when the item was parked.
    pub fn publish_or_overflow(&self, item: T) -> Result<Option<PublishOutcome>, QueueError> {
        if self.overflow_count() == 0 {
            if let Some(reservation) = self.ring.try_reserve(1) {
                return self
                    .complete_publish(reservation, std::iter::once(Entry::Item(item)))
                    .map(Some);
            }
        }
        self.overflow_count.fetch_add(1, Ordering::AcqRel);
        self.overflow.push(item);
        self.check_high_water_mark()?;
        Ok(None)
    }

    /// Move parked overflow items into the ring, in order, without blocking.
    ///
    /// # Returns
    /// The number of items moved. Concurrent callers return `Ok(0)` immediately.
    pub fn flush_overflow(&self) -> Result<usize, QueueError> {
        let Some(mut head) = self.overflow_head.try_lock() else {
            return Ok(0);
        };
        let mut moved = 0;
        loop {
            let Some(item) = head.take().or_else(|| self.overflow.pop()) else {
                break;
            };
            let Some(reservation) = self.ring.try_reserve(1) else {
                *head = Some(item);
                break;
            };
            let published = self.complete_publish(reservation, std::iter::once(Entry::Item(item)));
            self.overflow_count.fetch_sub(1, Ordering::AcqRel);
            moved += 1;
            published?;
        }
        if moved > 0 {
            debug!(queue = %self.name, moved, "flushed overflow");
        }
        Ok(moved)
    }

    fn reserve(&self, n: u64, blocking: bool) -> Result<Reservation, QueueError> {
        if blocking {
            Ok(self.ring.reserve(n))
        } else {
            self.ring.try_reserve(n).ok_or_else(|| QueueError::Full {
                queue: self.name.clone(),
                capacity: self.capacity(),
            })
        }
    }

    fn complete_publish(
        &self,
        reservation: Reservation,
        entries: impl IntoIterator<Item = Entry<T>>,
    ) -> Result<PublishOutcome, QueueError> {
        let count = reservation.len();
        let sequence = reservation.end();
        let became_ready = reservation.population() == count;
        let now = Instant::now();

        if became_ready && !self.instrumentation.is_plain() {
            self.on_arrival_after_empty(now);
        }

        // Written before the publication markers, which order them for the consumer side.
        let stamp = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        for sequence in reservation.begin()..=reservation.end() {
            self.arrived_at[self.ring.index(sequence)].store(stamp, Ordering::Relaxed);
        }
        self.ring.publish(reservation, entries);
        self.arrivals.fetch_add(count, Ordering::Relaxed);

        if became_ready {
            self.monitor.mark_ready(self.slot, now);
        }

        self.check_high_water_mark()?;
        Ok(PublishOutcome {
            sequence,
            became_ready,
        })
    }

    /// Start the wait timer and close the empty interval for a fresh backlog.
    fn on_arrival_after_empty(&self, now: Instant) {
        let track_wait = self.instrumentation.wait.is_some();
        let empty_delta = self
            .monitor
            .with_timing(self.slot, |timing| {
                if track_wait {
                    timing.start_wait(now);
                }
                timing.close_empty(now)
            })
            .flatten();
        if let (Some(sink), Some(delta)) = (&self.instrumentation.empty, empty_delta) {
            sink.inc_by(DEFAULT_LABEL, delta);
        }
    }

    fn backpressure_callback(&self) -> Option<Arc<dyn BackpressureCallback>> {
        if !self.backpressure.enabled.load(Ordering::Acquire) {
            return None;
        }
        self.backpressure.callback.read().clone()
    }

    /// Items waiting for the consumer: ring population plus parked overflow.
    fn backlog(&self) -> u64 {
        self.population() + self.overflow_count()
    }

    fn check_high_water_mark(&self) -> Result<(), QueueError> {
        let high = self.backpressure.high_water_mark.load(Ordering::Acquire);
        if self.backlog() < high {
            return Ok(());
        }
        let Some(callback) = self.backpressure_callback() else {
            return Ok(());
        };
        if self
            .backpressure
            .throttled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(queue = %self.name, backlog = self.backlog(), "throttling producers");
            callback
                .high_water_mark()
                .map_err(|source| self.callback_error(WaterMark::High, source))?;
        }
        Ok(())
    }

    fn check_low_water_mark(&self, sequence: u64) -> Result<(), QueueError> {
        if !self.backpressure.throttled.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(callback) = self.backpressure_callback() else {
            return Ok(());
        };
        let backlog = self.ring.claimed().saturating_sub(sequence + 1) + self.overflow_count();
        let low = self.backpressure.low_water_mark.load(Ordering::Acquire);
        if backlog <= low
            && self
                .backpressure
                .throttled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(queue = %self.name, backlog, "releasing producer throttle");
            callback
                .low_water_mark()
                .map_err(|source| self.callback_error(WaterMark::Low, source))?;
        }
        Ok(())
    }

    fn callback_error(&self, mark: WaterMark, source: CallbackFailure) -> QueueError {
        QueueError::Callback {
            queue: self.name.clone(),
            mark,
            source,
        }
    }

    /// Drain every published item up to and including `cursor`, in sequence order.
    ///
    /// Must only be called from the consumer thread bound to this queue; a concurrent second
    /// consumer gets [`QueueError::ConsumerBusy`]. `cursor` is clamped to the highest published
    /// sequence. The handler receives `(item, sequence, end_of_batch)`.
    ///
    /// # Arguments
    /// * `cursor` - Last sequence to deliver, inclusive
    /// * `handler` - Called with `(item, sequence, end_of_batch)` for every item
    ///
    /// # Returns
    /// The number of sequences taken, empty slots included. On `Interrupted` or `Callback`
    /// errors the remaining items stay queued; items already taken are not redelivered.
    pub fn consume_up_to<F>(&self, cursor: u64, mut handler: F) -> Result<u64, QueueError>
    where
        F: FnMut(T, u64, bool),
    {
        let consumer = self.ring.consumer().ok_or_else(|| QueueError::ConsumerBusy {
            queue: self.name.clone(),
        })?;

        if let Some(sink) = &self.instrumentation.wait {
            let waited = self
                .monitor
                .with_timing(self.slot, |timing| timing.close_wait(Instant::now()))
                .flatten();
            if let Some(delta) = waited {
                sink.inc_by(DEFAULT_LABEL, delta);
            }
        }

        let start = consumer.next_sequence();
        let end = consumer.highest_published().map(|highest| highest.min(cursor));
        let mut next = start;
        let drained = match end {
            Some(end) if end >= start => self.drain(&consumer, start, end, &mut next, &mut handler),
            _ => Ok(()),
        };
        consumer.advance(next);
        drop(consumer);
        drained?;

        if !self.instrumentation.is_plain() {
            self.after_consume(Instant::now());
        }
        Ok(next - start)
    }

    fn drain<F>(
        &self,
        consumer: &ConsumerToken<'_, Entry<T>>,
        start: u64,
        end: u64,
        next: &mut u64,
        handler: &mut F,
    ) -> Result<(), QueueError>
    where
        F: FnMut(T, u64, bool),
    {
        for sequence in start..=end {
            let entry = consumer.take(sequence);
            *next = sequence + 1;
            match entry {
                Some(Entry::Interrupt) => {
                    return Err(QueueError::Interrupted {
                        queue: self.name.clone(),
                        sequence,
                    });
                }
                None => {
                    self.corrupt_slots.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        queue = %self.name,
                        sequence,
                        cursor = end,
                        "published slot was empty; skipping (likely producer/consumer race)"
                    );
                }
                Some(Entry::Item(item)) => {
                    let records = item.sub_count();
                    handler(item, sequence, sequence == end);
                    self.consumed.fetch_add(records, Ordering::Relaxed);
                    self.check_low_water_mark(sequence)?;
                }
            }
        }
        Ok(())
    }

    /// Re-arm the wait timer when backlog remains, otherwise start the empty timer.
    fn after_consume(&self, now: Instant) {
        let population = self.population();
        let track_wait = self.instrumentation.wait.is_some();
        let track_empty = self.instrumentation.empty.is_some();
        self.monitor.with_timing(self.slot, |timing| {
            if population > 0 {
                if track_wait {
                    timing.start_wait(now);
                }
            } else if track_empty {
                timing.start_empty(now);
            }
        });
    }

    /// Drain everything published so far. Returns `Ok(0)` when nothing is available.
    pub fn consume_batch<F>(&self, handler: F) -> Result<u64, QueueError>
    where
        F: FnMut(T, u64, bool),
    {
        self.consume_up_to(u64::MAX, handler)
    }

    /// Wait up to the configured read timeout for a published item, then drain.
    ///
    /// Spins and yields first, then sleeps in short steps until the deadline.
    ///
    /// # Returns
    /// `Ok(0)` if nothing was published before the timeout, otherwise as
    /// [`consume_batch`](Self::consume_batch).
    pub fn consume_batch_when_available<F>(&self, handler: F) -> Result<u64, QueueError>
    where
        F: FnMut(T, u64, bool),
    {
        let deadline = Instant::now() + self.read_timeout;
        let backoff = Backoff::new();
        while !self.ring.has_published() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            if backoff.is_completed() {
                std::thread::sleep(READ_PARK_INTERVAL.min(deadline - now));
            } else {
                backoff.snooze();
            }
        }
        self.consume_batch(handler)
    }

    pub fn stats(&self) -> QueueStats {
        let timing = self.monitor.timing(self.slot);
        QueueStats {
            name: self.name.clone(),
            capacity: self.capacity(),
            population: self.population(),
            arrivals: self.arrivals.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            overflow: self.overflow_count(),
            throttled: self.is_throttled(),
            corrupt_slots: self.corrupt_slots.load(Ordering::Relaxed),
            total_wait: timing.total_wait(),
            total_empty: timing.total_empty(),
        }
    }
}
