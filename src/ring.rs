//! Lock-free bounded ring buffer with reserve/publish semantics.
//!
//! Producers reserve a contiguous range of sequences, fill the matching slots, then publish the
//! range. Each slot carries a publication marker (`sequence + 1`) so the single consumer can find
//! the highest contiguously published sequence even when several producers finish out of order.
//! Capacity is reclaimed only when the consumer advances its cursor, which means a slot is never
//! written while its previous occupant is still unread.

use crossbeam_utils::{Backoff, CachePadded};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Sleep used once spinning and yielding have been exhausted in a blocking reservation.
const PARK_INTERVAL: Duration = Duration::from_micros(50);

/// Number of producer threads allowed to reserve concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerType {
    /// Exactly one producer thread; reservation is a plain load/store.
    Single,
    /// Any number of producer threads; reservation uses compare-and-swap.
    #[default]
    Multi,
}

struct Slot<T> {
    published: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            value: UnsafeCell::new(None),
        }
    }
}

/// A reserved, not yet published, range of sequences.
///
/// Only [`RingBuffer::reserve`] and [`RingBuffer::try_reserve`] create reservations, and
/// [`RingBuffer::publish`] consumes them, so each range is written exactly once.
#[derive(Debug)]
#[must_use = "a reservation must be published or the consumer stalls"]
pub struct Reservation {
    begin: u64,
    end: u64,
    population: u64,
}

impl Reservation {
    /// First reserved sequence.
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// Last reserved sequence (inclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of reserved sequences.
    pub fn len(&self) -> u64 {
        self.end - self.begin + 1
    }

    /// Unconsumed sequences up to and including this reservation, observed right after
    /// reserving. Equal to [`len`](Self::len) iff the ring was empty in front of this range.
    pub fn population(&self) -> u64 {
        self.population
    }
}

/// Fixed-capacity ring of `Option<T>` slots indexed by monotonic sequences.
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    producer_type: ProducerType,
    /// Number of sequences handed out to producers.
    claimed: CachePadded<AtomicU64>,
    /// Number of sequences the consumer has finished with.
    consumed: CachePadded<AtomicU64>,
    consumer_active: AtomicBool,
}

// Slots are only written by the producer owning the reservation and only read by the holder of
// the consumer token, with publication markers ordering the two.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring with `capacity` slots.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or not a power of two.
    pub fn new(capacity: usize, producer_type: ProducerType) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "ring capacity must be a non-zero power of two, got {capacity}"
        );
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            producer_type,
            claimed: CachePadded::new(AtomicU64::new(0)),
            consumed: CachePadded::new(AtomicU64::new(0)),
            consumer_active: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    /// Producer sequence: number of sequences reserved so far.
    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Acquire)
    }

    /// Consumer cursor: number of sequences consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// `claimed - consumed`. Never negative: `consumed` is read first and both only grow.
    pub fn population(&self) -> u64 {
        let consumed = self.consumed.load(Ordering::Acquire);
        let claimed = self.claimed.load(Ordering::Acquire);
        claimed.saturating_sub(consumed)
    }

    /// Whether the next sequence to consume has been published.
    pub fn has_published(&self) -> bool {
        self.next_published().is_some()
    }

    /// The sequence at the consumer cursor, if it has been published.
    ///
    /// # Returns
    /// `Some(sequence)` when the oldest unconsumed sequence is visible to the consumer, `None`
    /// when the ring is empty or that sequence is still being filled.
    pub fn next_published(&self) -> Option<u64> {
        let next = self.consumed.load(Ordering::Acquire);
        (next < self.claimed.load(Ordering::Acquire) && self.is_published(next)).then_some(next)
    }

    /// Index of the slot that holds `sequence`.
    #[inline]
    pub fn index(&self, sequence: u64) -> usize {
        (sequence & self.mask) as usize
    }

    #[inline]
    fn slot(&self, sequence: u64) -> &Slot<T> {
        &self.slots[self.index(sequence)]
    }

    #[inline]
    fn is_published(&self, sequence: u64) -> bool {
        self.slot(sequence).published.load(Ordering::Acquire) == sequence + 1
    }

    /// Reserve `n` sequences without waiting.
    ///
    /// Single-producer rings claim with a plain store; multi-producer rings use a
    /// compare-and-swap loop on the producer sequence.
    ///
    /// # Returns
    /// The reservation, or `None` when fewer than `n` slots are free.
    ///
    /// # Panics
    /// Panics if `n` is zero.
    pub fn try_reserve(&self, n: u64) -> Option<Reservation> {
        assert!(n > 0, "cannot reserve an empty range");
        let capacity = self.capacity() as u64;
        if n > capacity {
            return None;
        }
        match self.producer_type {
            ProducerType::Single => {
                let current = self.claimed.load(Ordering::Relaxed);
                let consumed = self.consumed.load(Ordering::Acquire);
                if current + n - consumed > capacity {
                    return None;
                }
                self.claimed.store(current + n, Ordering::Release);
                Some(self.reservation(current, n))
            }
            ProducerType::Multi => loop {
                // consumed first, so it can never be ahead of the claim we compare against
                let consumed = self.consumed.load(Ordering::Acquire);
                let current = self.claimed.load(Ordering::Acquire);
                if current + n - consumed > capacity {
                    return None;
                }
                if self
                    .claimed
                    .compare_exchange_weak(
                        current,
                        current + n,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(self.reservation(current, n));
                }
                std::hint::spin_loop();
            },
        }
    }

    /// Reserve `n` sequences, waiting for the consumer to free capacity.
    ///
    /// Spins and yields with [`Backoff`], then parks in short sleeps until room appears. There
    /// is no timeout: a stalled consumer blocks the caller indefinitely.
    ///
    /// # Panics
    /// Panics if `n` is zero or larger than the ring capacity.
    pub fn reserve(&self, n: u64) -> Reservation {
        assert!(
            n <= self.capacity() as u64,
            "cannot reserve {n} sequences in a ring of {}",
            self.capacity()
        );
        let backoff = Backoff::new();
        loop {
            if let Some(reservation) = self.try_reserve(n) {
                return reservation;
            }
            if backoff.is_completed() {
                thread::sleep(PARK_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
    }

    fn reservation(&self, begin: u64, n: u64) -> Reservation {
        let end = begin + n - 1;
        let consumed = self.consumed.load(Ordering::Acquire);
        Reservation {
            begin,
            end,
            population: (end + 1).saturating_sub(consumed),
        }
    }

    /// Fill the reserved slots from `values` in order and make the whole range visible.
    ///
    /// # Arguments
    /// * `reservation` - Range obtained from [`reserve`](Self::reserve) or
    ///   [`try_reserve`](Self::try_reserve)
    /// * `values` - At most `reservation.len()` values
    ///
    /// Slots left without a value (a short iterator) are still published and read back as
    /// empty by the consumer.
    pub fn publish(&self, reservation: Reservation, values: impl IntoIterator<Item = T>) {
        let mut values = values.into_iter();
        for sequence in reservation.begin..=reservation.end {
            let slot = self.slot(sequence);
            // SAFETY: the reservation grants exclusive write access to this sequence and the
            // consumer has already moved past the previous lap of this slot.
            unsafe {
                *slot.value.get() = values.next();
            }
        }
        debug_assert!(values.next().is_none(), "more values than reserved slots");
        for sequence in reservation.begin..=reservation.end {
            self.slot(sequence)
                .published
                .store(sequence + 1, Ordering::Release);
        }
    }

    /// Acquire the single consumer role.
    ///
    /// # Returns
    /// A token that releases the role on drop, or `None` if another thread holds it.
    pub fn consumer(&self) -> Option<ConsumerToken<'_, T>> {
        self.consumer_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ConsumerToken { ring: self })
    }
}

/// Exclusive consumer access to a [`RingBuffer`]; released on drop.
pub struct ConsumerToken<'a, T> {
    ring: &'a RingBuffer<T>,
}

impl<T> ConsumerToken<'_, T> {
    /// Next sequence to consume.
    pub fn next_sequence(&self) -> u64 {
        self.ring.consumed.load(Ordering::Acquire)
    }

    /// Highest sequence such that every sequence from the cursor through it is published.
    pub fn highest_published(&self) -> Option<u64> {
        let claimed = self.ring.claimed.load(Ordering::Acquire);
        let mut next = self.next_sequence();
        let mut highest = None;
        while next < claimed && self.ring.is_published(next) {
            highest = Some(next);
            next += 1;
        }
        highest
    }

    /// Take and clear the value at `sequence`.
    ///
    /// Returns `None` when the sequence is behind the cursor, unpublished, or was published
    /// without a value.
    pub fn take(&self, sequence: u64) -> Option<T> {
        if sequence < self.next_sequence() || !self.ring.is_published(sequence) {
            return None;
        }
        let slot = self.ring.slot(sequence);
        // SAFETY: the sequence is published and not yet released back to producers, and this
        // token is the only reader.
        unsafe { (*slot.value.get()).take() }
    }

    /// Release every sequence below `next` back to producers.
    pub fn advance(&self, next: u64) {
        let current = self.next_sequence();
        debug_assert!(next >= current, "consumer cursor moved backwards");
        debug_assert!(next <= self.ring.claimed(), "consumer cursor passed producer");
        if next > current {
            self.ring.consumed.store(next, Ordering::Release);
        }
    }
}

impl<T> Drop for ConsumerToken<'_, T> {
    fn drop(&mut self) {
        self.ring.consumer_active.store(false, Ordering::Release);
    }
}
