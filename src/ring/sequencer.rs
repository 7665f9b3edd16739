//! Claim/publish sequencers for the ring buffer
//!
//! A sequencer owns the producer cursor and the gating set, and implements
//! the claim/publish protocol for one concurrency pattern:
//!
//! - `SingleProducerSequencer`: one publishing thread; claims are plain
//!   writes guarded by a cached gate, publishes advance the cursor directly.
//! - `MultiProducerSequencer`: any number of publishing threads; claims are
//!   a fetch-and-add on the cursor, publishes mark a per-slot availability
//!   array, and the published prefix is derived by scanning it forward.
//!
//! Consumers must never read a sequence that `highest_published` has not
//! covered; the sequence barrier enforces this.

use std::sync::atomic::{ AtomicI64, Ordering };
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::error::{ Result, RiffleError };
use crate::ring::barrier::AlertSignal;
use crate::ring::sequence::{ Sequence, SequenceCell, SequenceGroup };
use crate::ring::wait_strategy::WaitStrategy;

/// Coordinates producers claiming and publishing sequences on a ring of
/// `buffer_size` slots, without overtaking the slowest gating consumer
pub trait Sequencer: Send + Sync {
    /// Number of slots on the ring
    fn buffer_size(&self) -> usize;

    /// The producer cursor this sequencer advances
    fn cursor(&self) -> Arc<SequenceCell>;

    /// Claim the next `n` sequences, spinning while the ring is full.
    /// Returns the highest claimed sequence. Fails with `InvalidArgument`
    /// for `n == 0` or `n > buffer_size`, and with `Alert` once the
    /// sequencer has been permanently alerted.
    fn next(&self, n: usize) -> Result<Sequence>;

    /// Claim the next `n` sequences without waiting.
    /// Fails with `BufferFull` when the claim would overtake a consumer.
    fn try_next(&self, n: usize) -> Result<Sequence>;

    /// Publish the claimed range `[lo, hi]`, making the slots visible to
    /// consumers and waking any blocked waiters
    fn publish(&self, lo: Sequence, hi: Sequence);

    /// Whether `sequence` has been published
    fn is_available(&self, sequence: Sequence) -> bool;

    /// Highest sequence in `[lo, available]` such that every sequence up to
    /// it has been published; `lo - 1` when `lo` itself is unpublished
    fn highest_published(&self, lo: Sequence, available: Sequence) -> Sequence;

    /// Register a consumer sequence in the gating set, positioned at the
    /// current cursor
    fn add_gating(&self, sequence: Arc<SequenceCell>);

    /// Register a consumer sequence positioned at an explicit sequence,
    /// for consumers that resume from a progress marker behind the cursor
    fn add_gating_at(&self, sequence: Arc<SequenceCell>, position: Sequence);

    /// Deregister a consumer sequence; returns whether it was present
    fn remove_gating(&self, sequence: &Arc<SequenceCell>) -> bool;

    /// Number of registered gating sequences
    fn gating_count(&self) -> usize;

    /// Slots still claimable before the producer would overtake the
    /// slowest consumer
    fn remaining_capacity(&self) -> i64;
}

fn validate_claim(n: usize, buffer_size: usize) -> Result<()> {
    if n == 0 {
        return Err(RiffleError::argument("claim count must be positive"));
    }
    if n > buffer_size {
        return Err(
            RiffleError::argument(format!("claim count {n} exceeds buffer size {buffer_size}"))
        );
    }
    Ok(())
}

/// Sequencer for a single publishing thread.
///
/// Claim bookkeeping uses relaxed atomics: only the owning producer thread
/// writes `claimed` and `cached_gate`, the atomics exist so the sequencer
/// can be shared behind an `Arc`.
pub struct SingleProducerSequencer {
    buffer_size: usize,
    cursor: Arc<SequenceCell>,
    gating: SequenceGroup,
    wait_strategy: Arc<dyn WaitStrategy>,
    alert: AlertSignal,
    claimed: AtomicI64,
    cached_gate: AtomicI64,
}

impl SingleProducerSequencer {
    pub fn new(
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
        alert: AlertSignal
    ) -> Self {
        Self {
            buffer_size,
            cursor: Arc::new(SequenceCell::initial()),
            gating: SequenceGroup::new(),
            wait_strategy,
            alert,
            claimed: AtomicI64::new(crate::constants::INITIAL_SEQUENCE),
            cached_gate: AtomicI64::new(crate::constants::INITIAL_SEQUENCE),
        }
    }

    fn has_capacity(&self, n: usize, claimed: Sequence) -> bool {
        let wrap_point = claimed + (n as i64) - (self.buffer_size as i64);
        let cached = self.cached_gate.load(Ordering::Relaxed);
        if wrap_point > cached || cached > claimed {
            let min = self.gating.minimum(claimed);
            self.cached_gate.store(min, Ordering::Relaxed);
            return wrap_point <= min;
        }
        true
    }
}

impl Sequencer for SingleProducerSequencer {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn cursor(&self) -> Arc<SequenceCell> {
        self.cursor.clone()
    }

    fn next(&self, n: usize) -> Result<Sequence> {
        validate_claim(n, self.buffer_size)?;

        let claimed = self.claimed.load(Ordering::Relaxed);
        let backoff = Backoff::new();
        loop {
            self.alert.check()?;
            if self.has_capacity(n, claimed) {
                break;
            }
            backoff.snooze();
        }

        let next = claimed + (n as i64);
        self.claimed.store(next, Ordering::Relaxed);
        Ok(next)
    }

    fn try_next(&self, n: usize) -> Result<Sequence> {
        validate_claim(n, self.buffer_size)?;
        self.alert.check()?;

        let claimed = self.claimed.load(Ordering::Relaxed);
        if !self.has_capacity(n, claimed) {
            return Err(RiffleError::BufferFull);
        }

        let next = claimed + (n as i64);
        self.claimed.store(next, Ordering::Relaxed);
        Ok(next)
    }

    fn publish(&self, _lo: Sequence, hi: Sequence) {
        self.cursor.set(hi);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: Sequence) -> bool {
        sequence <= self.cursor.get()
    }

    fn highest_published(&self, _lo: Sequence, available: Sequence) -> Sequence {
        // Single producer publishes contiguously; the cursor is the prefix
        available
    }

    fn add_gating(&self, sequence: Arc<SequenceCell>) {
        self.gating.add(sequence, self.cursor.get());
    }

    fn add_gating_at(&self, sequence: Arc<SequenceCell>, position: Sequence) {
        self.gating.add(sequence, position);
    }

    fn remove_gating(&self, sequence: &Arc<SequenceCell>) -> bool {
        self.gating.remove(sequence)
    }

    fn gating_count(&self) -> usize {
        self.gating.len()
    }

    fn remaining_capacity(&self) -> i64 {
        let claimed = self.claimed.load(Ordering::Relaxed);
        let consumed = self.gating.minimum(claimed);
        (self.buffer_size as i64) - (claimed - consumed)
    }
}

/// Sequencer for any number of publishing threads.
///
/// The cursor doubles as the next-to-claim counter: `next` claims by
/// fetch-and-add, so the cursor can run ahead of what is actually
/// published. A parallel availability array records the wrap count of the
/// highest publish at each slot index; the published prefix is recovered by
/// scanning it forward from a known-published point.
pub struct MultiProducerSequencer {
    buffer_size: usize,
    cursor: Arc<SequenceCell>,
    gating: SequenceGroup,
    wait_strategy: Arc<dyn WaitStrategy>,
    alert: AlertSignal,
    cached_gate: AtomicI64,
    available: Box<[AtomicI64]>,
    index_mask: usize,
    index_shift: u32,
}

impl MultiProducerSequencer {
    pub fn new(
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
        alert: AlertSignal
    ) -> Self {
        let available = (0..buffer_size)
            .map(|_| AtomicI64::new(-1))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer_size,
            cursor: Arc::new(SequenceCell::initial()),
            gating: SequenceGroup::new(),
            wait_strategy,
            alert,
            cached_gate: AtomicI64::new(crate::constants::INITIAL_SEQUENCE),
            available,
            index_mask: buffer_size - 1,
            index_shift: buffer_size.trailing_zeros(),
        }
    }

    #[inline(always)]
    fn wrap_count(&self, sequence: Sequence) -> i64 {
        sequence >> self.index_shift
    }

    #[inline(always)]
    fn set_available(&self, sequence: Sequence) {
        let index = (sequence as usize) & self.index_mask;
        self.available[index].store(self.wrap_count(sequence), Ordering::Release);
    }
}

impl Sequencer for MultiProducerSequencer {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn cursor(&self) -> Arc<SequenceCell> {
        self.cursor.clone()
    }

    fn next(&self, n: usize) -> Result<Sequence> {
        validate_claim(n, self.buffer_size)?;
        self.alert.check()?;

        // Claim unconditionally, then wait for the slowest consumer to free
        // the claimed slots before handing them to the caller.
        let next = self.cursor.add_and_get(n as i64);
        let wrap_point = next - (self.buffer_size as i64);

        if wrap_point > self.cached_gate.load(Ordering::Relaxed) {
            let backoff = Backoff::new();
            loop {
                self.alert.check()?;
                let min = self.gating.minimum(next - (n as i64));
                if wrap_point <= min {
                    self.cached_gate.store(min, Ordering::Relaxed);
                    break;
                }
                backoff.snooze();
            }
        }

        Ok(next)
    }

    fn try_next(&self, n: usize) -> Result<Sequence> {
        validate_claim(n, self.buffer_size)?;

        loop {
            self.alert.check()?;

            let current = self.cursor.get();
            let next = current + (n as i64);
            let wrap_point = next - (self.buffer_size as i64);
            if wrap_point > self.gating.minimum(current) {
                return Err(RiffleError::BufferFull);
            }
            if self.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
            std::hint::spin_loop();
        }
    }

    fn publish(&self, lo: Sequence, hi: Sequence) {
        let mut sequence = lo;
        while sequence <= hi {
            self.set_available(sequence);
            sequence += 1;
        }
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: Sequence) -> bool {
        let index = (sequence as usize) & self.index_mask;
        self.available[index].load(Ordering::Acquire) == self.wrap_count(sequence)
    }

    fn highest_published(&self, lo: Sequence, available: Sequence) -> Sequence {
        let mut sequence = lo;
        while sequence <= available {
            if !self.is_available(sequence) {
                return sequence - 1;
            }
            sequence += 1;
        }
        available
    }

    fn add_gating(&self, sequence: Arc<SequenceCell>) {
        self.gating.add(sequence, self.cursor.get());
    }

    fn add_gating_at(&self, sequence: Arc<SequenceCell>, position: Sequence) {
        self.gating.add(sequence, position);
    }

    fn remove_gating(&self, sequence: &Arc<SequenceCell>) -> bool {
        self.gating.remove(sequence)
    }

    fn gating_count(&self) -> usize {
        self.gating.len()
    }

    fn remaining_capacity(&self) -> i64 {
        let claimed = self.cursor.get();
        let consumed = self.gating.minimum(claimed);
        (self.buffer_size as i64) - (claimed - consumed)
    }
}
