//! Lock-free bounded ring buffer with sequenced claim/publish
//!
//! The ring buffer is a fixed-size power-of-two slot array indexed by
//! `sequence & (size - 1)`, with a producer cursor and a claim/publish
//! protocol supplied by a [`Sequencer`]. Producers claim sequences, write
//! the slots, then publish; consumers discover published sequences through
//! a [`SequenceBarrier`] and read the slots between their tracked sequence
//! and the published prefix.
//!
//! Two slot storage modes satisfy the same invariants:
//!
//! - [`SlotMode::Atomic`]: direct slot access through `UnsafeCell`,
//!   synchronized only by the release-publish/acquire-read protocol
//! - [`SlotMode::Locked`]: a mutex per slot, for targets where the direct
//!   path cannot be used

pub mod barrier;
pub mod sequence;
pub mod sequencer;
pub mod wait_strategy;

pub use barrier::{ AlertSignal, SequenceBarrier };
pub use sequence::{ Sequence, SequenceCell, SequenceGroup };
pub use sequencer::{ MultiProducerSequencer, Sequencer, SingleProducerSequencer };
pub use wait_strategy::{
    BlockingWaitStrategy,
    BusySpinWaitStrategy,
    PhasedBackoffWaitStrategy,
    SleepingWaitStrategy,
    WaitStrategy,
    WaitStrategyKind,
    YieldingWaitStrategy,
};

use std::cell::UnsafeCell;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{ Deserialize, Serialize };

use crate::constants::MAX_BUFFER_SIZE;
use crate::error::{ Result, RiffleError };

/// Slot storage discipline for a ring buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotMode {
    /// Direct slot access synchronized by the claim/publish protocol
    Atomic,
    /// A mutex per slot; the fallback where direct access cannot be used
    Locked,
}

impl Default for SlotMode {
    fn default() -> Self {
        Self::Atomic
    }
}

enum Slots<T> {
    Atomic(Box<[UnsafeCell<T>]>),
    Locked(Box<[Mutex<T>]>),
}

/// Fixed-size power-of-two slot array with a sequenced claim/publish
/// protocol. Slots are owned by the buffer for its entire lifetime and
/// reused across wraps.
pub struct RingBuffer<T> {
    slots: Slots<T>,
    mask: usize,
    sequencer: Arc<dyn Sequencer>,
}

// SAFETY: slots behind UnsafeCell are shared between threads, but the
// claim/publish protocol guarantees exclusive write access to a claimed
// slot and read access only after the release-publish of that sequence.
// Gating prevents the producer from re-claiming a slot a consumer may
// still read.
unsafe impl<T: Send + Sync> Send for RingBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T: Clone + Default + Send + Sync> RingBuffer<T> {
    /// Create a ring of `size` default-initialized slots driven by the
    /// given sequencer. Size must be a power of two in `[1, 2^30]`.
    pub fn new(size: usize, sequencer: Arc<dyn Sequencer>, mode: SlotMode) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RiffleError::config("buffer size must be a power of 2"));
        }
        if size > MAX_BUFFER_SIZE {
            return Err(
                RiffleError::config(format!("buffer size {size} exceeds maximum {MAX_BUFFER_SIZE}"))
            );
        }

        let slots = match mode {
            SlotMode::Atomic =>
                Slots::Atomic(
                    (0..size)
                        .map(|_| UnsafeCell::new(T::default()))
                        .collect::<Vec<_>>()
                        .into_boxed_slice()
                ),
            SlotMode::Locked =>
                Slots::Locked(
                    (0..size)
                        .map(|_| Mutex::new(T::default()))
                        .collect::<Vec<_>>()
                        .into_boxed_slice()
                ),
        };

        Ok(Self {
            slots,
            mask: size - 1,
            sequencer,
        })
    }

    /// Number of slots on the ring
    pub fn buffer_size(&self) -> usize {
        self.mask + 1
    }

    /// The sequencer driving this ring
    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    /// Slots still claimable before the producer would overtake the
    /// slowest consumer
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// Write the slot for a claimed, unpublished sequence
    pub(crate) fn write(&self, sequence: Sequence, value: T) {
        let index = (sequence as usize) & self.mask;
        match &self.slots {
            Slots::Atomic(slots) => {
                // SAFETY: the caller claimed `sequence`, so no other
                // producer writes this slot, and no consumer reads it
                // before the matching publish.
                unsafe {
                    *slots[index].get() = value;
                }
            }
            Slots::Locked(slots) => {
                *slots[index].lock() = value;
            }
        }
    }

    /// Read the slot for a published sequence
    pub(crate) fn read(&self, sequence: Sequence) -> T {
        let index = (sequence as usize) & self.mask;
        match &self.slots {
            Slots::Atomic(slots) => {
                // SAFETY: `sequence` was published (acquire-observed by the
                // caller's barrier), and gating keeps the producer from
                // reusing the slot until the caller's tracked sequence
                // passes it.
                unsafe { (*slots[index].get()).clone() }
            }
            Slots::Locked(slots) => slots[index].lock().clone(),
        }
    }

    /// Claim the next sequence, write `value`, and publish it.
    /// Spins while the ring is full.
    pub fn publish_one(&self, value: T) -> Result<Sequence> {
        let sequence = self.sequencer.next(1)?;
        self.write(sequence, value);
        self.sequencer.publish(sequence, sequence);
        Ok(sequence)
    }

    /// Claim, write and publish without waiting for capacity.
    /// Fails with `BufferFull` when the ring is full.
    pub fn try_publish_one(&self, value: T) -> Result<Sequence> {
        let sequence = self.sequencer.try_next(1)?;
        self.write(sequence, value);
        self.sequencer.publish(sequence, sequence);
        Ok(sequence)
    }
}
