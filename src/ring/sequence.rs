//! Sequence counters for ring buffer coordination
//!
//! A sequence is a monotonically non-decreasing 64-bit counter naming a
//! position in a ring buffer. Producer cursors, consumer progress and the
//! shared work sequence are all sequence cells. Cells are padded to two
//! cache lines to prevent false sharing on modern Intel CPUs that prefetch
//! two lines at a time.

use std::sync::atomic::{ AtomicI64, Ordering };
use std::sync::Arc;

use parking_lot::RwLock;
use static_assertions::const_assert_eq;

use crate::constants::{ INITIAL_SEQUENCE, SEQUENCE_DONE, SEQUENCE_PADDING };

/// Sequence number type for ring buffer positions.
/// Starts at -1 ("nothing published") and only moves forward.
pub type Sequence = i64;

/// Cache-line padded atomic sequence cell
#[repr(align(128))]
pub struct SequenceCell {
    value: AtomicI64,
    _padding: [u8; SEQUENCE_PADDING - 8],
}

const_assert_eq!(std::mem::size_of::<SequenceCell>(), SEQUENCE_PADDING);

impl SequenceCell {
    /// Create a new cell with the given initial value
    pub fn new(initial: Sequence) -> Self {
        Self {
            value: AtomicI64::new(initial),
            _padding: [0; SEQUENCE_PADDING - 8],
        }
    }

    /// Create a new cell at the initial "nothing published" value
    pub fn initial() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }

    /// Read the sequence with acquire semantics
    #[inline(always)]
    pub fn get(&self) -> Sequence {
        self.value.load(Ordering::Acquire)
    }

    /// Read the sequence with relaxed semantics (same-thread bookkeeping)
    #[inline(always)]
    pub fn get_relaxed(&self) -> Sequence {
        self.value.load(Ordering::Relaxed)
    }

    /// Write the sequence with release semantics
    #[inline(always)]
    pub fn set(&self, sequence: Sequence) {
        self.value.store(sequence, Ordering::Release);
    }

    /// Atomically claim the next `n` sequences, returning the highest claimed
    #[inline(always)]
    pub fn add_and_get(&self, n: i64) -> Sequence {
        self.value.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Compare-and-set with acquire/release semantics
    #[inline(always)]
    pub fn compare_and_set(&self, current: Sequence, next: Sequence) -> bool {
        self.value
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for SequenceCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SequenceCell").field(&self.get()).finish()
    }
}

/// The set of consumer sequences that bound how far a producer may advance.
///
/// Consumers register on subscribe and deregister on cancel or completion.
/// Removal never races with a producer's overtake check: a departing
/// consumer first parks its cell at `SEQUENCE_DONE` (which can never be the
/// minimum) and only then drops out of the set.
pub struct SequenceGroup {
    sequences: RwLock<Vec<Arc<SequenceCell>>>,
}

impl SequenceGroup {
    pub fn new() -> Self {
        Self {
            sequences: RwLock::new(Vec::new()),
        }
    }

    /// Register a consumer sequence, positioned at `position`
    pub fn add(&self, sequence: Arc<SequenceCell>, position: Sequence) {
        sequence.set(position);
        self.sequences.write().push(sequence);
    }

    /// Deregister a consumer sequence. The cell is parked at `SEQUENCE_DONE`
    /// before removal so an in-flight minimum scan cannot observe a stale
    /// gate. Returns whether the sequence was present.
    pub fn remove(&self, sequence: &Arc<SequenceCell>) -> bool {
        sequence.set(SEQUENCE_DONE);
        let mut sequences = self.sequences.write();
        let before = sequences.len();
        sequences.retain(|s| !Arc::ptr_eq(s, sequence));
        sequences.len() != before
    }

    /// Minimum sequence over all registered consumers, or `fallback` when
    /// the group is empty (an unobserved producer gates on itself)
    pub fn minimum(&self, fallback: Sequence) -> Sequence {
        self.sequences
            .read()
            .iter()
            .map(|s| s.get())
            .min()
            .unwrap_or(fallback)
    }

    /// Number of registered consumer sequences
    pub fn len(&self) -> usize {
        self.sequences.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.read().is_empty()
    }
}

impl Default for SequenceGroup {
    fn default() -> Self {
        Self::new()
    }
}
