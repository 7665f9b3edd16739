//! Riffle tuning constants and configuration defaults
//!
//! This module contains the tuning constants and default configuration
//! values used throughout the Riffle library.

/// Sequence value meaning "nothing published yet"
pub const INITIAL_SEQUENCE: i64 = -1;

/// Sequence value marking a consumer as finished (removed from gating)
pub const SEQUENCE_DONE: i64 = i64::MAX;

/// Demand value meaning "unbounded"; sticky once requested
pub const UNBOUNDED_DEMAND: i64 = i64::MAX;

/// Default ring buffer size for small processors (must be power of 2)
pub const DEFAULT_SMALL_BUFFER_SIZE: usize = 256;

/// Default ring buffer size for medium processors
pub const DEFAULT_MEDIUM_BUFFER_SIZE: usize = 8192;

/// Maximum ring buffer size (slot arrays are allocated eagerly)
pub const MAX_BUFFER_SIZE: usize = 1 << 30;

/// Cache line size for alignment optimizations (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Sequence padding width; two cache lines to defeat adjacent-line prefetch
pub const SEQUENCE_PADDING: usize = 128;

/// Spin iterations before a yielding wait strategy starts yielding
pub const YIELD_SPIN_TRIES: usize = 100;

/// Spin iterations before a sleeping wait strategy starts parking
pub const SLEEP_SPIN_TRIES: usize = 10;

/// Park interval for the sleeping wait strategy (nanoseconds)
pub const DEFAULT_SLEEP_NS: u64 = 100;

/// Condvar wait slice for the blocking wait strategy (microseconds)
pub const BLOCKING_WAIT_SLICE_US: u64 = 100;

/// Delivery attempts per event before a work processor dead-letters it
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Upper bound on the default service concurrency
pub const DEFAULT_CONCURRENCY_CAP: usize = 2;
