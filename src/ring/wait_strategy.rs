//! Wait strategies for ring buffer consumers
//!
//! This module provides different wait strategies that control how consumers
//! wait for new sequences to be published. Each strategy offers different
//! trade-offs between latency, CPU usage, and throughput.
//!
//! Every strategy probes the barrier alert at least once per iteration so
//! cancellation and shutdown are observed promptly.

use std::thread;
use std::time::{ Duration, Instant };

use serde::{ Deserialize, Serialize };

use crate::constants::{
    BLOCKING_WAIT_SLICE_US,
    DEFAULT_SLEEP_NS,
    SLEEP_SPIN_TRIES,
    YIELD_SPIN_TRIES,
};
use crate::error::Result;
use crate::ring::barrier::AlertSignal;
use crate::ring::sequence::{ Sequence, SequenceCell };

/// Trait for wait strategies that determine how consumers idle until a
/// target sequence becomes available on the producer cursor
pub trait WaitStrategy: Send + Sync {
    /// Wait until the cursor reaches `sequence`.
    ///
    /// Returns the highest currently published cursor value, which is at
    /// least `sequence`, or `RiffleError::Alert` once the barrier has been
    /// alerted for cancellation or shutdown.
    fn wait_for(
        &self,
        sequence: Sequence,
        cursor: &SequenceCell,
        alert: &AlertSignal
    ) -> Result<Sequence>;

    /// Wake all blocked waiters; no-op for non-blocking strategies
    fn signal_all_when_blocking(&self);
}

/// Busy spin wait strategy - lowest latency, highest CPU usage.
/// This strategy continuously checks the cursor in a tight loop, making it
/// ideal when latency is critical and a core can be dedicated to the
/// consumer. It will consume 100% of a CPU core while waiting.
pub struct BusySpinWaitStrategy;

impl BusySpinWaitStrategy {
    /// Create a new busy spin wait strategy
    pub fn new() -> Self {
        Self
    }
}

impl Default for BusySpinWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        cursor: &SequenceCell,
        alert: &AlertSignal
    ) -> Result<Sequence> {
        loop {
            alert.check()?;

            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }

            // CPU pause instruction keeps the spin cheap
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for busy spin - no blocking threads to signal
    }
}

/// Blocking wait strategy - lowest CPU usage at rest, highest wakeup latency.
/// This strategy parks the consumer thread on a condition variable when no
/// sequence is available; the producer signals on every publish. It's a good
/// general-purpose strategy for most applications.
pub struct BlockingWaitStrategy {
    mutex: parking_lot::Mutex<()>,
    condition: parking_lot::Condvar,
}

impl BlockingWaitStrategy {
    /// Create a new blocking wait strategy
    pub fn new() -> Self {
        Self {
            mutex: parking_lot::Mutex::new(()),
            condition: parking_lot::Condvar::new(),
        }
    }
}

impl Default for BlockingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        cursor: &SequenceCell,
        alert: &AlertSignal
    ) -> Result<Sequence> {
        // Bounded wait slices so a missed signal can never strand the
        // consumer; the alert is re-probed on every wakeup.
        let slice = Duration::from_micros(BLOCKING_WAIT_SLICE_US);

        loop {
            alert.check()?;

            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }

            let mut guard = self.mutex.lock();
            // Recheck under the lock to close the publish/park window
            if cursor.get() >= sequence {
                continue;
            }
            let _ = self.condition.wait_for(&mut guard, slice);
        }
    }

    fn signal_all_when_blocking(&self) {
        self.condition.notify_all();
    }
}

/// Sleeping wait strategy - low CPU usage, moderate latency.
/// This strategy spins briefly, then yields, then parks for a short
/// nanosecond interval between probes. Suited to background consumers where
/// CPU usage matters more than latency.
pub struct SleepingWaitStrategy {
    sleep: Duration,
}

impl SleepingWaitStrategy {
    /// Create a new sleeping wait strategy with a custom park interval
    pub fn new(sleep: Duration) -> Self {
        Self { sleep }
    }

    /// Create a new sleeping wait strategy with the default park interval
    pub fn default_sleep() -> Self {
        Self::new(Duration::from_nanos(DEFAULT_SLEEP_NS))
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::default_sleep()
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        cursor: &SequenceCell,
        alert: &AlertSignal
    ) -> Result<Sequence> {
        let mut counter = 0usize;

        loop {
            alert.check()?;

            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }

            if counter < SLEEP_SPIN_TRIES {
                std::hint::spin_loop();
            } else if counter < SLEEP_SPIN_TRIES * 2 {
                thread::yield_now();
            } else {
                thread::sleep(self.sleep);
            }
            counter += 1;
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for sleeping - threads wake up on their own interval
    }
}

/// Yielding wait strategy - moderate CPU usage and latency.
/// This strategy spins for a fixed number of tries, then yields the thread
/// on every further iteration. A good compromise between busy spinning and
/// sleeping, and the default for work processors whose workers contend on
/// the shared claim counter.
pub struct YieldingWaitStrategy {
    spin_tries: usize,
}

impl YieldingWaitStrategy {
    /// Create a new yielding wait strategy
    pub fn new() -> Self {
        Self {
            spin_tries: YIELD_SPIN_TRIES,
        }
    }

    /// Create a new yielding wait strategy with a custom spin budget
    pub fn with_spin_tries(spin_tries: usize) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        cursor: &SequenceCell,
        alert: &AlertSignal
    ) -> Result<Sequence> {
        let mut counter = 0usize;

        loop {
            alert.check()?;

            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }

            if counter < self.spin_tries {
                std::hint::spin_loop();
                counter += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for yielding - threads keep polling
    }
}

/// Phased backoff wait strategy - time-bounded spin, then yield, then fall
/// back to a delegate strategy. Latency degrades gracefully under bursty
/// load while idle periods cost whatever the delegate costs.
pub struct PhasedBackoffWaitStrategy {
    spin_timeout: Duration,
    yield_timeout: Duration,
    fallback: Box<dyn WaitStrategy>,
}

impl PhasedBackoffWaitStrategy {
    /// Create a phased strategy with explicit timeouts and fallback
    pub fn new(spin_timeout: Duration, yield_timeout: Duration, fallback: Box<dyn WaitStrategy>) -> Self {
        Self {
            spin_timeout,
            yield_timeout,
            fallback,
        }
    }

    /// Phased backoff falling back to the blocking strategy
    pub fn with_lock(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self::new(spin_timeout, yield_timeout, Box::new(BlockingWaitStrategy::new()))
    }

    /// Phased backoff falling back to the sleeping strategy
    pub fn with_sleep(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self::new(spin_timeout, yield_timeout, Box::new(SleepingWaitStrategy::default_sleep()))
    }
}

impl WaitStrategy for PhasedBackoffWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        cursor: &SequenceCell,
        alert: &AlertSignal
    ) -> Result<Sequence> {
        let start = Instant::now();

        loop {
            alert.check()?;

            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }

            let elapsed = start.elapsed();
            if elapsed < self.spin_timeout {
                std::hint::spin_loop();
            } else if elapsed < self.spin_timeout + self.yield_timeout {
                thread::yield_now();
            } else {
                return self.fallback.wait_for(sequence, cursor, alert);
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        self.fallback.signal_all_when_blocking();
    }
}

/// Available wait strategies, as configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitStrategyKind {
    /// Park on a condvar; producer signals on publish
    Blocking,
    /// Tight loop for lowest latency
    BusySpin,
    /// Spin then yield every iteration
    Yielding,
    /// Spin, yield, then park for a short interval
    Sleeping,
    /// Time-bounded spin and yield, then block
    Phased,
}

impl WaitStrategyKind {
    /// Build the strategy this kind names
    pub fn build(self) -> std::sync::Arc<dyn WaitStrategy> {
        use std::sync::Arc;
        match self {
            Self::Blocking => Arc::new(BlockingWaitStrategy::new()),
            Self::BusySpin => Arc::new(BusySpinWaitStrategy::new()),
            Self::Yielding => Arc::new(YieldingWaitStrategy::new()),
            Self::Sleeping => Arc::new(SleepingWaitStrategy::default_sleep()),
            Self::Phased =>
                Arc::new(
                    PhasedBackoffWaitStrategy::with_lock(
                        Duration::from_micros(1),
                        Duration::from_micros(10)
                    )
                ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn strategies() -> Vec<Box<dyn WaitStrategy>> {
        vec![
            Box::new(BusySpinWaitStrategy::new()),
            Box::new(BlockingWaitStrategy::new()),
            Box::new(SleepingWaitStrategy::new(Duration::from_nanos(1))),
            Box::new(YieldingWaitStrategy::new()),
            Box::new(
                PhasedBackoffWaitStrategy::with_sleep(
                    Duration::from_micros(1),
                    Duration::from_micros(1)
                )
            )
        ]
    }

    #[test]
    fn test_returns_immediately_when_available() {
        let cursor = SequenceCell::new(100);
        let alert = AlertSignal::new();

        for strategy in strategies() {
            let available = strategy.wait_for(42, &cursor, &alert).unwrap();
            assert!(available >= 42);
            assert_eq!(available, 100);
        }
    }

    #[test]
    fn test_waits_for_cursor_advance() {
        for strategy in strategies() {
            let strategy: Arc<dyn WaitStrategy> = Arc::from(strategy);
            let cursor = Arc::new(SequenceCell::initial());
            let alert = AlertSignal::new();

            let waiter_strategy = strategy.clone();
            let waiter_cursor = cursor.clone();
            let waiter_alert = alert.clone();
            let handle = std::thread::spawn(move || {
                waiter_strategy.wait_for(0, &waiter_cursor, &waiter_alert)
            });

            std::thread::sleep(Duration::from_millis(5));
            cursor.set(0);
            strategy.signal_all_when_blocking();

            let available = handle.join().unwrap().unwrap();
            assert!(available >= 0);
        }
    }

    #[test]
    fn test_alert_unwinds_waiter() {
        for strategy in strategies() {
            let strategy: Arc<dyn WaitStrategy> = Arc::from(strategy);
            let cursor = Arc::new(SequenceCell::initial());
            let alert = AlertSignal::new();

            let waiter_strategy = strategy.clone();
            let waiter_cursor = cursor.clone();
            let waiter_alert = alert.clone();
            let handle = std::thread::spawn(move || {
                waiter_strategy.wait_for(0, &waiter_cursor, &waiter_alert)
            });

            std::thread::sleep(Duration::from_millis(5));
            alert.set();
            strategy.signal_all_when_blocking();

            let result = handle.join().unwrap();
            assert!(matches!(result, Err(crate::error::RiffleError::Alert)));
        }
    }

    #[test]
    fn test_kind_builds_all_variants() {
        let _ = WaitStrategyKind::Blocking.build();
        let _ = WaitStrategyKind::BusySpin.build();
        let _ = WaitStrategyKind::Yielding.build();
        let _ = WaitStrategyKind::Sleeping.build();
        let _ = WaitStrategyKind::Phased.build();
    }
}
