//! Sequence barrier: consumer-side coordination against the producer cursor
//!
//! A barrier is what an event processor waits on to discover newly
//! published sequences. It combines the producer cursor, any upstream
//! dependent consumer sequences, a wait strategy, and an alert flag used to
//! unwind waiting consumers for cancellation or shutdown.

use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

use crate::error::{ Result, RiffleError };
use crate::ring::sequence::{ Sequence, SequenceCell };
use crate::ring::sequencer::Sequencer;
use crate::ring::wait_strategy::WaitStrategy;

/// One-shot, resettable signal used to unwind waiting consumers.
/// Cloning shares the underlying flag.
#[derive(Clone)]
pub struct AlertSignal {
    flag: Arc<AtomicBool>,
}

impl AlertSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the alert
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Lower the alert
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Whether the alert is raised
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail with `RiffleError::Alert` when the alert is raised
    #[inline(always)]
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(RiffleError::Alert)
        } else {
            Ok(())
        }
    }
}

impl Default for AlertSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinates one consumer's progress against the producer cursor and any
/// dependent upstream consumer sequences
pub struct SequenceBarrier {
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<SequenceCell>,
    dependents: Vec<Arc<SequenceCell>>,
    alert: AlertSignal,
}

impl SequenceBarrier {
    pub fn new(
        sequencer: Arc<dyn Sequencer>,
        wait_strategy: Arc<dyn WaitStrategy>,
        dependents: Vec<Arc<SequenceCell>>
    ) -> Self {
        let cursor = sequencer.cursor();
        Self {
            sequencer,
            wait_strategy,
            cursor,
            dependents,
            alert: AlertSignal::new(),
        }
    }

    /// Wait until `sequence` is claimable by this consumer.
    ///
    /// Returns the highest sequence safe to process, reduced by dependent
    /// consumers and by the contiguous published prefix of a multi-producer
    /// ring. The return value may be below `sequence` when a dependent is
    /// behind or a claimed slot has not been published yet; callers re-wait.
    pub fn wait_for(&self, sequence: Sequence) -> Result<Sequence> {
        self.alert.check()?;

        let mut available = self.wait_strategy.wait_for(sequence, &self.cursor, &self.alert)?;

        if !self.dependents.is_empty() {
            let dependent_min = self.dependents
                .iter()
                .map(|s| s.get())
                .min()
                .unwrap_or(available);
            available = available.min(dependent_min);
        }

        if available < sequence {
            return Ok(available);
        }
        Ok(self.sequencer.highest_published(sequence, available))
    }

    /// Raise the alert and wake any blocked waiter.
    /// After any barrier check observes the alert, `wait_for` returns no
    /// further values; the caller must unwind.
    pub fn alert(&self) {
        self.alert.set();
        self.wait_strategy.signal_all_when_blocking();
    }

    /// Lower the alert so the barrier can be waited on again
    pub fn clear_alert(&self) {
        self.alert.clear();
    }

    /// Fail with `RiffleError::Alert` when the barrier has been alerted
    pub fn check_alert(&self) -> Result<()> {
        self.alert.check()
    }

    /// Whether the alert is currently raised
    pub fn is_alerted(&self) -> bool {
        self.alert.is_set()
    }

    /// The producer cursor this barrier tracks
    pub fn cursor_value(&self) -> Sequence {
        self.cursor.get()
    }

    /// Wake any waiter blocked on the wait strategy
    pub fn signal(&self) {
        self.wait_strategy.signal_all_when_blocking();
    }
}
