//! Per-subscription demand accounting
//!
//! Each subscription tracks the demand its subscriber has requested but not
//! yet received. Demand saturates at `i64::MAX`, which means "unbounded"
//! and is sticky: once unbounded, later finite requests and deliveries do
//! not decrement it.

use std::sync::atomic::{ AtomicBool, AtomicI64, Ordering };

use parking_lot::Mutex;

use crate::constants::UNBOUNDED_DEMAND;
use crate::error::RiffleError;

/// Shared mutable state of one subscription: pending demand, the cancelled
/// flag, and a deferred fault raised by an invalid `request`
pub struct SubscriptionState {
    demand: AtomicI64,
    cancelled: AtomicBool,
    fault: Mutex<Option<RiffleError>>,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self {
            demand: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }

    /// Add `n` to pending demand, saturating at unbounded.
    /// `n` must already be validated positive by the caller.
    pub fn add_demand(&self, n: i64) {
        let mut current = self.demand.load(Ordering::Relaxed);
        loop {
            if current == UNBOUNDED_DEMAND {
                return;
            }
            let next = current.saturating_add(n);
            match
                self.demand.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed
                )
            {
                Ok(_) => {
                    return;
                }
                Err(actual) => {
                    current = actual;
                }
            }
        }
    }

    /// Claim up to `max` items of pending demand, returning how many were
    /// granted. Unbounded demand grants `max` without decrementing.
    pub fn try_claim(&self, max: i64) -> i64 {
        debug_assert!(max > 0);
        let mut current = self.demand.load(Ordering::Relaxed);
        loop {
            if current == UNBOUNDED_DEMAND {
                return max;
            }
            let granted = current.min(max);
            if granted == 0 {
                return 0;
            }
            match
                self.demand.compare_exchange_weak(
                    current,
                    current - granted,
                    Ordering::AcqRel,
                    Ordering::Relaxed
                )
            {
                Ok(_) => {
                    return granted;
                }
                Err(actual) => {
                    current = actual;
                }
            }
        }
    }

    /// Pending demand right now
    pub fn demand(&self) -> i64 {
        self.demand.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.demand() == UNBOUNDED_DEMAND
    }

    /// Mark the subscription cancelled; idempotent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record a fault to be raised on the delivery thread. The first fault
    /// wins.
    pub fn set_fault(&self, error: RiffleError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(error);
        }
    }

    /// Take a recorded fault, if any
    pub fn take_fault(&self) -> Option<RiffleError> {
        self.fault.lock().take()
    }
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_demand_accumulates() {
        let state = SubscriptionState::new();
        state.add_demand(5);
        state.add_demand(3);
        assert_eq!(state.demand(), 8);
    }

    #[test]
    fn test_claim_decrements() {
        let state = SubscriptionState::new();
        state.add_demand(5);
        assert_eq!(state.try_claim(3), 3);
        assert_eq!(state.try_claim(10), 2);
        assert_eq!(state.try_claim(1), 0);
    }

    #[test]
    fn test_unbounded_is_sticky() {
        let state = SubscriptionState::new();
        state.add_demand(UNBOUNDED_DEMAND);
        assert!(state.is_unbounded());

        state.add_demand(10);
        assert!(state.is_unbounded());

        assert_eq!(state.try_claim(100), 100);
        assert!(state.is_unbounded());
    }

    #[test]
    fn test_saturating_overflow() {
        let state = SubscriptionState::new();
        state.add_demand(i64::MAX - 1);
        state.add_demand(i64::MAX - 1);
        assert!(state.is_unbounded());
    }

    #[test]
    fn test_first_fault_wins() {
        let state = SubscriptionState::new();
        state.set_fault(RiffleError::argument("first"));
        state.set_fault(RiffleError::argument("second"));
        let fault = state.take_fault().unwrap();
        assert_eq!(fault.to_string(), "Invalid argument: first");
        assert!(state.take_fault().is_none());
    }

    proptest! {
        #[test]
        fn prop_claims_never_exceed_requests(requests in proptest::collection::vec(1i64..1000, 1..20)) {
            let state = SubscriptionState::new();
            let mut requested: i64 = 0;
            let mut granted: i64 = 0;
            for n in requests {
                state.add_demand(n);
                requested += n;
                granted += state.try_claim(7);
            }
            granted += state.try_claim(i64::MAX - 1);
            prop_assert_eq!(granted, requested.min(i64::MAX));
            prop_assert_eq!(state.demand(), 0);
        }
    }
}
