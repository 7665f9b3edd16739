//! Reactive-streams contract: publishers, subscribers, subscriptions
//!
//! This module defines the demand-driven delivery contract the processors
//! implement, and the [`Signal`] envelope that carries data and terminal
//! signals through the ring in publication order.
//!
//! Downstream failures are modeled as fallible callbacks: `on_next` returns
//! a `Result`, and an `Err` other than the `Cancelled` control signal is
//! routed to `on_error` after cancelling upstream.

pub mod barrier;
pub mod demand;

pub use barrier::SubscriberBarrier;
pub use demand::SubscriptionState;

use std::fmt;
use std::sync::Arc;

use serde::{ Deserialize, Serialize };

use crate::constants::UNBOUNDED_DEMAND;
use crate::error::{ Result, RiffleError };

/// Bound for values carried through a processor.
/// `Debug` lets a failed delivery be reported together with the offending
/// value; the rest are the slot-storage requirements.
pub trait Event: Clone + Default + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Default + fmt::Debug + Send + Sync + 'static> Event for T {}

/// The per-subscription handle a subscriber uses to pull data and to leave
pub trait Subscription: Send + Sync {
    /// Request `n` more items. `n` must be positive; `i64::MAX` means
    /// unbounded and is sticky.
    fn request(&self, n: i64);

    /// Stop delivery. Idempotent; releases this subscriber's gate on the
    /// producer.
    fn cancel(&self);
}

/// A demand-driven consumer of values of type `T`
pub trait Subscriber<T>: Send + 'static {
    /// Called exactly once, before any other signal
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// Called once per value, never exceeding requested demand.
    /// Returning `Err(RiffleError::Cancelled)` unwinds delivery as a
    /// control signal; any other error cancels upstream and is routed to
    /// `on_error`.
    fn on_next(&mut self, value: T) -> Result<()>;

    /// Terminal failure signal; no further signals follow
    fn on_error(&mut self, error: Arc<RiffleError>);

    /// Terminal completion signal; no further signals follow
    fn on_complete(&mut self);

    /// Buffer capacity this subscriber advertises; unbounded by default
    fn capacity(&self) -> i64 {
        UNBOUNDED_DEMAND
    }
}

impl<T: 'static> Subscriber<T> for Box<dyn Subscriber<T>> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        (**self).on_subscribe(subscription)
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        (**self).on_next(value)
    }

    fn on_error(&mut self, error: Arc<RiffleError>) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }

    fn capacity(&self) -> i64 {
        (**self).capacity()
    }
}

/// A source of values that accepts subscribers
pub trait Publisher<T> {
    /// Attach a subscriber. `on_subscribe` is called exactly once before
    /// any data signal.
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()>;
}

/// Kind discriminant for ring slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignalKind {
    /// Slot has never been written
    Empty = 0,
    /// Data signal
    Next = 1,
    /// Terminal completion signal
    Complete = 2,
    /// Terminal failure signal
    Error = 3,
}

impl Default for SignalKind {
    fn default() -> Self {
        Self::Empty
    }
}

/// Envelope stored in ring slots: a data value, a terminal signal, or a
/// retry of a failed work delivery. Terminals travel in-band so they are
/// ordered after every preceding data signal.
#[derive(Debug, Clone, Default)]
pub struct Signal<T> {
    kind: SignalKind,
    value: Option<T>,
    error: Option<Arc<RiffleError>>,
    attempt: u32,
}

impl<T> Signal<T> {
    /// Data signal carrying `value`
    pub fn next(value: T) -> Self {
        Self {
            kind: SignalKind::Next,
            value: Some(value),
            error: None,
            attempt: 0,
        }
    }

    /// Re-publication of a failed work delivery
    pub fn retry(value: T, attempt: u32) -> Self {
        Self {
            kind: SignalKind::Next,
            value: Some(value),
            error: None,
            attempt,
        }
    }

    /// Terminal completion signal
    pub fn complete() -> Self {
        Self {
            kind: SignalKind::Complete,
            value: None,
            error: None,
            attempt: 0,
        }
    }

    /// Terminal failure signal
    pub fn error(error: Arc<RiffleError>) -> Self {
        Self {
            kind: SignalKind::Error,
            value: None,
            error: Some(error),
            attempt: 0,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Delivery attempts already made for this value
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Take the carried value out of a data signal
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Take the carried error out of a failure signal
    pub fn into_error(self) -> Option<Arc<RiffleError>> {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_slot_is_empty() {
        let signal: Signal<u64> = Signal::default();
        assert_eq!(signal.kind(), SignalKind::Empty);
        assert!(signal.into_value().is_none());
    }

    #[test]
    fn test_signal_constructors() {
        let signal = Signal::next(7u64);
        assert_eq!(signal.kind(), SignalKind::Next);
        assert_eq!(signal.into_value(), Some(7));

        let signal: Signal<u64> = Signal::complete();
        assert_eq!(signal.kind(), SignalKind::Complete);

        let err = Arc::new(RiffleError::state("boom"));
        let signal: Signal<u64> = Signal::error(err.clone());
        assert_eq!(signal.kind(), SignalKind::Error);
        assert!(Arc::ptr_eq(&signal.into_error().unwrap(), &err));
    }

    #[test]
    fn test_retry_tracks_attempts() {
        let signal = Signal::retry(1u64, 2);
        assert_eq!(signal.kind(), SignalKind::Next);
        assert_eq!(signal.attempt(), 2);
    }
}
