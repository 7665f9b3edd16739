//! Subscriber barrier: adapts an arbitrary downstream consumer onto the
//! demand protocol
//!
//! The barrier guards the reactive-streams rules around a wrapped
//! subscriber: `on_subscribe` happens exactly once, terminals are forwarded
//! exactly once, invalid demand is routed as an error, a failing `on_next`
//! cancels upstream and is reported with the offending value, and `cancel`
//! is serialized and idempotent.

use std::marker::PhantomData;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{ debug, trace };

use crate::error::{ Result, RiffleError };
use crate::streams::{ Event, Subscriber, Subscription };

struct BarrierShared<T, S: Subscriber<T>> {
    downstream: Mutex<S>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    subscribed: AtomicBool,
    terminated: AtomicBool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Event, S: Subscriber<T>> BarrierShared<T, S> {
    /// Forward a terminal error exactly once
    fn route_error(&self, error: Arc<RiffleError>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            trace!(error = %error, "dropping error signal after terminal");
            return;
        }
        self.downstream.lock().on_error(error);
    }

    /// Drop the upstream reference and cancel it; idempotent
    fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.lock().take() {
            upstream.cancel();
        }
    }
}

/// Subscription handle given to the wrapped downstream: validates demand
/// and serializes cancel before reaching the real upstream
struct BarrierSubscription<T, S: Subscriber<T>> {
    shared: Arc<BarrierShared<T, S>>,
}

impl<T: Event, S: Subscriber<T>> Subscription for BarrierSubscription<T, S> {
    fn request(&self, n: i64) {
        if self.shared.terminated.load(Ordering::Acquire) {
            return;
        }
        if n <= 0 {
            debug!(n, "rejecting non-positive demand");
            self.shared.cancel_upstream();
            self.shared.route_error(
                Arc::new(RiffleError::argument(format!("requested demand must be positive, got {n}")))
            );
            return;
        }
        let upstream = self.shared.upstream.lock().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.shared.cancel_upstream();
    }
}

/// Wraps a downstream subscriber and enforces the delivery contract on its
/// behalf. The barrier itself is a subscriber, so it can be handed straight
/// to a publisher.
pub struct SubscriberBarrier<T, S: Subscriber<T>> {
    shared: Arc<BarrierShared<T, S>>,
}

impl<T: Event, S: Subscriber<T>> SubscriberBarrier<T, S> {
    pub fn new(downstream: S) -> Self {
        Self {
            shared: Arc::new(BarrierShared {
                downstream: Mutex::new(downstream),
                upstream: Mutex::new(None),
                subscribed: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                _marker: PhantomData,
            }),
        }
    }

    /// Whether a terminal signal has been forwarded
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }
}

impl<T: Event, S: Subscriber<T>> Subscriber<T> for SubscriberBarrier<T, S> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.shared.subscribed.swap(true, Ordering::AcqRel) {
            // Second subscription is refused: cancel it and report
            subscription.cancel();
            self.shared.route_error(Arc::new(RiffleError::state("subscriber already subscribed")));
            return;
        }
        *self.shared.upstream.lock() = Some(subscription);
        let handle: Arc<dyn Subscription> = Arc::new(BarrierSubscription {
            shared: self.shared.clone(),
        });
        self.shared.downstream.lock().on_subscribe(handle);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        if self.shared.terminated.load(Ordering::Acquire) {
            trace!("dropping data signal after terminal");
            return Ok(());
        }

        let retained = value.clone();
        match self.shared.downstream.lock().on_next(value) {
            Ok(()) => Ok(()),
            Err(RiffleError::Cancelled) => {
                // Control signal: propagate upward, do not route to on_error
                self.shared.cancel_upstream();
                Err(RiffleError::Cancelled)
            }
            Err(error) => {
                self.shared.cancel_upstream();
                self.shared.route_error(
                    Arc::new(
                        RiffleError::subscriber(format!("{error} while handling value {retained:?}"))
                    )
                );
                Ok(())
            }
        }
    }

    fn on_error(&mut self, error: Arc<RiffleError>) {
        self.shared.route_error(error);
    }

    fn on_complete(&mut self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            trace!("dropping completion signal after terminal");
            return;
        }
        self.shared.downstream.lock().on_complete();
    }

    fn capacity(&self) -> i64 {
        self.shared.downstream.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[derive(Default)]
    struct Recording {
        received: Vec<u64>,
        errors: Vec<String>,
        completions: usize,
        fail_on: Option<u64>,
    }

    struct RecordingSubscriber {
        state: Arc<Mutex<Recording>>,
    }

    impl Subscriber<u64> for RecordingSubscriber {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }

        fn on_next(&mut self, value: u64) -> Result<()> {
            let mut state = self.state.lock();
            if state.fail_on == Some(value) {
                return Err(RiffleError::state("handler refused value"));
            }
            state.received.push(value);
            Ok(())
        }

        fn on_error(&mut self, error: Arc<RiffleError>) {
            self.state.lock().errors.push(error.to_string());
        }

        fn on_complete(&mut self) {
            self.state.lock().completions += 1;
        }
    }

    struct CountingSubscription {
        requested: AtomicI64,
        cancels: AtomicI64,
    }

    impl CountingSubscription {
        fn new() -> Self {
            Self {
                requested: AtomicI64::new(0),
                cancels: AtomicI64::new(0),
            }
        }
    }

    impl Subscription for CountingSubscription {
        fn request(&self, n: i64) {
            self.requested.fetch_add(n.min(1 << 40), Ordering::AcqRel);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn harness(
        fail_on: Option<u64>
    ) -> (SubscriberBarrier<u64, RecordingSubscriber>, Arc<Mutex<Recording>>, Arc<CountingSubscription>) {
        let state = Arc::new(
            Mutex::new(Recording {
                fail_on,
                ..Recording::default()
            })
        );
        let barrier = SubscriberBarrier::new(RecordingSubscriber { state: state.clone() });
        let upstream = Arc::new(CountingSubscription::new());
        (barrier, state, upstream)
    }

    #[test]
    fn test_forwards_signals_in_order() {
        let (mut barrier, state, upstream) = harness(None);
        barrier.on_subscribe(upstream.clone());
        barrier.on_next(1).unwrap();
        barrier.on_next(2).unwrap();
        barrier.on_complete();

        let state = state.lock();
        assert_eq!(state.received, vec![1, 2]);
        assert_eq!(state.completions, 1);
        assert!(state.errors.is_empty());
    }

    #[test]
    fn test_double_subscribe_cancels_second() {
        let (mut barrier, state, upstream) = harness(None);
        barrier.on_subscribe(upstream.clone());

        let second = Arc::new(CountingSubscription::new());
        barrier.on_subscribe(second.clone());
        assert_eq!(second.cancels.load(Ordering::Acquire), 1);
        assert_eq!(state.lock().errors.len(), 1);
    }

    #[test]
    fn test_failed_on_next_cancels_and_routes() {
        let (mut barrier, state, upstream) = harness(Some(2));
        barrier.on_subscribe(upstream.clone());

        barrier.on_next(1).unwrap();
        barrier.on_next(2).unwrap();

        assert_eq!(upstream.cancels.load(Ordering::Acquire), 1);
        let state = state.lock();
        assert_eq!(state.received, vec![1]);
        assert_eq!(state.errors.len(), 1);
        // Offending value is carried in the routed error
        assert!(state.errors[0].contains('2'));
    }

    #[test]
    fn test_cancelled_control_signal_passes_through() {
        struct CancellingSubscriber;
        impl Subscriber<u64> for CancellingSubscriber {
            fn on_subscribe(&mut self, _s: Arc<dyn Subscription>) {}
            fn on_next(&mut self, _value: u64) -> Result<()> {
                Err(RiffleError::Cancelled)
            }
            fn on_error(&mut self, _error: Arc<RiffleError>) {
                panic!("control signal must not reach on_error");
            }
            fn on_complete(&mut self) {}
        }

        let mut barrier = SubscriberBarrier::new(CancellingSubscriber);
        let upstream = Arc::new(CountingSubscription::new());
        barrier.on_subscribe(upstream.clone());
        assert!(matches!(barrier.on_next(1), Err(RiffleError::Cancelled)));
        assert_eq!(upstream.cancels.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_terminals_forward_once() {
        let (mut barrier, state, upstream) = harness(None);
        barrier.on_subscribe(upstream);
        barrier.on_complete();
        barrier.on_complete();
        barrier.on_error(Arc::new(RiffleError::state("late")));

        let state = state.lock();
        assert_eq!(state.completions, 1);
        assert!(state.errors.is_empty());
    }

    #[test]
    fn test_invalid_demand_routes_error() {
        // Capture the handle the downstream received, then inject an
        // invalid request through it
        struct HandleCapture {
            handle: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
        }
        impl Subscriber<u64> for HandleCapture {
            fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
                *self.handle.lock() = Some(subscription);
            }
            fn on_next(&mut self, _value: u64) -> Result<()> {
                Ok(())
            }
            fn on_error(&mut self, _error: Arc<RiffleError>) {}
            fn on_complete(&mut self) {}
        }

        let upstream = Arc::new(CountingSubscription::new());
        let handle = Arc::new(Mutex::new(None));
        let mut barrier = SubscriberBarrier::new(HandleCapture { handle: handle.clone() });
        barrier.on_subscribe(upstream.clone());

        let captured = handle.lock().clone().unwrap();
        captured.request(0);
        assert_eq!(upstream.cancels.load(Ordering::Acquire), 1);
        assert!(barrier.is_terminated());
        // Valid demand after terminal is ignored
        captured.request(5);
        assert_eq!(upstream.requested.load(Ordering::Acquire), 0);
    }
}
