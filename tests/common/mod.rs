//! Shared test subscriber used by the end-to-end scenarios
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{ Duration, Instant };

use parking_lot::Mutex;

use riffle::{ Result, RiffleError, Subscriber, Subscription };

/// Everything a test subscriber observed
pub struct Recording<T> {
    pub received: Vec<T>,
    pub errors: Vec<String>,
    pub completions: usize,
}

impl<T> Default for Recording<T> {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            errors: Vec::new(),
            completions: 0,
        }
    }
}

type FailPredicate<T> = Box<dyn FnMut(&T) -> bool + Send>;

/// Configurable recording subscriber: initial demand, cancel-after-count,
/// and an optional delivery-failure predicate
pub struct TestSubscriber<T> {
    state: Arc<Mutex<Recording<T>>>,
    subscription: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
    initial_request: i64,
    cancel_after: Option<usize>,
    fail_when: Option<FailPredicate<T>>,
}

/// Test-side view of a subscriber's recording and subscription
pub struct TestHandle<T> {
    state: Arc<Mutex<Recording<T>>>,
    subscription: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
}

impl<T: Clone> TestHandle<T> {
    pub fn received(&self) -> Vec<T> {
        self.state.lock().received.clone()
    }

    pub fn received_len(&self) -> usize {
        self.state.lock().received.len()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub fn completions(&self) -> usize {
        self.state.lock().completions
    }

    pub fn request(&self, n: i64) {
        if let Some(subscription) = self.subscription.lock().clone() {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        if let Some(subscription) = self.subscription.lock().clone() {
            subscription.cancel();
        }
    }
}

pub struct TestSubscriberBuilder<T> {
    initial_request: i64,
    cancel_after: Option<usize>,
    fail_when: Option<FailPredicate<T>>,
}

impl<T> TestSubscriberBuilder<T> {
    pub fn cancel_after(mut self, count: usize) -> Self {
        self.cancel_after = Some(count);
        self
    }

    pub fn fail_when(mut self, predicate: impl FnMut(&T) -> bool + Send + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    pub fn build(self) -> (TestSubscriber<T>, TestHandle<T>) {
        let state = Arc::new(Mutex::new(Recording::default()));
        let subscription = Arc::new(Mutex::new(None));
        (
            TestSubscriber {
                state: state.clone(),
                subscription: subscription.clone(),
                initial_request: self.initial_request,
                cancel_after: self.cancel_after,
                fail_when: self.fail_when,
            },
            TestHandle { state, subscription },
        )
    }
}

/// Subscriber that requests `initial_request` on subscribe
pub fn subscriber<T>(initial_request: i64) -> TestSubscriberBuilder<T> {
    TestSubscriberBuilder {
        initial_request,
        cancel_after: None,
        fail_when: None,
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        *self.subscription.lock() = Some(subscription.clone());
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        if let Some(fail_when) = self.fail_when.as_mut() {
            if fail_when(&value) {
                return Err(RiffleError::state("test subscriber refused value"));
            }
        }
        let count = {
            let mut state = self.state.lock();
            state.received.push(value);
            state.received.len()
        };
        if let Some(cancel_after) = self.cancel_after {
            if count >= cancel_after {
                if let Some(subscription) = self.subscription.lock().clone() {
                    subscription.cancel();
                }
            }
        }
        Ok(())
    }

    fn on_error(&mut self, error: Arc<RiffleError>) {
        self.state.lock().errors.push(error.to_string());
    }

    fn on_complete(&mut self) {
        self.state.lock().completions += 1;
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub const LONG_WAIT: Duration = Duration::from_secs(10);
pub const SETTLE: Duration = Duration::from_millis(50);
