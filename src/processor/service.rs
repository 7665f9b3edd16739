//! Shared processor service
//!
//! Fronts one backing processor with a fixed worker budget: logical
//! subscribers register through the service, every worker carries the
//! configured uncaught-exception handler, and when the last logical
//! subscriber unregisters (with auto-shutdown enabled) the service
//! completes the backing processor, joins its workers, and runs the
//! shutdown handler exactly once.

use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{ debug, info };

use crate::constants::DEFAULT_CONCURRENCY_CAP;
use crate::error::{ Result, RiffleError };
use crate::processor::{ default_uncaught_handler, ShutdownHandler, UncaughtHandler };
use crate::processor::broadcast::BroadcastProcessor;
use crate::processor::work::WorkProcessor;
use crate::streams::{ Event, Subscriber, Subscription };

/// Default worker budget: `min(available cores, 2)`
pub fn default_concurrency() -> usize {
    num_cpus::get().min(DEFAULT_CONCURRENCY_CAP).max(1)
}

/// The processor a service dispatches through
pub enum ServiceBacking<T: Event> {
    /// Every logical subscriber sees every event
    Broadcast(BroadcastProcessor<T>),
    /// Events are partitioned across the worker pool
    Work(WorkProcessor<T>),
}

impl<T: Event> ServiceBacking<T> {
    fn is_work(&self) -> bool {
        matches!(self, Self::Work(_))
    }

    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()> {
        match self {
            Self::Broadcast(p) => p.subscribe(subscriber),
            Self::Work(p) => p.subscribe(subscriber),
        }
    }

    fn publish(&self, value: T) -> Result<()> {
        match self {
            Self::Broadcast(p) => p.publish(value),
            Self::Work(p) => p.publish(value),
        }
    }

    fn try_publish(&self, value: T) -> Result<()> {
        match self {
            Self::Broadcast(p) => p.try_publish(value),
            Self::Work(p) => p.try_publish(value),
        }
    }

    fn complete(&self) {
        match self {
            Self::Broadcast(p) => p.complete(),
            Self::Work(p) => p.complete(),
        }
    }

    fn error(&self, err: RiffleError) {
        match self {
            Self::Broadcast(p) => p.error(err),
            Self::Work(p) => p.error(err),
        }
    }

    fn set_uncaught_handler(&self, handler: UncaughtHandler) {
        match self {
            Self::Broadcast(p) => p.set_uncaught_handler(handler),
            Self::Work(p) => p.set_uncaught_handler(handler),
        }
    }

    fn await_termination(&self) {
        match self {
            Self::Broadcast(p) => p.await_termination(),
            Self::Work(p) => p.await_termination(),
        }
    }
}

struct ServiceCore<T: Event> {
    backing: ServiceBacking<T>,
    concurrency: usize,
    shutdown_handler: Mutex<Option<ShutdownHandler>>,
    auto_shutdown: bool,
    active: AtomicUsize,
    shut_down: AtomicBool,
}

impl<T: Event> ServiceCore<T> {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("processor service shutting down");
        self.backing.complete();
        self.backing.await_termination();
        if let Some(handler) = self.shutdown_handler.lock().take() {
            handler();
        }
    }

    fn on_unregister(&self, was_subscribed: bool) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        if was_subscribed && remaining == 0 && self.auto_shutdown {
            debug!("last logical subscriber left, auto-shutdown");
            self.shutdown();
        }
    }
}

/// Multiplexes logical subscribers over one backing processor with a fixed
/// worker budget. Cloning shares the service.
pub struct ProcessorService<T: Event> {
    core: Arc<ServiceCore<T>>,
}

impl<T: Event> Clone for ProcessorService<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Event> ProcessorService<T> {
    /// Create a service over `backing`.
    ///
    /// `concurrency` bounds concurrent work-mode subscriptions and defaults
    /// to `min(available cores, 2)`. The uncaught handler is installed on
    /// the backing processor's workers; the shutdown handler runs exactly
    /// once when the service shuts down.
    pub fn create(
        backing: ServiceBacking<T>,
        concurrency: Option<usize>,
        uncaught_handler: Option<UncaughtHandler>,
        shutdown_handler: Option<ShutdownHandler>,
        auto_shutdown: bool
    ) -> Result<Self> {
        let concurrency = concurrency.unwrap_or_else(default_concurrency);
        if concurrency == 0 {
            return Err(RiffleError::argument("concurrency must be positive"));
        }

        let uncaught = uncaught_handler.unwrap_or_else(default_uncaught_handler);
        backing.set_uncaught_handler(uncaught);

        Ok(Self {
            core: Arc::new(ServiceCore {
                backing,
                concurrency,
                shutdown_handler: Mutex::new(shutdown_handler),
                auto_shutdown,
                active: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Register a logical subscriber. Fails with `InvalidState` after
    /// shutdown, or when a work-mode pool has no worker budget left.
    pub fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        let core = &self.core;
        if core.shut_down.load(Ordering::Acquire) {
            return Err(RiffleError::state("service has shut down"));
        }
        if core.backing.is_work() && core.active.load(Ordering::Acquire) >= core.concurrency {
            return Err(
                RiffleError::state(format!("worker pool exhausted ({} workers)", core.concurrency))
            );
        }

        core.active.fetch_add(1, Ordering::AcqRel);
        let wrapper = ServiceSubscriber {
            inner: subscriber,
            core: core.clone(),
            subscribed: false,
            released: false,
        };
        // On failure the wrapper is dropped inside and unregisters itself
        core.backing.subscribe(Box::new(wrapper) as Box<dyn Subscriber<T>>)
    }

    /// Publish through the backing processor
    pub fn publish(&self, value: T) -> Result<()> {
        self.core.backing.publish(value)
    }

    /// Publish through the backing processor without waiting for capacity
    pub fn try_publish(&self, value: T) -> Result<()> {
        self.core.backing.try_publish(value)
    }

    /// Signal completion through the backing processor
    pub fn complete(&self) {
        self.core.backing.complete();
    }

    /// Signal failure through the backing processor
    pub fn error(&self, err: RiffleError) {
        self.core.backing.error(err);
    }

    /// Complete the backing processor, join its workers, and run the
    /// shutdown handler. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.load(Ordering::Acquire)
    }

    /// Logical subscribers currently registered
    pub fn active_count(&self) -> usize {
        self.core.active.load(Ordering::Acquire)
    }

    pub fn concurrency(&self) -> usize {
        self.core.concurrency
    }
}

/// Wraps a logical subscriber for registration accounting. Unregistration
/// happens on drop, which covers completion, error, cancellation, and
/// forced halt alike.
struct ServiceSubscriber<T: Event, S: Subscriber<T>> {
    inner: S,
    core: Arc<ServiceCore<T>>,
    subscribed: bool,
    released: bool,
}

impl<T: Event, S: Subscriber<T>> Subscriber<T> for ServiceSubscriber<T, S> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.subscribed = true;
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        self.inner.on_next(value)
    }

    fn on_error(&mut self, error: Arc<RiffleError>) {
        self.inner.on_error(error);
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }

    fn capacity(&self) -> i64 {
        self.inner.capacity()
    }
}

impl<T: Event, S: Subscriber<T>> Drop for ServiceSubscriber<T, S> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.core.on_unregister(self.subscribed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorConfig;

    fn broadcast_backing() -> ServiceBacking<u64> {
        ServiceBacking::Broadcast(
            BroadcastProcessor::create(
                ProcessorConfig::new("svc").with_buffer_size(16).unwrap()
            ).unwrap()
        )
    }

    #[test]
    fn test_default_concurrency_is_bounded() {
        let concurrency = default_concurrency();
        assert!(concurrency >= 1);
        assert!(concurrency <= DEFAULT_CONCURRENCY_CAP);
    }

    #[test]
    fn test_create_validates_concurrency() {
        let service = ProcessorService::create(broadcast_backing(), Some(0), None, None, true);
        assert!(matches!(service, Err(RiffleError::InvalidArgument { .. })));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook = fired.clone();
        let service = ProcessorService::create(
            broadcast_backing(),
            Some(2),
            None,
            Some(
                Box::new(move || {
                    hook.fetch_add(1, Ordering::AcqRel);
                })
            ),
            false
        ).unwrap();

        service.shutdown();
        service.shutdown();
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(service.is_shut_down());
    }

    #[test]
    fn test_subscribe_after_shutdown_rejected() {
        let service = ProcessorService::create(broadcast_backing(), Some(2), None, None, false).unwrap();
        service.shutdown();

        struct Nop;
        impl Subscriber<u64> for Nop {
            fn on_subscribe(&mut self, _s: Arc<dyn Subscription>) {}
            fn on_next(&mut self, _v: u64) -> Result<()> {
                Ok(())
            }
            fn on_error(&mut self, _e: Arc<RiffleError>) {}
            fn on_complete(&mut self) {}
        }
        assert!(matches!(service.subscribe(Nop), Err(RiffleError::InvalidState { .. })));
    }
}
