//! Broadcast (fan-out) processor
//!
//! Every subscriber sees every event. Each subscriber owns a dedicated
//! worker thread with its own tracked sequence and barrier; the slowest
//! subscriber gates the producer's wrap. Terminal signals travel through
//! the ring in-band, so every subscriber observes them ordered after all
//! preceding data.

use std::sync::atomic::{ AtomicBool, AtomicI64, AtomicUsize, Ordering };
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{ debug, error, trace };

use crate::constants::UNBOUNDED_DEMAND;
use crate::error::{ Result, RiffleError };
use crate::processor::{
    demand_gate,
    GateOutcome,
    ProcessorConfig,
    ProcessorState,
    ProcessorSubscription,
    StateCell,
    UncaughtHandler,
    WorkerRegistry,
    default_uncaught_handler,
};
use crate::ring::{
    AlertSignal,
    MultiProducerSequencer,
    RingBuffer,
    SequenceBarrier,
    SequenceCell,
    Sequencer,
    SingleProducerSequencer,
    WaitStrategy,
};
use crate::streams::{ Event, Publisher, Signal, SignalKind, Subscriber, Subscription, SubscriptionState };

/// Render a panic payload for the uncaught handler
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) struct ProcessorCore<T: Event> {
    pub(crate) config: ProcessorConfig,
    pub(crate) ring: RingBuffer<Signal<T>>,
    pub(crate) strategy: Arc<dyn WaitStrategy>,
    /// Raised by `halt`; shared with the sequencer so blocked producers
    /// unwind too
    pub(crate) shutdown: AlertSignal,
    /// Set once a terminal signal has been accepted for publication
    pub(crate) terminated: AtomicBool,
    /// Ring sequence the terminal landed on; `TERMINAL_SEQUENCE_PENDING`
    /// until its publication finishes. Lets a worker positioned past the
    /// terminal detect that the ring will never hand it over.
    pub(crate) terminal_sequence: AtomicI64,
    pub(crate) terminal_error: OnceCell<Arc<RiffleError>>,
    pub(crate) subscriber_count: AtomicUsize,
    pub(crate) next_ordinal: AtomicUsize,
    pub(crate) upstream: Mutex<Option<Arc<dyn Subscription>>>,
    pub(crate) workers: WorkerRegistry,
    pub(crate) uncaught: Mutex<UncaughtHandler>,
}

impl<T: Event> ProcessorCore<T> {
    pub(crate) fn build(config: ProcessorConfig, multi_producer: bool) -> Result<Arc<Self>> {
        let strategy = config.wait_strategy.build();
        let shutdown = AlertSignal::new();
        let sequencer: Arc<dyn Sequencer> = if multi_producer {
            Arc::new(
                MultiProducerSequencer::new(config.buffer_size, strategy.clone(), shutdown.clone())
            )
        } else {
            Arc::new(
                SingleProducerSequencer::new(config.buffer_size, strategy.clone(), shutdown.clone())
            )
        };
        let ring = RingBuffer::new(config.buffer_size, sequencer, config.slot_mode)?;

        Ok(
            Arc::new(Self {
                config,
                ring,
                strategy,
                shutdown,
                terminated: AtomicBool::new(false),
                terminal_sequence: AtomicI64::new(crate::processor::TERMINAL_SEQUENCE_PENDING),
                terminal_error: OnceCell::new(),
                subscriber_count: AtomicUsize::new(0),
                next_ordinal: AtomicUsize::new(0),
                upstream: Mutex::new(None),
                workers: WorkerRegistry::new(),
                uncaught: Mutex::new(default_uncaught_handler()),
            })
        )
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_set() {
            return Err(RiffleError::state("processor is halted"));
        }
        if self.terminated.load(Ordering::Acquire) {
            return Err(RiffleError::state("processor already received a terminal signal"));
        }
        Ok(())
    }

    pub(crate) fn report_uncaught(&self, error: &RiffleError) {
        let handler = self.uncaught.lock().clone();
        handler(error);
    }

    pub(crate) fn publish_value(&self, value: T) -> Result<()> {
        self.ensure_accepting()?;
        match self.ring.publish_one(Signal::next(value)) {
            Ok(_) => Ok(()),
            Err(RiffleError::Alert) => Err(RiffleError::state("processor is halted")),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn try_publish_value(&self, value: T) -> Result<()> {
        self.ensure_accepting()?;
        match self.ring.try_publish_one(Signal::next(value)) {
            Ok(_) => Ok(()),
            Err(RiffleError::Alert) => Err(RiffleError::state("processor is halted")),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn publish_complete(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            trace!("dropping duplicate completion signal");
            return;
        }
        match self.ring.publish_one(Signal::complete()) {
            Ok(sequence) => self.terminal_sequence.store(sequence, Ordering::Release),
            Err(_) => debug!("completion raced a halt; workers unwind via alert"),
        }
    }

    pub(crate) fn publish_error(&self, err: Arc<RiffleError>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            trace!(error = %err, "dropping error signal after terminal");
            return;
        }
        let _ = self.terminal_error.set(err.clone());
        match self.ring.publish_one(Signal::error(err)) {
            Ok(sequence) => self.terminal_sequence.store(sequence, Ordering::Release),
            Err(_) => debug!("error terminal raced a halt; workers unwind via alert"),
        }
    }

    /// Forced shutdown: refuse further claims and unwind every worker
    pub(crate) fn halt_workers(&self) {
        self.shutdown.set();
        self.strategy.signal_all_when_blocking();
        self.workers.alert_all();
    }

    /// Named worker spawn. A panic in the worker body (a subscriber
    /// callback, typically) terminates only that worker; the payload is
    /// forwarded to the uncaught handler before the thread exits.
    pub(crate) fn spawn_worker<F>(
        self: &Arc<Self>,
        barrier: Arc<SequenceBarrier>,
        body: F
    ) -> Result<()>
        where F: FnOnce() + Send + 'static
    {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::AcqRel);
        let core = self.clone();
        let handle = std::thread::Builder
            ::new()
            .name(format!("{}-{}", self.config.name, ordinal))
            .spawn(move || {
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
                    core.report_uncaught(
                        &RiffleError::subscriber(
                            format!("worker panicked: {}", panic_message(&payload))
                        )
                    );
                }
            })
            .map_err(|e| RiffleError::state(format!("failed to spawn worker thread: {e}")))?;
        self.workers.register(barrier, handle);
        Ok(())
    }

    pub(crate) fn on_subscriber_exit(&self) {
        let remaining = self.subscriber_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.config.auto_cancel && !self.terminated.load(Ordering::Acquire) {
            debug!(processor = %self.config.name, "last subscriber left, cancelling upstream");
            if let Some(upstream) = self.upstream.lock().take() {
                upstream.cancel();
            }
        }
    }
}

/// High-throughput fan-out processor on a bounded ring buffer.
///
/// Cloning is cheap and shares the processor; the clone can be moved to
/// producer threads or subscribed to another publisher.
pub struct BroadcastProcessor<T: Event> {
    core: Arc<ProcessorCore<T>>,
}

impl<T: Event> Clone for BroadcastProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Event> BroadcastProcessor<T> {
    /// Create a broadcast processor fed by a single publishing thread
    pub fn create(config: ProcessorConfig) -> Result<Self> {
        Ok(Self {
            core: ProcessorCore::build(config, false)?,
        })
    }

    /// Create a broadcast processor fed by any number of publishing threads
    pub fn share(config: ProcessorConfig) -> Result<Self> {
        Ok(Self {
            core: ProcessorCore::build(config, true)?,
        })
    }

    /// Publish one event, spinning while the ring is full.
    /// Fails with `InvalidState` after a terminal signal or halt.
    pub fn publish(&self, value: T) -> Result<()> {
        self.core.publish_value(value)
    }

    /// Publish one event without waiting for capacity.
    /// Fails with `BufferFull` when the slowest subscriber is a full ring
    /// behind.
    pub fn try_publish(&self, value: T) -> Result<()> {
        self.core.try_publish_value(value)
    }

    /// Publish the completion terminal. Idempotent; every subscriber
    /// drains preceding data, then observes `on_complete`.
    pub fn complete(&self) {
        self.core.publish_complete();
    }

    /// Publish the failure terminal. Idempotent; every subscriber drains
    /// preceding data, then observes `on_error`.
    pub fn error(&self, err: RiffleError) {
        self.core.publish_error(Arc::new(err));
    }

    /// Forced shutdown: unwind all workers without terminal callbacks and
    /// refuse further claims. For graceful completion use `complete`.
    pub fn halt(&self) {
        self.core.halt_workers();
    }

    /// Block until every worker thread has exited
    pub fn await_termination(&self) {
        self.core.workers.join_all();
    }

    /// Install the handler for errors that escape normal routing
    pub fn set_uncaught_handler(&self, handler: UncaughtHandler) {
        *self.core.uncaught.lock() = handler;
    }

    pub fn buffer_size(&self) -> usize {
        self.core.ring.buffer_size()
    }

    /// Slots still claimable before the producer would overtake the
    /// slowest subscriber
    pub fn remaining_capacity(&self) -> i64 {
        self.core.ring.remaining_capacity()
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscriber_count.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.core.terminated.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.core.shutdown.is_set()
    }

    /// Attach a subscriber on its own worker thread. The subscriber sees
    /// every event published after it registers, then the terminal.
    pub fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        if self.core.shutdown.is_set() {
            return Err(RiffleError::state("cannot subscribe to a halted processor"));
        }

        let core = self.core.clone();
        if core.terminated.load(Ordering::Acquire) {
            return self.subscribe_after_terminal(subscriber);
        }

        let sequencer = core.ring.sequencer().clone();
        let tracked = Arc::new(SequenceCell::initial());
        sequencer.add_gating(tracked.clone());
        let barrier = Arc::new(
            SequenceBarrier::new(sequencer, core.strategy.clone(), Vec::new())
        );
        let state = Arc::new(SubscriptionState::new());
        core.subscriber_count.fetch_add(1, Ordering::AcqRel);

        let loop_core = core.clone();
        let loop_barrier = barrier.clone();
        core.spawn_worker(barrier, move || {
            EventLoop {
                core: loop_core,
                subscriber,
                tracked,
                barrier: loop_barrier,
                state,
                worker_state: StateCell::idle(),
            }.run();
        })
    }

    /// A subscriber arriving after the terminal observes `on_subscribe`
    /// followed immediately by the terminal signal
    fn subscribe_after_terminal<S: Subscriber<T>>(&self, mut subscriber: S) -> Result<()> {
        let core = self.core.clone();
        let barrier = Arc::new(
            SequenceBarrier::new(core.ring.sequencer().clone(), core.strategy.clone(), Vec::new())
        );
        let sub_barrier = barrier.clone();
        self.core.spawn_worker(barrier, move || {
            let state = Arc::new(SubscriptionState::new());
            subscriber.on_subscribe(
                Arc::new(ProcessorSubscription {
                    state,
                    barrier: sub_barrier,
                })
            );
            match core.terminal_error.get() {
                Some(err) => subscriber.on_error(err.clone()),
                None => subscriber.on_complete(),
            }
        })
    }
}

impl<T: Event> Publisher<T> for BroadcastProcessor<T> {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()> {
        BroadcastProcessor::subscribe(self, subscriber)
    }
}

/// A processor is itself a subscriber, so it can sit downstream of another
/// publisher. It requests unbounded demand; its own ring is the
/// backpressure boundary.
impl<T: Event> Subscriber<T> for BroadcastProcessor<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        *self.core.upstream.lock() = Some(subscription.clone());
        subscription.request(UNBOUNDED_DEMAND);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        match self.publish(value) {
            Ok(()) => Ok(()),
            // A dead processor unwinds its upstream as a control signal
            Err(RiffleError::InvalidState { .. }) | Err(RiffleError::Alert) =>
                Err(RiffleError::Cancelled),
            Err(e) => Err(e),
        }
    }

    fn on_error(&mut self, error: Arc<RiffleError>) {
        self.core.publish_error(error);
    }

    fn on_complete(&mut self) {
        self.complete();
    }

    fn capacity(&self) -> i64 {
        self.buffer_size() as i64
    }
}

/// Releases a worker's gating entry and registration when its loop exits,
/// including by panic: a dead subscriber must never stall the producer
pub(crate) struct WorkerCleanup<T: Event> {
    pub(crate) core: Arc<ProcessorCore<T>>,
    pub(crate) tracked: Arc<SequenceCell>,
}

impl<T: Event> Drop for WorkerCleanup<T> {
    fn drop(&mut self) {
        self.core.ring.sequencer().remove_gating(&self.tracked);
        self.core.on_subscriber_exit();
    }
}

/// One subscriber's delivery loop: wait on the barrier, drain the granted
/// batch under demand gating, advance the tracked sequence
struct EventLoop<T: Event, S: Subscriber<T>> {
    core: Arc<ProcessorCore<T>>,
    subscriber: S,
    tracked: Arc<SequenceCell>,
    barrier: Arc<SequenceBarrier>,
    state: Arc<SubscriptionState>,
    worker_state: StateCell,
}

impl<T: Event, S: Subscriber<T>> EventLoop<T, S> {
    fn run(mut self) {
        debug!(processor = %self.core.config.name, "broadcast worker starting");
        self.worker_state.set(ProcessorState::Running);
        let _cleanup = WorkerCleanup {
            core: self.core.clone(),
            tracked: self.tracked.clone(),
        };

        self.subscriber.on_subscribe(
            Arc::new(ProcessorSubscription {
                state: self.state.clone(),
                barrier: self.barrier.clone(),
            })
        );

        self.deliver();

        self.worker_state.set(ProcessorState::Halted);
        debug!(
            processor = %self.core.config.name,
            state = ?self.worker_state.get(),
            "broadcast worker exited"
        );
    }

    fn deliver(&mut self) {
        let mut next = self.tracked.get() + 1;

        loop {
            // A worker registered while the terminal was being published
            // may have been positioned past it; the ring will never hand
            // it over, so detect and emit it directly.
            if self.core.terminated.load(Ordering::Acquire) {
                let terminal = self.core.terminal_sequence.load(Ordering::Acquire);
                if terminal != crate::processor::TERMINAL_SEQUENCE_PENDING {
                    if next > terminal {
                        self.emit_terminal();
                        return;
                    }
                    // Terminal is ahead of us: drain to it through the ring
                } else if next > self.barrier.cursor_value() {
                    // Terminal publication still in flight and nothing else
                    // to deliver; poll rather than park, since no further
                    // publish will wake the barrier after the terminal
                    if self.core.shutdown.is_set() {
                        return;
                    }
                    std::thread::yield_now();
                    continue;
                }
            }

            match self.barrier.wait_for(next) {
                Err(RiffleError::Alert) => {
                    // Invalid demand recorded while we were waiting
                    if let Some(fault) = self.state.take_fault() {
                        self.state.cancel();
                        self.subscriber.on_error(Arc::new(fault));
                        return;
                    }
                    // Cancel or forced halt: unwind without callbacks
                    return;
                }
                Err(e) => {
                    error!(error = %e, "broadcast worker wait failed");
                    self.core.report_uncaught(&e);
                    return;
                }
                Ok(available) if available < next => {
                    // Claimed but unpublished slots ahead of us
                    std::hint::spin_loop();
                }
                Ok(available) => {
                    while next <= available {
                        if !self.deliver_one(next) {
                            return;
                        }
                        self.tracked.set(next);
                        next += 1;
                    }
                }
            }
        }
    }

    /// Forward the processor terminal to this worker's subscriber
    fn emit_terminal(&mut self) {
        match self.core.terminal_error.get() {
            Some(err) => self.subscriber.on_error(err.clone()),
            None => self.subscriber.on_complete(),
        }
    }

    /// Deliver the signal at `sequence`; false means the loop must unwind
    fn deliver_one(&mut self, sequence: i64) -> bool {
        let signal = self.core.ring.read(sequence);
        match signal.kind() {
            SignalKind::Next => {
                match demand_gate(&self.state, &self.core.shutdown) {
                    GateOutcome::Granted => {}
                    GateOutcome::Cancelled | GateOutcome::Halted => {
                        return false;
                    }
                    GateOutcome::Fault(fault) => {
                        self.state.cancel();
                        self.subscriber.on_error(Arc::new(fault));
                        return false;
                    }
                }
                let Some(value) = signal.into_value() else {
                    debug_assert!(false, "data signal without value");
                    return true;
                };
                let retained = value.clone();
                match self.subscriber.on_next(value) {
                    Ok(()) => true,
                    Err(RiffleError::Cancelled) => {
                        self.state.cancel();
                        false
                    }
                    Err(e) => {
                        self.state.cancel();
                        self.subscriber.on_error(
                            Arc::new(
                                RiffleError::subscriber(
                                    format!("{e} while handling value {retained:?}")
                                )
                            )
                        );
                        false
                    }
                }
            }
            SignalKind::Complete => {
                self.subscriber.on_complete();
                false
            }
            SignalKind::Error => {
                let err = signal
                    .into_error()
                    .unwrap_or_else(|| Arc::new(RiffleError::state("terminal without error")));
                self.subscriber.on_error(err);
                false
            }
            SignalKind::Empty => {
                debug_assert!(false, "read an unwritten slot");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_probes() {
        let processor: BroadcastProcessor<u64> = BroadcastProcessor::create(
            ProcessorConfig::new("probe").with_buffer_size(8).unwrap()
        ).unwrap();
        assert_eq!(processor.buffer_size(), 8);
        assert_eq!(processor.subscriber_count(), 0);
        assert!(!processor.is_terminated());
        assert!(!processor.is_halted());
    }

    #[test]
    fn test_publish_after_complete_is_rejected() {
        let processor: BroadcastProcessor<u64> = BroadcastProcessor::create(
            ProcessorConfig::new("terminal").with_buffer_size(8).unwrap()
        ).unwrap();
        processor.publish(1).unwrap();
        processor.complete();
        assert!(matches!(processor.publish(2), Err(RiffleError::InvalidState { .. })));
        assert!(processor.is_terminated());
    }

    #[test]
    fn test_halt_rejects_publish_and_subscribe() {
        let processor: BroadcastProcessor<u64> = BroadcastProcessor::create(
            ProcessorConfig::new("halted").with_buffer_size(8).unwrap()
        ).unwrap();
        processor.halt();
        assert!(matches!(processor.publish(1), Err(RiffleError::InvalidState { .. })));

        struct Nop;
        impl Subscriber<u64> for Nop {
            fn on_subscribe(&mut self, _s: Arc<dyn Subscription>) {}
            fn on_next(&mut self, _v: u64) -> Result<()> {
                Ok(())
            }
            fn on_error(&mut self, _e: Arc<RiffleError>) {}
            fn on_complete(&mut self) {}
        }
        assert!(processor.subscribe(Nop).is_err());
    }

    #[test]
    fn test_ungated_producer_never_blocks() {
        // No subscribers registered: the ring gates on itself and wraps
        let processor: BroadcastProcessor<u64> = BroadcastProcessor::create(
            ProcessorConfig::new("full").with_buffer_size(2).unwrap()
        ).unwrap();
        processor.try_publish(1).unwrap();
        processor.try_publish(2).unwrap();
        processor.try_publish(3).unwrap();
    }
}
