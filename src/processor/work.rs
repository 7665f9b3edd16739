//! Work (partition) processor
//!
//! Subscribers share a single monotonically advancing work sequence; each
//! event is delivered to exactly one of them. A failed delivery is
//! re-published as a retry envelope so a peer can pick it up; after the
//! attempt budget is spent the event is dead-lettered to the uncaught
//! handler. Workers are re-publishers, so the ring always runs the
//! multi-producer claim protocol.

use std::sync::Arc;

use crossbeam::utils::Backoff;
use tracing::{ debug, error, warn };

use crate::constants::{ MAX_DELIVERY_ATTEMPTS, UNBOUNDED_DEMAND };
use crate::error::{ Result, RiffleError };
use crate::processor::broadcast::{ ProcessorCore, WorkerCleanup };
use crate::processor::{
    demand_gate,
    GateOutcome,
    ProcessorConfig,
    ProcessorState,
    ProcessorSubscription,
    StateCell,
    UncaughtHandler,
};
use crate::ring::{ Sequence, SequenceBarrier, SequenceCell };
use crate::streams::{ Event, Publisher, Signal, SignalKind, Subscriber, Subscription, SubscriptionState };

struct WorkShared {
    /// Next-to-claim counter shared by all workers
    work_sequence: Arc<SequenceCell>,
}

/// Event conveyor that partitions events across its subscribers: each
/// published event is handed to exactly one worker.
///
/// Cloning is cheap and shares the processor.
pub struct WorkProcessor<T: Event> {
    core: Arc<ProcessorCore<T>>,
    shared: Arc<WorkShared>,
}

impl<T: Event> Clone for WorkProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Event> WorkProcessor<T> {
    /// Create a work processor fed by a single external publishing thread.
    /// Retry envelopes make workers internal publishers, so the ring still
    /// runs the multi-producer protocol.
    pub fn create(config: ProcessorConfig) -> Result<Self> {
        Self::build(config)
    }

    /// Create a work processor fed by any number of publishing threads
    pub fn share(config: ProcessorConfig) -> Result<Self> {
        Self::build(config)
    }

    fn build(config: ProcessorConfig) -> Result<Self> {
        let core = ProcessorCore::build(config, true)?;
        Ok(Self {
            core,
            shared: Arc::new(WorkShared {
                work_sequence: Arc::new(SequenceCell::initial()),
            }),
        })
    }

    /// Publish one event, spinning while the ring is full
    pub fn publish(&self, value: T) -> Result<()> {
        self.core.publish_value(value)
    }

    /// Publish one event without waiting for capacity
    pub fn try_publish(&self, value: T) -> Result<()> {
        self.core.try_publish_value(value)
    }

    /// Publish the completion terminal; every worker finishes its owed
    /// deliveries, then observes `on_complete`
    pub fn complete(&self) {
        self.core.publish_complete();
    }

    /// Publish the failure terminal; every worker finishes its owed
    /// deliveries, then observes `on_error`
    pub fn error(&self, err: RiffleError) {
        self.core.publish_error(Arc::new(err));
    }

    /// Forced shutdown without terminal callbacks
    pub fn halt(&self) {
        self.core.halt_workers();
    }

    /// Block until every worker thread has exited
    pub fn await_termination(&self) {
        self.core.workers.join_all();
    }

    /// Install the handler for dead-lettered deliveries and other errors
    /// that escape normal routing
    pub fn set_uncaught_handler(&self, handler: UncaughtHandler) {
        *self.core.uncaught.lock() = handler;
    }

    pub fn buffer_size(&self) -> usize {
        self.core.ring.buffer_size()
    }

    pub fn remaining_capacity(&self) -> i64 {
        self.core.ring.remaining_capacity()
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscriber_count.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.core.terminated.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.core.shutdown.is_set()
    }

    /// Attach a worker subscriber. Events are partitioned across all
    /// attached workers in claim order.
    pub fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        if self.core.shutdown.is_set() {
            return Err(RiffleError::state("cannot subscribe to a halted processor"));
        }

        let core = self.core.clone();
        if core.terminated.load(std::sync::atomic::Ordering::Acquire) {
            return self.subscribe_after_terminal(subscriber);
        }

        let sequencer = core.ring.sequencer().clone();
        let tracked = Arc::new(SequenceCell::initial());

        // Ungated publishing may have wrapped past the pool frontier;
        // resume from the oldest slot still intact. The gating position is
        // the frontier value observed in the winning iteration: re-reading
        // the shared counter afterwards could see a peer's later claims
        // and skip real, unclaimed events.
        let floor = sequencer.cursor().get() - (core.ring.buffer_size() as i64);
        let position = loop {
            let frontier = self.shared.work_sequence.get();
            if frontier >= floor {
                break frontier;
            }
            if self.shared.work_sequence.compare_and_set(frontier, floor) {
                break floor;
            }
        };

        // Gate from the work frontier, not the cursor: backlog claimed but
        // not yet delivered by the pool must stay protected from overwrite
        sequencer.add_gating_at(tracked.clone(), position);
        let barrier = Arc::new(SequenceBarrier::new(sequencer, core.strategy.clone(), Vec::new()));
        let state = Arc::new(SubscriptionState::new());
        core.subscriber_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);

        let loop_core = core.clone();
        let loop_shared = self.shared.clone();
        let loop_barrier = barrier.clone();
        core.spawn_worker(barrier, move || {
            WorkLoop {
                core: loop_core,
                shared: loop_shared,
                subscriber,
                tracked,
                barrier: loop_barrier,
                state,
                worker_state: StateCell::idle(),
            }.run();
        })
    }

    /// A worker arriving after the terminal observes `on_subscribe`
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

impl<T: Event> Publisher<T> for WorkProcessor<T> {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()> {
        WorkProcessor::subscribe(self, subscriber)
    }
}

/// A work processor downstream of another publisher requests unbounded
/// demand; its ring is the backpressure boundary
impl<T: Event> Subscriber<T> for WorkProcessor<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        *self.core.upstream.lock() = Some(subscription.clone());
        subscription.request(UNBOUNDED_DEMAND);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        match self.publish(value) {
            Ok(()) => Ok(()),
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

/// One worker's delivery loop: contend on the shared work sequence, wait
/// for the claimed event, deliver it to this worker's subscriber
struct WorkLoop<T: Event, S: Subscriber<T>> {
    core: Arc<ProcessorCore<T>>,
    shared: Arc<WorkShared>,
    subscriber: S,
    tracked: Arc<SequenceCell>,
    barrier: Arc<SequenceBarrier>,
    state: Arc<SubscriptionState>,
    worker_state: StateCell,
}

/// What to do with a claimed sequence after waiting on it
enum Claimed {
    Deliver,
    Terminal,
    Unwind,
}

impl<T: Event, S: Subscriber<T>> WorkLoop<T, S> {
    fn run(mut self) {
        debug!(processor = %self.core.config.name, "work worker starting");
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
            "work worker exited"
        );
    }

    fn deliver(&mut self) {
        loop {
            let claimed = self.shared.work_sequence.add_and_get(1);

            match self.await_claimed(claimed) {
                Claimed::Deliver => {
                    if !self.deliver_one(claimed) {
                        return;
                    }
                }
                Claimed::Terminal => {
                    self.emit_terminal();
                    return;
                }
                Claimed::Unwind => {
                    return;
                }
            }
        }
    }

    /// Wait until `claimed` is published, the processor terminates, or the
    /// subscription dies
    fn await_claimed(&mut self, claimed: Sequence) -> Claimed {
        loop {
            // Once a terminal is in flight the barrier may never wake us:
            // claims past the terminal have no publication coming
            if self.core.terminated.load(std::sync::atomic::Ordering::Acquire) {
                let terminal = self.core.terminal_sequence.load(std::sync::atomic::Ordering::Acquire);
                if terminal != crate::processor::TERMINAL_SEQUENCE_PENDING {
                    if claimed > terminal {
                        return Claimed::Terminal;
                    }
                    // An event at or before the terminal is owed to us; its
                    // producer is committed, so wait out the publication
                    let backoff = Backoff::new();
                    while !self.core.ring.sequencer().is_available(claimed) {
                        if self.core.shutdown.is_set() {
                            return Claimed::Unwind;
                        }
                        backoff.snooze();
                    }
                    return Claimed::Deliver;
                }
                // Terminal publication still in flight: keep draining data
                // so its claim is not gated on us forever
                if self.core.ring.sequencer().is_available(claimed) {
                    return Claimed::Deliver;
                }
                if self.core.shutdown.is_set() {
                    return Claimed::Unwind;
                }
                std::thread::yield_now();
                continue;
            }

            match self.barrier.wait_for(claimed) {
                Ok(available) if available >= claimed => {
                    return Claimed::Deliver;
                }
                Ok(_) => {
                    // A producer claimed ahead of us but has not published
                    std::hint::spin_loop();
                }
                Err(RiffleError::Alert) => {
                    if let Some(fault) = self.state.take_fault() {
                        self.state.cancel();
                        self.subscriber.on_error(Arc::new(fault));
                        return Claimed::Unwind;
                    }
                    if self.state.is_cancelled() || self.core.shutdown.is_set() {
                        return Claimed::Unwind;
                    }
                    if self.core.terminated.load(std::sync::atomic::Ordering::Acquire) {
                        // Terminal fan-out; resolved at the top of the loop
                        continue;
                    }
                    return Claimed::Unwind;
                }
                Err(e) => {
                    error!(error = %e, "work worker wait failed");
                    self.core.report_uncaught(&e);
                    return Claimed::Unwind;
                }
            }
        }
    }

    /// Deliver the signal at `claimed`; false means the loop must unwind
    fn deliver_one(&mut self, claimed: Sequence) -> bool {
        let signal = self.core.ring.read(claimed);
        match signal.kind() {
            SignalKind::Next => {
                let attempt = signal.attempt();
                let Some(value) = signal.into_value() else {
                    debug_assert!(false, "data signal without value");
                    self.tracked.set(claimed);
                    return true;
                };

                match demand_gate(&self.state, &self.core.shutdown) {
                    GateOutcome::Granted => {}
                    GateOutcome::Cancelled => {
                        // Hand the claimed event to a peer before leaving
                        self.repost(value, attempt, claimed);
                        return false;
                    }
                    GateOutcome::Halted => {
                        return false;
                    }
                    GateOutcome::Fault(fault) => {
                        self.repost(value, attempt, claimed);
                        self.state.cancel();
                        self.subscriber.on_error(Arc::new(fault));
                        return false;
                    }
                }

                let retained = value.clone();
                match self.subscriber.on_next(value) {
                    Ok(()) => {
                        self.tracked.set(claimed);
                        true
                    }
                    Err(RiffleError::Cancelled) => {
                        self.state.cancel();
                        self.repost(retained, attempt, claimed);
                        false
                    }
                    Err(e) => {
                        self.tracked.set(claimed);
                        let next_attempt = attempt + 1;
                        if next_attempt < MAX_DELIVERY_ATTEMPTS {
                            debug!(
                                attempt = next_attempt,
                                "delivery failed, re-publishing for a peer"
                            );
                            if
                                self.core.ring
                                    .publish_one(Signal::retry(retained, next_attempt))
                                    .is_err()
                            {
                                warn!("retry lost: processor no longer accepts claims");
                            }
                        } else {
                            let dead = RiffleError::subscriber(
                                format!(
                                    "{e} while handling value {retained:?} after {next_attempt} attempts"
                                )
                            );
                            error!(error = %dead, "dead-lettering event");
                            self.core.report_uncaught(&dead);
                        }
                        // The worker itself survives a failed delivery
                        true
                    }
                }
            }
            SignalKind::Complete => {
                self.tracked.set(claimed);
                self.core.workers.alert_all();
                self.subscriber.on_complete();
                false
            }
            SignalKind::Error => {
                let err = signal
                    .into_error()
                    .unwrap_or_else(|| Arc::new(RiffleError::state("terminal without error")));
                self.tracked.set(claimed);
                self.core.workers.alert_all();
                self.subscriber.on_error(err);
                false
            }
            SignalKind::Empty => {
                debug_assert!(false, "read an unwritten slot");
                self.tracked.set(claimed);
                true
            }
        }
    }

    /// Re-publish a claimed but undelivered event so a peer picks it up
    fn repost(&self, value: T, attempt: u32, claimed: Sequence) {
        self.tracked.set(claimed);
        if self.core.ring.publish_one(Signal::retry(value, attempt)).is_err() {
            warn!("undelivered event lost: processor no longer accepts claims");
        }
    }

    /// Forward the processor terminal to this worker's subscriber
    fn emit_terminal(&mut self) {
        match self.core.terminal_error.get() {
            Some(err) => self.subscriber.on_error(err.clone()),
            None => self.subscriber.on_complete(),
        }
    }
}
