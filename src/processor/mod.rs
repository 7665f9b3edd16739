//! Ring-buffer processors: broadcast fan-out, work partition, and the
//! shared processor service
//!
//! A processor mediates between producers and subscribers on a bounded
//! ring buffer under the demand protocol. Two delivery disciplines share
//! the substrate:
//!
//! - [`BroadcastProcessor`]: every subscriber sees every event; the slowest
//!   subscriber gates the producer's wrap
//! - [`WorkProcessor`]: subscribers share one work sequence; each event is
//!   delivered to exactly one of them
//!
//! Each subscriber gets a dedicated named worker thread; producers may be
//! any number of caller threads, subject to the processor's sequencer
//! variant.

pub mod broadcast;
pub mod service;
pub mod work;

pub use broadcast::BroadcastProcessor;
pub use service::{ ProcessorService, ServiceBacking };
pub use work::WorkProcessor;

use std::sync::atomic::{ AtomicU8, Ordering };
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::{ Deserialize, Serialize };
use tracing::error;

use crate::constants::{ DEFAULT_MEDIUM_BUFFER_SIZE, DEFAULT_SMALL_BUFFER_SIZE, MAX_BUFFER_SIZE };
use crate::error::{ Result, RiffleError };
use crate::ring::{ AlertSignal, SequenceBarrier, SlotMode, WaitStrategyKind };
use crate::streams::{ SubscriptionState, Subscription };

/// Terminal sequence placeholder while the terminal signal's publication
/// is still in flight
pub(crate) const TERMINAL_SEQUENCE_PENDING: i64 = i64::MIN;

/// Handler invoked with errors that escaped normal routing: dead-lettered
/// work deliveries and internal worker failures
pub type UncaughtHandler = Arc<dyn Fn(&RiffleError) + Send + Sync>;

/// Hook run exactly once when a processor service shuts down
pub type ShutdownHandler = Box<dyn FnOnce() + Send>;

pub(crate) fn default_uncaught_handler() -> UncaughtHandler {
    Arc::new(|err: &RiffleError| {
        error!(error = %err, "uncaught processor error");
    })
}

/// Configuration for a ring-buffer processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Label used to name worker threads (`{name}-{ordinal}`)
    pub name: String,
    /// Ring size; power of two in `[1, 2^30]`
    pub buffer_size: usize,
    /// How consumers idle until their target sequence is published
    pub wait_strategy: WaitStrategyKind,
    /// Cancel the processor's upstream subscription when the last
    /// subscriber leaves
    pub auto_cancel: bool,
    /// Slot storage discipline
    pub slot_mode: SlotMode,
}

impl ProcessorConfig {
    /// Defaults for a broadcast processor: small ring, blocking waits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer_size: DEFAULT_SMALL_BUFFER_SIZE,
            wait_strategy: WaitStrategyKind::Blocking,
            auto_cancel: true,
            slot_mode: SlotMode::Atomic,
        }
    }

    /// Defaults for a work processor: workers contend on the shared claim
    /// counter, so they poll with yields instead of parking
    pub fn work(name: impl Into<String>) -> Self {
        Self {
            wait_strategy: WaitStrategyKind::Yielding,
            ..Self::new(name)
        }
    }

    /// Medium-throughput preset
    pub fn medium(name: impl Into<String>) -> Self {
        Self {
            buffer_size: DEFAULT_MEDIUM_BUFFER_SIZE,
            ..Self::new(name)
        }
    }

    /// Set the ring size; must be a power of two in `[1, 2^30]`
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 || !buffer_size.is_power_of_two() {
            return Err(RiffleError::config("buffer size must be a power of 2"));
        }
        if buffer_size > MAX_BUFFER_SIZE {
            return Err(
                RiffleError::config(
                    format!("buffer size {buffer_size} exceeds maximum {MAX_BUFFER_SIZE}")
                )
            );
        }
        self.buffer_size = buffer_size;
        Ok(self)
    }

    /// Set the wait strategy
    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /// Enable or disable auto-cancel
    pub fn with_auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.auto_cancel = auto_cancel;
        self
    }

    /// Set the slot storage discipline
    pub fn with_slot_mode(mut self, slot_mode: SlotMode) -> Self {
        self.slot_mode = slot_mode;
        self
    }
}

/// Lifecycle of one event processor worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Halted = 2,
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn idle() -> Self {
        Self(AtomicU8::new(ProcessorState::Idle as u8))
    }

    pub(crate) fn set(&self, state: ProcessorState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> ProcessorState {
        match self.0.load(Ordering::Acquire) {
            0 => ProcessorState::Idle,
            1 => ProcessorState::Running,
            _ => ProcessorState::Halted,
        }
    }
}

/// Subscription handle handed to a processor's subscriber: demand lands in
/// the shared accounting state, cancel alerts the worker's barrier
pub(crate) struct ProcessorSubscription {
    pub(crate) state: Arc<SubscriptionState>,
    pub(crate) barrier: Arc<SequenceBarrier>,
}

impl Subscription for ProcessorSubscription {
    fn request(&self, n: i64) {
        if self.state.is_cancelled() {
            return;
        }
        if n <= 0 {
            // Raised on the delivery thread, which owns the subscriber;
            // the alert unwinds it even while parked in a wait
            self.state.set_fault(
                RiffleError::argument(format!("requested demand must be positive, got {n}"))
            );
            self.barrier.alert();
            return;
        }
        self.state.add_demand(n);
        self.barrier.signal();
    }

    fn cancel(&self) {
        self.state.cancel();
        self.barrier.alert();
    }
}

/// Why a demand pause ended
pub(crate) enum GateOutcome {
    /// One delivery was granted
    Granted,
    /// The subscription was cancelled while paused
    Cancelled,
    /// An invalid request was recorded while paused
    Fault(RiffleError),
    /// The processor was halted while paused
    Halted,
}

/// Pause until one delivery is covered by outstanding demand, or until the
/// subscription dies
pub(crate) fn demand_gate(state: &SubscriptionState, shutdown: &AlertSignal) -> GateOutcome {
    let backoff = Backoff::new();
    loop {
        if let Some(fault) = state.take_fault() {
            return GateOutcome::Fault(fault);
        }
        if state.is_cancelled() {
            return GateOutcome::Cancelled;
        }
        if shutdown.is_set() {
            return GateOutcome::Halted;
        }
        if state.try_claim(1) == 1 {
            return GateOutcome::Granted;
        }
        backoff.snooze();
    }
}

/// Worker threads and their barriers, for halt and join
pub(crate) struct WorkerRegistry {
    barriers: Mutex<Vec<Arc<SequenceBarrier>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            barriers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, barrier: Arc<SequenceBarrier>, handle: JoinHandle<()>) {
        self.barriers.lock().push(barrier);
        self.handles.lock().push(handle);
    }

    /// Alert every worker barrier
    pub(crate) fn alert_all(&self) {
        for barrier in self.barriers.lock().iter() {
            barrier.alert();
        }
    }

    /// Join every worker thread except the calling one (a worker may
    /// trigger shutdown from its own exit path)
    pub(crate) fn join_all(&self) {
        let current = std::thread::current().id();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("processor worker panicked");
            }
        }
    }
}
