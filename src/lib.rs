//! Riffle - reactive-streams processors on a lock-free ring buffer
//!
//! Riffle mediates between publishers and subscribers under the
//! demand-driven, backpressure-respecting reactive-streams protocol, on a
//! bounded power-of-two ring buffer implementing LMAX Disruptor patterns.
//!
//! ## Key Features
//!
//! - **Lock-Free Conveyor**: sequenced claim/publish on a pre-allocated
//!   slot array, single- and multi-producer variants
//! - **Wait Strategies**: blocking, busy-spin, yielding, sleeping, and
//!   phased backoff trade CPU for latency
//! - **Two Delivery Disciplines**: broadcast fan-out (every subscriber sees
//!   every event) and work partition (each event seen by exactly one)
//! - **Demand Accounting**: per-subscriber backpressure with overflow-safe
//!   sticky-unbounded requests
//! - **Cooperative Cancellation**: an alert signal woven through every wait
//!   loop unwinds workers promptly
//!
//! ## Example Usage
//!
//! ```rust
//! use riffle::{BroadcastProcessor, ProcessorConfig, Subscriber, Subscription};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl Subscriber<u64> for Printer {
//!     fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
//!         subscription.request(i64::MAX);
//!     }
//!     fn on_next(&mut self, value: u64) -> riffle::Result<()> {
//!         println!("got {value}");
//!         Ok(())
//!     }
//!     fn on_error(&mut self, error: Arc<riffle::RiffleError>) {
//!         eprintln!("failed: {error}");
//!     }
//!     fn on_complete(&mut self) {
//!         println!("done");
//!     }
//! }
//!
//! let processor = BroadcastProcessor::create(
//!     ProcessorConfig::new("events").with_buffer_size(64).unwrap(),
//! ).unwrap();
//! processor.subscribe(Printer).unwrap();
//!
//! for value in 0..10u64 {
//!     processor.publish(value).unwrap();
//! }
//! processor.complete();
//! processor.await_termination();
//! ```

pub mod constants;
pub mod error;
pub mod processor;
pub mod ring;
pub mod streams;

// Re-export main components
pub use error::{ Result, RiffleError };
pub use processor::{
    BroadcastProcessor,
    ProcessorConfig,
    ProcessorService,
    ProcessorState,
    ServiceBacking,
    ShutdownHandler,
    UncaughtHandler,
    WorkProcessor,
};
pub use ring::{ RingBuffer, Sequence, SequenceBarrier, SlotMode, WaitStrategy, WaitStrategyKind };
pub use streams::{
    Event,
    Publisher,
    Signal,
    SignalKind,
    Subscriber,
    SubscriberBarrier,
    Subscription,
    SubscriptionState,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
