//! Time sources and cancellable deferred tasks.
//!
//! All waiting in the crate (reconnect delays, fade completions, the report
//! tick, the frame tick) is expressed as a task in a [`DeferredQueue`] rather
//! than a blocking sleep, so the whole core can be driven by one event loop
//! or stepped deterministically from tests with a [`ManualClock`].

mod clock;
mod deferred;

pub use clock::{ManualClock, SystemTimeSource, TimeSource};
pub use deferred::{DeferredQueue, TaskHandle};
