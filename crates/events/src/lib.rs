//! Signal channels between concurrent tasks and their coordinating loop.
//!
//! Every phase of a batch reports back through the same three channels:
//!
//! - `progress` -- routine messages, forwarded to the log.
//! - `done` -- one [`Completion`] per task that finished.
//! - `fail` -- one message per task that hit a batch-fatal error.
//!
//! [`TaskSignals`] guarantees that each task sends exactly one terminal
//! signal, even when it panics.

pub mod signal;

pub use signal::{channels, Completion, Signal, SignalReceiver, SignalSender, TaskSignals};
