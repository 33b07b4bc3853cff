//! Cooperative cancellation.
//!
//! The pipeline owns one shared [`CancellationToken`]. Every task runs with a
//! token chained to it and to the caller's own token, so cancelling either
//! side reaches the stages of that task.

mod token;

pub use token::{CallbackId, CancelCallback, CancellationToken};
