//! Concurrency primitives: a reentrant shared/unique lock with writer priority,
//! timeouts and cooperative cancellation.
//!
//! # Invariants
//! - At most one thread holds unique mode; while it does, no other thread holds shared.
//! - A queued unique request is never overtaken by a later shared request from a
//!   thread that does not already hold the lock.
//! - A cancelled or timed out acquire leaves no trace in the admission queue.

mod cancel;
mod lock;

pub use cancel::{CallbackId, CancelCallback, CancelManager, CancelToken, NeverCancel};
pub use lock::{AcquireOptions, LockError, ShareableLock, SharedGuard, UniqueGuard};
