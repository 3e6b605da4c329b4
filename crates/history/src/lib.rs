//! History: undo bins over resources whose revisions live in a disk cache.
//!
//! # Invariants
//! - `undo_count + redo_count + 1` equals the number of bins.
//! - A resource's current revision exists in the cache exactly when its data
//!   at that revision is non-empty.
//! - Discarding redo history also discards the revisions only it could reach.
//! - A dropped layer is invisible to undo and redo.

mod layer;
mod manager;
mod resource;

pub use layer::HistoryManagerLayer;
pub use manager::{HistoryError, HistoryManager};
