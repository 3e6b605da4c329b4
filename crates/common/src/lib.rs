//! Shared identifier types for the worldstore crates.
//!
//! # Invariants
//! - `ResourceId::resource_bytes` is constant per value and fixed width per type.
//! - Layer tokens are unique for the life of the process.

mod types;

pub use types::{ChunkCoord, LayerToken, ResourceId};
