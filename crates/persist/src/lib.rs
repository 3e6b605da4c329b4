//! Persistence: sector allocation, backing key-value stores, and a write-back
//! disk cache with a bounded RAM budget.
//!
//! # Invariants
//! - Free and reserved sectors tile `[start, stop)` of a manager with no gaps,
//!   no overlaps and no two adjacent free sectors.
//! - A cache never holds more than `max_size` bytes of values in RAM after an
//!   operation returns successfully.
//! - A dirty cache value is never dropped before it reaches the backing store.
//! - A sector file store refuses to open an index whose hash does not match its
//!   metadata.

mod cache;
mod cache_dir;
mod config;
mod sector;
mod store;

pub use cache::DiskCache;
pub use cache_dir::{CacheDir, clear_stale_dirs};
pub use config::{CACHE_DIR_ENV, CACHE_SIZE_ENV, CacheConfig};
pub use sector::{Sector, SectorError, SectorManager};
pub use store::{KvStore, MemoryStore, SectorFileStore, StoreError, StoreMeta};
