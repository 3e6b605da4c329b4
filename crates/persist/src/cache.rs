use crate::cache_dir::{CacheDir, clear_stale_dirs};
use crate::config::CacheConfig;
use crate::store::{KvStore, SectorFileStore, StoreError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    dirty: bool,
}

struct CacheState {
    store: Box<dyn KvStore>,
    /// Least recently used first.
    ram: IndexMap<Vec<u8>, CacheEntry>,
    ram_size: usize,
    max_size: usize,
}

/// Write-back cache keeping recently used values in RAM and spilling the rest
/// to a [`KvStore`].
///
/// Only value lengths count toward the RAM budget. A written value is held
/// dirty in RAM until it is evicted or flushed, and eviction never drops a
/// dirty value without writing it back first.
pub struct DiskCache {
    state: Mutex<CacheState>,
    // Keeps a temporary directory locked and alive while the cache uses it.
    dir: Option<CacheDir>,
}

impl DiskCache {
    pub fn new(store: Box<dyn KvStore>, max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                store,
                ram: IndexMap::new(),
                ram_size: 0,
                max_size,
            }),
            dir: None,
        }
    }

    /// A cache backed by a [`SectorFileStore`] in a fresh [`CacheDir`].
    ///
    /// Stale directories from earlier sessions are swept first.
    pub fn temporary(config: &CacheConfig) -> Result<Self, StoreError> {
        let parent = config.parent_dir();
        match clear_stale_dirs(&parent, config.stale_after) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "swept stale cache directories"),
            Err(e) => tracing::warn!(error = %e, "failed to sweep stale cache directories"),
        }
        let dir = CacheDir::create(&parent)?;
        let store = SectorFileStore::open(dir.path().join("db"), config.sector_size)?;
        let mut cache = Self::new(Box::new(store), config.max_size);
        cache.dir = Some(dir);
        Ok(cache)
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    /// Change the RAM budget, evicting immediately if it shrank.
    pub fn set_max_size(&self, max_size: usize) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.max_size = max_size;
        state.evict()
    }

    /// Bytes of values currently held in RAM.
    pub fn ram_size(&self) -> usize {
        self.state.lock().ram_size
    }

    /// Number of entries currently held in RAM.
    pub fn ram_len(&self) -> usize {
        self.state.lock().ram.len()
    }

    /// Insert or replace a value, evicting least recently used entries.
    ///
    /// The value is stored before eviction runs. An error means writing back
    /// some other entry failed; `key` is still readable and the failed entry
    /// stays dirty in RAM, so retrying the same `set` is not needed.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(old) = state.ram.shift_remove(key) {
            state.ram_size -= old.value.len();
        }
        state.ram_size += value.len();
        state
            .ram
            .insert(key.to_vec(), CacheEntry { value, dirty: true });
        state.evict()
    }

    /// Fetch a value, promoting it to most recently used.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.ram.shift_remove(key) {
            let value = entry.value.clone();
            state.ram.insert(key.to_vec(), entry);
            return Ok(value);
        }

        let value = state.store.get(key)?;
        tracing::trace!(len = value.len(), "cache miss");
        state.ram_size += value.len();
        state.ram.insert(
            key.to_vec(),
            CacheEntry {
                value: value.clone(),
                dirty: false,
            },
        );
        state.evict()?;
        Ok(value)
    }

    /// Remove a key from RAM and the backing store. Absent keys are ignored.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(old) = state.ram.shift_remove(key) {
            state.ram_size -= old.value.len();
        }
        state.store.delete(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let state = self.state.lock();
        state.ram.contains_key(key) || state.store.contains(key)
    }

    /// Write every dirty entry to the backing store and flush it.
    ///
    /// Entries stay resident and become clean.
    pub fn flush(&self) -> Result<(), StoreError> {
        let _span = tracing::info_span!("cache_flush").entered();
        let mut state = self.state.lock();
        let CacheState { store, ram, .. } = &mut *state;
        let mut written = 0usize;
        for (key, entry) in ram.iter_mut().filter(|(_, e)| e.dirty) {
            store.set(key, &entry.value)?;
            entry.dirty = false;
            written += 1;
        }
        store.flush()?;
        tracing::debug!(written, "flushed cache");
        Ok(())
    }
}

impl CacheState {
    fn evict(&mut self) -> Result<(), StoreError> {
        if self.ram_size <= self.max_size {
            return Ok(());
        }
        let _span = tracing::info_span!("cache_evict", ram_size = self.ram_size, max_size = self.max_size)
            .entered();
        let mut evicted = 0usize;
        while self.ram_size > self.max_size {
            let Some((key, entry)) = self.ram.shift_remove_index(0) else {
                break;
            };
            let written = if entry.dirty {
                self.store.set(&key, &entry.value)
            } else {
                Ok(())
            };
            if let Err(e) = written {
                tracing::warn!(error = %e, "write-back failed, keeping entry in RAM");
                self.ram.shift_insert(0, key, entry);
                return Err(e);
            }
            self.ram_size -= entry.value.len();
            evicted += 1;
        }
        tracing::trace!(evicted, ram_size = self.ram_size, "evicted cache entries");
        Ok(())
    }
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DiskCache")
            .field("ram_len", &state.ram.len())
            .field("ram_size", &state.ram_size)
            .field("max_size", &state.max_size)
            .field("dir", &self.dir.as_ref().map(CacheDir::path))
            .finish()
    }
}
