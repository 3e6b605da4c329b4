use crate::layer::HistoryManagerLayer;
use crate::resource::{ResourceArena, ResourceRef};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use worldstore_common::{LayerToken, ResourceId};
use worldstore_persist::{DiskCache, StoreError};

/// Errors from history operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("resource already exists in this layer")]
    ResourceExists,
    #[error("resource is not known to this layer")]
    UnknownResource,
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("nothing to redo")]
    NothingToRedo,
    #[error("cache error: {0}")]
    Store(#[from] StoreError),
}

/// The undo ledger shared by a manager and its layers.
#[derive(Debug)]
pub(crate) struct HistoryState {
    /// Resources modified in each bin. Bin 0 is never populated.
    pub bins: Vec<HashSet<ResourceRef>>,
    pub history_index: usize,
    pub layers: HashMap<LayerToken, ResourceArena>,
}

impl HistoryState {
    fn new() -> Self {
        Self {
            bins: vec![HashSet::new()],
            history_index: 0,
            layers: HashMap::new(),
        }
    }

    pub fn redo_count(&self) -> usize {
        self.bins.len() - (self.history_index + 1)
    }

    pub fn has_redo(&self) -> bool {
        self.redo_count() > 0
    }

    /// Discard every bin after the cursor along with the revisions only they
    /// could reach.
    pub fn invalidate_future(&mut self, cache: &DiskCache) -> Result<(), StoreError> {
        if !self.has_redo() {
            return Ok(());
        }
        let cursor = self.history_index;
        let _span = tracing::info_span!("invalidate_future", cursor, dropped = self.redo_count())
            .entered();
        self.bins.truncate(cursor + 1);

        let current = &self.bins[cursor];
        let mut stale = Vec::new();
        for (token, arena) in self.layers.iter_mut() {
            for (key, resource) in arena.iter_mut() {
                if resource.saved_index.is_some_and(|saved| saved > resource.index) {
                    resource.saved_index = None;
                }
                if resource.global_index.is_some_and(|global| global > cursor) {
                    let reference = ResourceRef { layer: *token, key };
                    resource.global_index = current.contains(&reference).then_some(cursor);
                }
                stale.extend(resource.stored_keys(token, resource.index + 1));
                resource.exists.truncate(resource.index + 1);
            }
        }

        tracing::debug!(keys = stale.len(), "discarding redo revisions");
        for key in stale {
            cache.delete(&key)?;
        }
        Ok(())
    }
}

pub(crate) struct Shared {
    pub state: Mutex<HistoryState>,
    pub cache: Arc<DiskCache>,
}

/// Multi-level undo/redo over resources stored in a [`DiskCache`].
///
/// Changes are grouped into undo bins. Every change made after
/// [`create_undo_bin`](Self::create_undo_bin) belongs to that bin until the
/// next call, and [`undo`](Self::undo) / [`redo`](Self::redo) move every
/// resource touched by a bin at once. Changes made before the first bin is
/// created cannot be undone.
///
/// Cloning yields another handle to the same history.
#[derive(Clone)]
pub struct HistoryManager {
    shared: Arc<Shared>,
}

impl HistoryManager {
    pub fn new(cache: Arc<DiskCache>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(HistoryState::new()),
                cache,
            }),
        }
    }

    /// The cache holding revision data.
    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.shared.cache
    }

    /// Create a new namespace of resources sharing this history.
    pub fn new_layer<R: ResourceId>(&self) -> HistoryManagerLayer<R> {
        let token = LayerToken::new();
        self.shared
            .state
            .lock()
            .layers
            .insert(token, ResourceArena::default());
        tracing::debug!(layer = %token.0, "created history layer");
        HistoryManagerLayer::new(Arc::clone(&self.shared), token)
    }

    /// Start a new undo bin, discarding any redo history.
    pub fn create_undo_bin(&self) -> Result<(), HistoryError> {
        let mut state = self.shared.state.lock();
        state.invalidate_future(&self.shared.cache)?;
        state.history_index += 1;
        state.bins.push(HashSet::new());
        tracing::trace!(cursor = state.history_index, "created undo bin");
        Ok(())
    }

    /// Record the current revision of every resource as saved.
    pub fn mark_saved(&self) {
        let mut state = self.shared.state.lock();
        for arena in state.layers.values_mut() {
            for (_, resource) in arena.iter_mut() {
                resource.saved_index = Some(resource.index);
            }
        }
    }

    pub fn undo_count(&self) -> usize {
        self.shared.state.lock().history_index
    }

    pub fn redo_count(&self) -> usize {
        self.shared.state.lock().redo_count()
    }

    /// Revert every resource changed in the current bin.
    pub fn undo(&self) -> Result<(), HistoryError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.history_index == 0 {
            return Err(HistoryError::NothingToUndo);
        }
        let mut moved = 0usize;
        for reference in &state.bins[state.history_index] {
            if let Some(resource) = state
                .layers
                .get_mut(&reference.layer)
                .and_then(|arena| arena.get_mut(reference.key))
            {
                resource.index = resource.index.saturating_sub(1);
                moved += 1;
            }
        }
        state.history_index -= 1;
        tracing::debug!(cursor = state.history_index, resources = moved, "undo");
        Ok(())
    }

    /// Reapply every resource change in the next bin.
    pub fn redo(&self) -> Result<(), HistoryError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.has_redo() {
            return Err(HistoryError::NothingToRedo);
        }
        state.history_index += 1;
        let mut moved = 0usize;
        for reference in &state.bins[state.history_index] {
            if let Some(resource) = state
                .layers
                .get_mut(&reference.layer)
                .and_then(|arena| arena.get_mut(reference.key))
            {
                resource.index += 1;
                moved += 1;
            }
        }
        tracing::debug!(cursor = state.history_index, resources = moved, "redo");
        Ok(())
    }

    /// Forget every resource of every layer and all history.
    ///
    /// Layers stay usable but are empty afterwards.
    pub fn reset(&self) -> Result<(), HistoryError> {
        let mut state = self.shared.state.lock();
        let mut stale = Vec::new();
        for (token, arena) in state.layers.iter_mut() {
            for resource in arena.drain() {
                stale.extend(resource.stored_keys(token, 0));
            }
        }
        state.bins = vec![HashSet::new()];
        state.history_index = 0;
        tracing::debug!(keys = stale.len(), "reset history");
        for key in stale {
            self.shared.cache.delete(&key)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HistoryManager")
            .field("undo_count", &state.history_index)
            .field("redo_count", &state.redo_count())
            .field("layers", &state.layers.len())
            .finish()
    }
}
