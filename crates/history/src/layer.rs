use crate::manager::{HistoryError, HistoryState, Shared};
use crate::resource::{Resource, ResourceKey, ResourceRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use worldstore_common::{LayerToken, ResourceId};

/// One namespace of resources sharing a [`HistoryManager`](crate::HistoryManager).
///
/// Resource data is opaque bytes; an empty value marks the resource as
/// deleted at that revision. Dropping the layer removes its revisions from
/// the cache.
pub struct HistoryManagerLayer<R: ResourceId> {
    shared: Arc<Shared>,
    token: LayerToken,
    // Only locked while the history state lock is held.
    ids: Mutex<HashMap<R, ResourceKey>>,
}

impl<R: ResourceId> HistoryManagerLayer<R> {
    pub(crate) fn new(shared: Arc<Shared>, token: LayerToken) -> Self {
        Self {
            shared,
            token,
            ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn token(&self) -> LayerToken {
        self.token
    }

    /// All resource ids known to this layer.
    pub fn resources(&self) -> Vec<R> {
        let state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        self.prune(&state, &mut ids);
        ids.keys().cloned().collect()
    }

    /// Resource ids whose current revision differs from the last saved one.
    pub fn changed_resources(&self) -> Vec<R> {
        let state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        self.prune(&state, &mut ids);
        let Some(arena) = state.layers.get(&self.token) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|(_, key)| arena.get(**key).is_some_and(Resource::is_changed))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether data exists for each known resource.
    pub fn resources_exist(&self) -> HashMap<R, bool> {
        let state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        self.prune(&state, &mut ids);
        let Some(arena) = state.layers.get(&self.token) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|(id, key)| arena.get(*key).map(|r| (id.clone(), r.exists())))
            .collect()
    }

    /// Whether the resource is known, regardless of whether its data was deleted.
    pub fn has_resource(&self, id: &R) -> bool {
        let state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        self.live_key(&state, &mut ids, id).is_some()
    }

    /// Whether data exists for the resource at its current revision.
    pub fn resource_exists(&self, id: &R) -> Result<bool, HistoryError> {
        let state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        let resource = self.resource(&state, &mut ids, id)?;
        Ok(resource.exists())
    }

    /// Data at the current revision. Empty if the resource is deleted.
    pub fn get_resource(&self, id: &R) -> Result<Vec<u8>, HistoryError> {
        let state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        let resource = self.resource(&state, &mut ids, id)?;
        if !resource.exists() {
            return Ok(Vec::new());
        }
        Ok(self.shared.cache.get(&resource.revision_key(&self.token))?)
    }

    /// Register a resource with its data as loaded from the world.
    ///
    /// This is revision 0 and is considered saved. Fails if the resource is
    /// already known.
    pub fn set_initial_resource(&self, id: R, data: Vec<u8>) -> Result<(), HistoryError> {
        let mut state = self.shared.state.lock();
        let mut ids = self.ids.lock();
        if self.live_key(&state, &mut ids, &id).is_some() {
            return Err(HistoryError::ResourceExists);
        }

        let resource = Resource::new(id.resource_bytes(), !data.is_empty());
        if !data.is_empty() {
            self.shared
                .cache
                .set(&resource.revision_key(&self.token), data)?;
        }
        let key = state
            .layers
            .entry(self.token)
            .or_default()
            .insert(resource);
        ids.insert(id, key);
        Ok(())
    }

    /// Write new data for a known resource.
    ///
    /// The first write in an undo bin creates a new revision; later writes in
    /// the same bin overwrite it. Any redo history is discarded. A cache
    /// error after the value is stored still leaves the revision recorded.
    pub fn set_resource(&self, id: &R, data: Vec<u8>) -> Result<(), HistoryError> {
        let mut guard = self.shared.state.lock();
        let mut ids = self.ids.lock();
        let key = self
            .live_key(&guard, &mut ids, id)
            .ok_or(HistoryError::UnknownResource)?;
        guard.invalidate_future(&self.shared.cache)?;

        let state = &mut *guard;
        let cursor = state.history_index;
        let resource = state
            .layers
            .get_mut(&self.token)
            .and_then(|arena| arena.get_mut(key))
            .ok_or(HistoryError::UnknownResource)?;

        if resource.global_index != Some(cursor) {
            resource.index += 1;
            resource.global_index = Some(cursor);
            resource.exists.truncate(resource.index);
            resource.exists.push(false);
        }
        if resource.saved_index == Some(resource.index) {
            resource.saved_index = None;
        }

        let revision = resource.revision_key(&self.token);
        let exists = !data.is_empty();
        resource.exists[resource.index] = exists;
        if cursor > 0 {
            state.bins[cursor].insert(ResourceRef {
                layer: self.token,
                key,
            });
        }
        if exists {
            self.shared.cache.set(&revision, data)?;
        } else {
            self.shared.cache.delete(&revision)?;
        }
        Ok(())
    }

    fn prune(&self, state: &HistoryState, ids: &mut HashMap<R, ResourceKey>) {
        match state.layers.get(&self.token) {
            Some(arena) => ids.retain(|_, key| arena.get(*key).is_some()),
            None => ids.clear(),
        }
    }

    /// Arena key for `id`, forgetting it if the history was reset.
    fn live_key(
        &self,
        state: &HistoryState,
        ids: &mut HashMap<R, ResourceKey>,
        id: &R,
    ) -> Option<ResourceKey> {
        let key = *ids.get(id)?;
        let live = state
            .layers
            .get(&self.token)
            .is_some_and(|arena| arena.get(key).is_some());
        if !live {
            ids.remove(id);
            return None;
        }
        Some(key)
    }

    fn resource<'a>(
        &self,
        state: &'a HistoryState,
        ids: &mut HashMap<R, ResourceKey>,
        id: &R,
    ) -> Result<&'a Resource, HistoryError> {
        self.live_key(state, ids, id)
            .and_then(|key| state.layers.get(&self.token)?.get(key))
            .ok_or(HistoryError::UnknownResource)
    }
}

impl<R: ResourceId> Drop for HistoryManagerLayer<R> {
    fn drop(&mut self) {
        let removed = self.shared.state.lock().layers.remove(&self.token);
        let Some(mut arena) = removed else {
            return;
        };
        let stale: Vec<Vec<u8>> = arena
            .drain()
            .iter()
            .flat_map(|resource| resource.stored_keys(&self.token, 0))
            .collect();
        tracing::debug!(layer = %self.token.0, keys = stale.len(), "dropping history layer");
        for key in stale {
            if let Err(e) = self.shared.cache.delete(&key) {
                tracing::warn!(layer = %self.token.0, error = %e, "failed to delete revision");
            }
        }
    }
}

impl<R: ResourceId> fmt::Debug for HistoryManagerLayer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryManagerLayer")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
