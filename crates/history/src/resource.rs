use worldstore_common::LayerToken;

/// Index of a resource in its layer's arena.
///
/// The generation changes whenever the slot is reclaimed, so a key held after
/// a reset no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceKey {
    slot: u32,
    generation: u32,
}

/// Reference from an undo bin to a resource in some layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceRef {
    pub layer: LayerToken,
    pub key: ResourceKey,
}

/// Revision state of one resource.
#[derive(Debug, Clone)]
pub(crate) struct Resource {
    /// Byte form of the resource id, used to build revision keys.
    pub id_bytes: Vec<u8>,
    /// Current revision.
    pub index: usize,
    /// Revision known to match what was last saved.
    pub saved_index: Option<usize>,
    /// Cursor value at the last modification, `None` once that bin is gone.
    pub global_index: Option<usize>,
    /// Whether data exists at each revision.
    pub exists: Vec<bool>,
}

impl Resource {
    pub fn new(id_bytes: Vec<u8>, exists: bool) -> Self {
        Self {
            id_bytes,
            index: 0,
            saved_index: Some(0),
            global_index: Some(0),
            exists: vec![exists],
        }
    }

    /// Whether data exists at the current revision.
    pub fn exists(&self) -> bool {
        self.exists.get(self.index).copied().unwrap_or(false)
    }

    pub fn is_changed(&self) -> bool {
        self.saved_index != Some(self.index)
    }

    pub fn revision_key(&self, layer: &LayerToken) -> Vec<u8> {
        revision_key(layer, &self.id_bytes, self.index)
    }

    /// Cache keys of stored revisions from `from` onwards.
    pub fn stored_keys(&self, layer: &LayerToken, from: usize) -> Vec<Vec<u8>> {
        self.exists
            .iter()
            .enumerate()
            .skip(from)
            .filter(|(_, exists)| **exists)
            .map(|(index, _)| revision_key(layer, &self.id_bytes, index))
            .collect()
    }
}

/// `token / id / decimal revision`.
pub(crate) fn revision_key(layer: &LayerToken, id_bytes: &[u8], index: usize) -> Vec<u8> {
    let index = index.to_string();
    let mut key = Vec::with_capacity(16 + id_bytes.len() + index.len() + 2);
    key.extend_from_slice(layer.as_bytes());
    key.push(b'/');
    key.extend_from_slice(id_bytes);
    key.push(b'/');
    key.extend_from_slice(index.as_bytes());
    key
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    resource: Option<Resource>,
}

/// Generational arena owning the resources of one layer.
#[derive(Debug, Default)]
pub(crate) struct ResourceArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ResourceArena {
    pub fn insert(&mut self, resource: Resource) -> ResourceKey {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.resource = Some(resource);
                ResourceKey {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    resource: Some(resource),
                });
                ResourceKey {
                    slot,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, key: ResourceKey) -> Option<&Resource> {
        self.slots
            .get(key.slot as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.resource.as_ref())
    }

    pub fn get_mut(&mut self, key: ResourceKey) -> Option<&mut Resource> {
        self.slots
            .get_mut(key.slot as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.resource.as_mut())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResourceKey, &mut Resource)> {
        self.slots.iter_mut().enumerate().filter_map(|(slot, s)| {
            let generation = s.generation;
            s.resource.as_mut().map(|r| {
                (
                    ResourceKey {
                        slot: slot as u32,
                        generation,
                    },
                    r,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Remove every resource. Keys issued before this no longer resolve.
    pub fn drain(&mut self) -> Vec<Resource> {
        let mut out = Vec::with_capacity(self.len());
        self.free.clear();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if let Some(resource) = entry.resource.take() {
                out.push(resource);
            }
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(slot as u32);
        }
        out
    }
}
