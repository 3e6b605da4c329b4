use serde::{Deserialize, Serialize};
use std::hash::Hash;
use uuid::Uuid;

/// Identifier of a resource tracked by a history layer.
///
/// The byte form must be constant for a given value and of fixed width
/// for the identifier type, since it is embedded in revision keys.
pub trait ResourceId: Clone + Eq + Hash + Send + Sync + 'static {
    /// Constant byte representation of this identifier.
    fn resource_bytes(&self) -> Vec<u8>;
}

/// Process-unique token naming one history layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerToken(pub Uuid);

impl LayerToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for LayerToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk column coordinate within one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkCoord {
    pub fn new(cx: i32, cz: i32) -> Self {
        Self { cx, cz }
    }
}

impl ResourceId for ChunkCoord {
    fn resource_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.cx.to_be_bytes());
        out.extend_from_slice(&self.cz.to_be_bytes());
        out
    }
}

macro_rules! impl_resource_id_for_int {
    ($($ty:ty),*) => {
        $(
            impl ResourceId for $ty {
                fn resource_bytes(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }
            }
        )*
    };
}

impl_resource_id_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<const N: usize> ResourceId for [u8; N] {
    fn resource_bytes(&self) -> Vec<u8> {
        self.to_vec()
    }
}
