//! Backing key-value stores for the disk cache.
//!
//! Layout of a [`SectorFileStore`] directory:
//! ```text
//! store.meta.json   - schema version, sector size, index hash
//! index.cbor        - CBOR map from key to record location
//! records.dat       - record bytes placed by a SectorManager
//! ```

use crate::sector::{Sector, SectorError, SectorManager};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Current on-disk schema version of the sector file store.
const STORE_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "store.meta.json";
const INDEX_FILE: &str = "index.cbor";
const DATA_FILE: &str = "records.dat";

/// Errors from backing stores and the cache built on them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("sector size mismatch: store uses {stored}, requested {requested}")]
    SectorSizeMismatch { stored: u64, requested: u64 },
    #[error("sector allocation failed: {0}")]
    Sector(#[from] SectorError),
    #[error("cache directory lock error: {0}")]
    Lock(String),
}

impl StoreError {
    pub(crate) fn not_found(key: &[u8]) -> Self {
        Self::NotFound(String::from_utf8_lossy(key).into_owned())
    }
}

/// Ordered byte-key store used as the unbounded tier of a disk cache.
pub trait KvStore: Send {
    /// Fetch the value for `key`. Fails with [`StoreError::NotFound`] if absent.
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    fn contains(&self, key: &[u8]) -> bool;

    /// All keys in ascending order.
    fn keys(&self) -> Vec<Vec<u8>>;

    /// Make previous writes durable.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory store, mostly useful for tests and small sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(key))
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.keys().cloned().collect()
    }
}

/// Metadata stored in store.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
    pub sector_size: u64,
    pub index_sha256: String,
}

/// Where one record lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RecordLocation {
    /// `None` for empty values, which occupy no space.
    sector: Option<Sector>,
    len: u64,
}

/// File-backed store placing every record in one growable data file.
///
/// Records are allocated in whole sectors of `sector_size` bytes by a
/// [`SectorManager`]. The index is held in memory and written out by
/// [`flush`](KvStore::flush).
#[derive(Debug)]
pub struct SectorFileStore {
    root: PathBuf,
    sector_size: u64,
    data: File,
    sectors: SectorManager,
    index: BTreeMap<Vec<u8>, RecordLocation>,
}

impl SectorFileStore {
    /// Open or create a store in `path`.
    pub fn open(path: impl AsRef<Path>, sector_size: u64) -> Result<Self, StoreError> {
        if sector_size == 0 {
            return Err(SectorError::InvalidLength.into());
        }
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(DATA_FILE))?;
        let sectors = SectorManager::new(0, 0, true)?;

        let meta_path = root.join(META_FILE);
        let index = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(File::open(&meta_path)?)?;
            if meta.schema_version != STORE_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: STORE_SCHEMA_VERSION,
                });
            }
            if meta.sector_size != sector_size {
                return Err(StoreError::SectorSizeMismatch {
                    stored: meta.sector_size,
                    requested: sector_size,
                });
            }
            let raw = std::fs::read(root.join(INDEX_FILE))?;
            let actual = sha256_hex(&raw);
            if actual != meta.index_sha256 {
                return Err(StoreError::IntegrityMismatch {
                    expected: meta.index_sha256,
                    actual,
                });
            }
            let index: BTreeMap<Vec<u8>, RecordLocation> = cbor_deserialize(&raw)?;
            for location in index.values() {
                if let Some(sector) = location.sector {
                    sectors.reserve(sector)?;
                }
            }
            tracing::debug!(path = %root.display(), records = index.len(), "opened sector store");
            index
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            root,
            sector_size,
            data,
            sectors,
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sectors currently holding records.
    pub fn sectors(&self) -> Vec<Sector> {
        self.sectors.sectors()
    }

    fn write_at(&mut self, sector: Sector, value: &[u8]) -> Result<(), StoreError> {
        self.data
            .seek(SeekFrom::Start(sector.start * self.sector_size))?;
        self.data.write_all(value)?;
        Ok(())
    }

    fn save_index(&self) -> Result<(), StoreError> {
        let raw = cbor_serialize(&self.index)?;
        std::fs::write(self.root.join(INDEX_FILE), &raw)?;
        let meta = StoreMeta {
            schema_version: STORE_SCHEMA_VERSION,
            sector_size: self.sector_size,
            index_sha256: sha256_hex(&raw),
        };
        serde_json::to_writer_pretty(File::create(self.root.join(META_FILE))?, &meta)?;
        Ok(())
    }
}

impl KvStore for SectorFileStore {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let location = *self
            .index
            .get(key)
            .ok_or_else(|| StoreError::not_found(key))?;
        let Some(sector) = location.sector else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; location.len as usize];
        self.data
            .seek(SeekFrom::Start(sector.start * self.sector_size))?;
        self.data.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// The previous record stays in place until the new one is written.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let len = value.len() as u64;
        let sector = if len == 0 {
            None
        } else {
            let sector = self.sectors.reserve_space(len.div_ceil(self.sector_size))?;
            if let Err(e) = self.write_at(sector, value) {
                self.sectors.free(sector)?;
                return Err(e);
            }
            Some(sector)
        };
        let old = self
            .index
            .insert(key.to_vec(), RecordLocation { sector, len });
        if let Some(old) = old.and_then(|old| old.sector) {
            self.sectors.free(old)?;
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        if let Some(sector) = self.index.remove(key).and_then(|old| old.sector) {
            self.sectors.free(sector)?;
        }
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.index.keys().cloned().collect()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.data.flush()?;
        self.data.sync_data()?;
        self.save_index()
    }
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_basic() {
        let mut store = MemoryStore::new();
        assert!(matches!(store.get(b"a"), Err(StoreError::NotFound(_))));
        store.set(b"b", b"2").unwrap();
        store.set(b"a", b"1").unwrap();
        assert!(store.contains(b"a"));
        assert_eq!(store.get(b"a").unwrap(), b"1");
        assert_eq!(store.keys(), vec![b"a".to_vec(), b"b".to_vec()]);
        store.delete(b"a").unwrap();
        store.delete(b"missing").unwrap();
        assert!(!store.contains(b"a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sector_store_open_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SectorFileStore::open(tmp.path().join("db"), 64).unwrap();
        assert!(store.is_empty());
        assert!(store.root().join(DATA_FILE).is_file());
    }

    #[test]
    fn sector_store_set_get_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SectorFileStore::open(tmp.path(), 16).unwrap();

        store.set(b"small", b"hello").unwrap();
        store.set(b"large", &[7u8; 40]).unwrap();
        assert_eq!(store.get(b"small").unwrap(), b"hello");
        assert_eq!(store.get(b"large").unwrap(), vec![7u8; 40]);
        // 1 sector + 3 sectors.
        assert_eq!(store.sectors(), vec![Sector::new(0, 1), Sector::new(1, 4)]);

        store.set(b"small", &[1u8; 20]).unwrap();
        assert_eq!(store.get(b"small").unwrap(), vec![1u8; 20]);
        assert_eq!(store.get(b"large").unwrap(), vec![7u8; 40]);
        assert_eq!(store.sectors(), vec![Sector::new(1, 4), Sector::new(4, 6)]);
    }

    #[test]
    fn sector_store_delete_frees_space() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SectorFileStore::open(tmp.path(), 16).unwrap();
        store.set(b"a", &[1u8; 32]).unwrap();
        store.delete(b"a").unwrap();
        assert!(store.sectors().is_empty());
        assert!(matches!(store.get(b"a"), Err(StoreError::NotFound(_))));

        store.set(b"b", &[2u8; 16]).unwrap();
        assert_eq!(store.sectors(), vec![Sector::new(0, 1)]);
    }

    #[test]
    fn sector_store_failed_write_keeps_old_record() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SectorFileStore::open(tmp.path(), 16).unwrap();
        store.set(b"a", b"original").unwrap();
        let before = store.sectors();

        // Swap in a read-only handle so every record write fails.
        store.data = File::open(tmp.path().join(DATA_FILE)).unwrap();
        assert!(matches!(store.set(b"a", &[1u8; 40]), Err(StoreError::Io(_))));
        assert!(matches!(store.set(b"b", b"new"), Err(StoreError::Io(_))));

        assert_eq!(store.sectors(), before);
        assert_eq!(store.get(b"a").unwrap(), b"original");
        assert!(!store.contains(b"b"));
    }

    #[test]
    fn sector_store_empty_value_takes_no_space() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SectorFileStore::open(tmp.path(), 16).unwrap();
        store.set(b"empty", b"").unwrap();
        assert!(store.contains(b"empty"));
        assert_eq!(store.get(b"empty").unwrap(), Vec::<u8>::new());
        assert!(store.sectors().is_empty());
    }

    #[test]
    fn sector_store_reopen_preserves_records() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = SectorFileStore::open(tmp.path(), 32).unwrap();
            store.set(b"x", b"first").unwrap();
            store.set(b"y", &[9u8; 100]).unwrap();
            store.flush().unwrap();
        }

        let mut store = SectorFileStore::open(tmp.path(), 32).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(b"x").unwrap(), b"first");
        assert_eq!(store.get(b"y").unwrap(), vec![9u8; 100]);

        // Reserved space was rebuilt, so new records do not clobber old ones.
        store.set(b"z", b"third").unwrap();
        assert_eq!(store.get(b"y").unwrap(), vec![9u8; 100]);
        assert_eq!(store.get(b"z").unwrap(), b"third");
    }

    #[test]
    fn sector_store_detects_index_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = SectorFileStore::open(tmp.path(), 32).unwrap();
            store.set(b"x", b"data").unwrap();
            store.flush().unwrap();
        }
        let index_path = tmp.path().join(INDEX_FILE);
        let mut raw = std::fs::read(&index_path).unwrap();
        if let Some(byte) = raw.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&index_path, &raw).unwrap();

        assert!(matches!(
            SectorFileStore::open(tmp.path(), 32),
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn sector_store_rejects_other_sector_size() {
        let tmp = tempfile::tempdir().unwrap();
        SectorFileStore::open(tmp.path(), 32).unwrap().flush().unwrap();
        match SectorFileStore::open(tmp.path(), 64) {
            Err(StoreError::SectorSizeMismatch { stored, requested }) => {
                assert_eq!(stored, 32);
                assert_eq!(requested, 64);
            }
            Err(e) => panic!("expected SectorSizeMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn sector_store_schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        SectorFileStore::open(tmp.path(), 32).unwrap().flush().unwrap();

        let meta_path = tmp.path().join(META_FILE);
        let mut meta: StoreMeta =
            serde_json::from_reader(File::open(&meta_path).unwrap()).unwrap();
        meta.schema_version = 999;
        serde_json::to_writer_pretty(File::create(&meta_path).unwrap(), &meta).unwrap();

        assert!(matches!(
            SectorFileStore::open(tmp.path(), 32),
            Err(StoreError::SchemaMismatch {
                file_version: 999,
                ..
            })
        ));
    }
}
