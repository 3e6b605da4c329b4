use crate::store::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LEVEL_DATA_DIR: &str = "level_data";
const DIR_PREFIX: &str = "worldstoretmp";
const LOCK_FILE: &str = "lock";

/// A process-owned temporary directory for cache data.
///
/// Created as `<parent>/level_data/worldstoretmp<random>-<unix secs>` with an
/// exclusively locked `lock` file inside. The lock is held for the lifetime of
/// the value; dropping it releases the lock and deletes the directory.
#[derive(Debug)]
pub struct CacheDir {
    path: PathBuf,
    lock: File,
}

impl CacheDir {
    pub fn create(parent: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = parent.as_ref().join(LEVEL_DATA_DIR);
        std::fs::create_dir_all(&base)?;

        let path = base.join(format!(
            "{DIR_PREFIX}{}-{}",
            uuid::Uuid::new_v4().simple(),
            unix_secs(SystemTime::now())
        ));
        std::fs::create_dir(&path)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|e| StoreError::Lock(format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "created cache directory");
        Ok(Self { path, lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheDir {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to unlock cache directory");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove cache directory");
        }
    }
}

/// Remove cache directories under `parent` left behind by dead sessions.
///
/// A directory is removed when the timestamp in its name is at least
/// `max_age` old and its lock file is not held. Returns how many were removed.
pub fn clear_stale_dirs(parent: impl AsRef<Path>, max_age: Duration) -> Result<usize, StoreError> {
    let base = parent.as_ref().join(LEVEL_DATA_DIR);
    if !base.is_dir() {
        return Ok(0);
    }
    let now = unix_secs(SystemTime::now());
    let mut removed = 0;

    for entry in std::fs::read_dir(&base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(created) = name.to_str().and_then(parse_dir_time) else {
            continue;
        };
        if now.saturating_sub(created) < max_age.as_secs() {
            continue;
        }

        let path = entry.path();
        if is_locked(&path.join(LOCK_FILE)) {
            tracing::trace!(path = %path.display(), "skipping cache directory in use");
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed stale cache directory");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale cache directory");
            }
        }
    }
    Ok(removed)
}

/// Creation time encoded in a cache directory name.
fn parse_dir_time(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(DIR_PREFIX)?;
    let (_, secs) = rest.rsplit_once('-')?;
    secs.parse().ok()
}

/// Whether another handle holds the lock file. A missing lock file is unlocked.
fn is_locked(lock_path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(lock_path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CacheDir::create(tmp.path()).unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.starts_with(tmp.path().join(LEVEL_DATA_DIR)));
        assert!(path.join(LOCK_FILE).is_file());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(parse_dir_time(name).is_some());

        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn live_dir_is_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CacheDir::create(tmp.path()).unwrap();
        assert!(is_locked(&dir.path().join(LOCK_FILE)));
    }

    #[test]
    fn parse_names() {
        assert_eq!(parse_dir_time("worldstoretmpabc123-1700000000"), Some(1_700_000_000));
        assert_eq!(parse_dir_time("worldstoretmp-5"), Some(5));
        assert_eq!(parse_dir_time("worldstoretmpabc"), None);
        assert_eq!(parse_dir_time("other-1700000000"), None);
        assert_eq!(parse_dir_time("worldstoretmpabc-notanumber"), None);
    }

    #[test]
    fn clear_removes_only_stale_unlocked_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let live = CacheDir::create(tmp.path()).unwrap();

        let base = tmp.path().join(LEVEL_DATA_DIR);
        let stale = base.join("worldstoretmpdead-0");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join(LOCK_FILE), b"").unwrap();
        let unrelated = base.join("keep-0");
        std::fs::create_dir(&unrelated).unwrap();

        let removed = clear_stale_dirs(tmp.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(live.path().exists());
    }

    #[test]
    fn clear_respects_max_age() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CacheDir::create(tmp.path()).unwrap();
        let path = dir.path().to_path_buf();
        // Leak the directory as if the process had crashed.
        std::mem::forget(dir);

        let week = Duration::from_secs(7 * 24 * 60 * 60);
        assert_eq!(clear_stale_dirs(tmp.path(), week).unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn clear_without_level_data_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(clear_stale_dirs(tmp.path(), Duration::ZERO).unwrap(), 0);
    }
}
