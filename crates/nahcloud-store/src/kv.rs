use crate::{fsync_dir, StoreError};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tempfile::NamedTempFile;
use tracing::debug;

/// Name of the advisory lock file that marks a data directory as owned.
const DIR_LOCK_FILE: &str = ".nahcloud.lock";

/// Key-value persistence provider used by [`crate::StateStore`].
///
/// Implementations must make each call atomic for its key. `put_if_absent`
/// is the test-and-set primitive lock acquisition relies on: it stores the
/// value only when the key does not exist yet.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Create or overwrite `key`.
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Store `data` under `key` only if the key is absent. Returns `true` if stored.
    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StoreError>;

    /// Remove `key`. Returns `true` if something was removed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Process-local provider. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), data.to_vec());
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key).is_some())
    }
}

/// File-backed provider: one file per key inside a data directory.
///
/// Writes go through a `NamedTempFile` in the same directory and are renamed
/// into place, so readers never observe a partially written value. The
/// directory is claimed with an exclusive advisory lock for the lifetime of
/// the provider; a second `open` of the same directory fails with
/// [`StoreError::DataDirLocked`].
pub struct FileKv {
    dir: PathBuf,
    _dir_lock: File,
}

impl FileKv {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(DIR_LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::DataDirLocked(dir.display().to_string()));
        }

        debug!("opened file store at {}", dir.display());
        Ok(Self {
            dir,
            _dir_lock: lock_file,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        check_key(key)?;
        Ok(self.dir.join(key))
    }

    fn stage(&self, data: &[u8]) -> Result<NamedTempFile, StoreError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

impl KvBackend for FileKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let dest = self.path_for(key)?;
        let tmp = self.stage(data)?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StoreError> {
        let dest = self.path_for(key)?;
        let tmp = self.stage(data)?;
        match tmp.persist_noclobber(&dest) {
            Ok(_) => {
                fsync_dir(&self.dir)?;
                Ok(true)
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Io(e.error)),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => {
                fsync_dir(&self.dir)?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys become file names, so they must be a single non-hidden path component.
fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".to_owned()));
    }
    if key.starts_with('.') {
        return Err(StoreError::InvalidKey(format!("'{key}' starts with '.'")));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(format!(
            "'{key}' contains a path separator"
        )));
    }
    Ok(())
}
