#![forbid(unsafe_code)]

use envrun_storage::{SqliteStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared access to the store. The lock is held only for the duration of one
/// closure, which is synchronous, so it can never span an `.await`.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    inner: Arc<Mutex<SqliteStore>>,
    storage_dir: PathBuf,
}

impl StoreHandle {
    pub fn new(store: SqliteStore) -> Self {
        let storage_dir = store.storage_dir().to_path_buf();
        Self {
            inner: Arc::new(Mutex::new(store)),
            storage_dir,
        }
    }

    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(SqliteStore::open(storage_dir)?))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn with<T, E>(&self, f: impl FnOnce(&mut SqliteStore) -> Result<T, E>) -> Result<T, E> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
