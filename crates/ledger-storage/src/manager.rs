//! Cache of open ledger stores, one per project path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::{default_base_dir, store_path, LedgerStore, PoolConfig, StorageError, StoreConfig};

/// Hands out shared [`LedgerStore`] handles keyed by project path.
///
/// Concurrent first requests for the same path open the store once: a miss
/// under the read lock is re-checked under the write lock before opening.
/// Different paths whose slugs collide share one file on disk but still get
/// separate cache entries.
pub struct LedgerManager {
    base_dir: PathBuf,
    pool: PoolConfig,
    stores: RwLock<HashMap<PathBuf, Arc<LedgerStore>>>,
}

impl LedgerManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_pool_config(base_dir, PoolConfig::default())
    }

    pub fn with_pool_config(base_dir: impl Into<PathBuf>, pool: PoolConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            pool,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Manager rooted at `<home>/.ledger`.
    pub fn from_home() -> Result<Self, StorageError> {
        Ok(Self::new(default_base_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn get(&self, project_path: impl AsRef<Path>) -> Result<Arc<LedgerStore>, StorageError> {
        let project_path = project_path.as_ref();
        {
            let stores = self.stores.read().map_err(|_| poisoned())?;
            if let Some(store) = stores.get(project_path) {
                return Ok(Arc::clone(store));
            }
        }

        let mut stores = self.stores.write().map_err(|_| poisoned())?;
        if let Some(store) = stores.get(project_path) {
            return Ok(Arc::clone(store));
        }

        let config = StoreConfig {
            project_path: project_path.to_path_buf(),
            base_dir: Some(self.base_dir.clone()),
            pool: self.pool.clone(),
        };
        let store = LedgerStore::open(&config).map_err(|source| StorageError::Open {
            project_path: project_path.display().to_string(),
            source: Box::new(source),
        })?;
        let store = Arc::new(store);
        stores.insert(project_path.to_path_buf(), Arc::clone(&store));
        debug!(
            project_path = %project_path.display(),
            cached = stores.len(),
            "ledger store cached"
        );
        Ok(store)
    }

    /// Evicts and closes the handle for `project_path`, if one is cached.
    /// Clones still held by callers see [`StorageError::Closed`] afterwards.
    pub fn close(&self, project_path: impl AsRef<Path>) -> Result<(), StorageError> {
        let project_path = project_path.as_ref();
        let evicted = self
            .stores
            .write()
            .map_err(|_| poisoned())?
            .remove(project_path);
        match evicted {
            Some(store) => {
                debug!(project_path = %project_path.display(), "ledger store evicted");
                store.close()
            }
            None => Ok(()),
        }
    }

    /// Closes every cached handle. All handles are attempted; the last
    /// failure is returned.
    pub fn close_all(&self) -> Result<(), StorageError> {
        let drained: Vec<(PathBuf, Arc<LedgerStore>)> = self
            .stores
            .write()
            .map_err(|_| poisoned())?
            .drain()
            .collect();

        let mut last_error = None;
        for (project_path, store) in drained {
            if let Err(err) = store.close() {
                warn!(
                    project_path = %project_path.display(),
                    error = %err,
                    "failed to close ledger store"
                );
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether a store file exists for `project_path`. Does not open it and
    /// ignores the cache.
    pub fn is_initialized(&self, project_path: impl AsRef<Path>) -> bool {
        store_path(&self.base_dir, project_path).exists()
    }

    pub fn open_count(&self) -> usize {
        self.stores.read().map(|stores| stores.len()).unwrap_or(0)
    }
}

fn poisoned() -> StorageError {
    StorageError::Internal("ledger manager lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn get_reuses_cached_handle() {
        let dir = TempDir::new().expect("temp dir");
        let manager = LedgerManager::new(dir.path());

        let first = manager.get("/work/app").expect("open");
        let second = manager.get("/work/app").expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.open_count(), 1);
    }

    #[test]
    fn close_evicts_and_closes() {
        let dir = TempDir::new().expect("temp dir");
        let manager = LedgerManager::new(dir.path());
        let store = manager.get("/work/app").expect("open");

        manager.close("/work/app").expect("close");
        assert!(store.is_closed());
        assert_eq!(manager.open_count(), 0);
        manager.close("/work/app").expect("closing an absent path is fine");

        let reopened = manager.get("/work/app").expect("reopen");
        assert!(!Arc::ptr_eq(&store, &reopened));
        assert_eq!(reopened.project_id(), store.project_id());
    }

    fn single_connection_manager(dir: &TempDir) -> LedgerManager {
        LedgerManager::with_pool_config(
            dir.path(),
            PoolConfig {
                pool_size: 1,
                connection_timeout_secs: 1,
                ..PoolConfig::default()
            },
        )
    }

    #[test]
    fn close_all_attempts_every_store_and_reports_failure() {
        let dir = TempDir::new().expect("temp dir");
        let manager = single_connection_manager(&dir);
        let stuck = manager.get("/work/stuck").expect("open stuck");
        let idle = manager.get("/work/idle").expect("open idle");

        // holding the only connection makes the checkpoint for `stuck` time out
        let held = stuck.conn().expect("conn");
        let err = manager.close_all().expect_err("checkpoint cannot get a connection");
        assert!(matches!(err, StorageError::Pool(_)), "{err}");

        assert_eq!(manager.open_count(), 0);
        assert!(stuck.is_closed());
        assert!(idle.is_closed());
        drop(held);
        assert!(matches!(stuck.list_notes(), Err(StorageError::Closed)));
    }

    #[test]
    fn failed_close_still_retires_evicted_handle() {
        let dir = TempDir::new().expect("temp dir");
        let manager = single_connection_manager(&dir);
        let store = manager.get("/work/app").expect("open");

        let held = store.conn().expect("conn");
        manager.close("/work/app").expect_err("checkpoint cannot get a connection");
        drop(held);

        assert_eq!(manager.open_count(), 0);
        assert!(matches!(
            store.get_decision("any"),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn open_failure_names_the_project() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").expect("write file");

        let manager = LedgerManager::new(&blocker);
        let err = match manager.get("/work/app") {
            Ok(_) => panic!("base dir is a file"),
            Err(err) => err,
        };
        assert!(matches!(err, StorageError::Open { ref project_path, .. } if project_path == "/work/app"));
        assert_eq!(manager.open_count(), 0);
    }
}
