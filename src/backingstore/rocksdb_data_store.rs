use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, DB};
use tracing::{debug, warn};

use crate::backingstore::data_store::{BatchOp, DataStore, DataStoreError, WriteBatch};

pub struct RocksDBDataStore {
    db: RwLock<Option<DB>>,
    path: PathBuf,
}

impl fmt::Display for RocksDBDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RocksDBDataStore({})", self.path.display())
    }
}

impl RocksDBDataStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DataStoreError> {
        let path = path.as_ref().to_path_buf();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path).map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;
        debug!("opened rocksdb at {}", path.display());
        Ok(RocksDBDataStore {
            db: RwLock::new(Some(db)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn failed(e: rocksdb::Error) -> DataStoreError {
    DataStoreError::OperationFailed(e.to_string())
}

#[async_trait]
impl DataStore for RocksDBDataStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DataStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(DataStoreError::Closed)?;
        db.get(key).map_err(failed)
    }

    async fn write(&self, batch: WriteBatch) -> Result<(), DataStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(DataStoreError::Closed)?;
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => rocks_batch.put(key, value),
                BatchOp::Delete { key } => rocks_batch.delete(key),
            }
        }
        db.write(rocks_batch).map_err(failed)
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DataStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(DataStoreError::Closed)?;
        let mut results = Vec::new();
        for item in db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(failed)?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    async fn close(&self) -> Result<(), DataStoreError> {
        let db = self.db.write().take();
        if let Some(db) = db {
            if let Err(e) = db.flush() {
                warn!("flush of {} before close failed: {}", self.path.display(), e);
            }
            drop(db);
            debug!("closed rocksdb at {}", self.path.display());
        }
        Ok(())
    }
}
