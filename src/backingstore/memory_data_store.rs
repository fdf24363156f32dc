use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backingstore::data_store::{BatchOp, DataStore, DataStoreError, WriteBatch};

/// In-memory store for tests and benchmarks. Writes can be made to fail on
/// demand to exercise store-fault paths.
#[derive(Default, Clone)]
pub struct MemoryDataStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    fn ensure_open(&self) -> Result<(), DataStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DataStoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DataStoreError> {
        self.ensure_open()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn write(&self, batch: WriteBatch) -> Result<(), DataStoreError> {
        self.ensure_open()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DataStoreError::OperationFailed("injected write failure".to_string()));
        }
        let mut data = self.data.write().await;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DataStoreError> {
        self.ensure_open()?;
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn close(&self) -> Result<(), DataStoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
