use async_trait::async_trait;
use thiserror::Error;

/// A persistent ordered key-value store.
///
/// Keys and values are raw bytes so filesystem paths that are not valid
/// unicode round-trip unchanged. All mutations go through [`WriteBatch`],
/// which the store applies atomically.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DataStoreError>;
    async fn write(&self, batch: WriteBatch) -> Result<(), DataStoreError>;
    /// Returns every entry whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DataStoreError>;
    /// Flushes and releases the store. Calling it again is a no-op.
    async fn close(&self) -> Result<(), DataStoreError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataStoreError {
    #[error("could not open the backing store: {0}")]
    ConnectionError(String),
    #[error("backing store operation failed: {0}")]
    OperationFailed(String),
    #[error("backing store is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered set of puts and deletes applied in one atomic write.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
