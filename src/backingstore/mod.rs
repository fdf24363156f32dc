pub mod data_store;
pub mod memory_data_store;
pub mod rocksdb_data_store;

pub use data_store::{BatchOp, DataStore, DataStoreError, WriteBatch};
