//! Durable bidirectional mapping between filesystem paths and file handles.
//!
//! Every live object has two entries in the backing store:
//!
//! ```text
//! path_to_handle:<path>   -> <handle>
//! handle_to_path:<handle> -> <path>
//! ```
//!
//! Both are written and deleted together in one batch. The only window in
//! which a forward entry lacks its reverse partner is between the two writes
//! of [`HandleStore::move_path`]; [`HandleStore::repair`] reconciles what a
//! crash inside that window leaves behind.

mod handle;
mod locks;

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backingstore::rocksdb_data_store::RocksDBDataStore;
use crate::backingstore::{DataStore, DataStoreError, WriteBatch};

pub use handle::FileHandle;
use locks::PathLocks;

const FORWARD_PREFIX: &[u8] = b"path_to_handle:";
const REVERSE_PREFIX: &[u8] = b"handle_to_path:";
const DB_NAME: &str = "fh.db";

#[derive(Debug, Error)]
pub enum FhdbError {
    #[error("no mapping for {0}")]
    NotFound(String),
    #[error("malformed file handle ({0} bytes)")]
    BadHandle(usize),
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Store(#[from] DataStoreError),
    #[error("corrupt handle store entry: {0}")]
    Corrupt(String),
    #[error("handle store failed to open: {0}")]
    Unavailable(String),
    #[error("handle store is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreState {
    Opening,
    Ready,
    Failed(String),
    Closed,
}

/// Result of [`HandleStore::move_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Handle now mapped at the new path.
    pub handle: FileHandle,
    /// True when the old path had no mapping and `handle` is fresh.
    pub minted: bool,
    /// Handle that was mapped at the new path before the move and is now gone.
    pub displaced: Option<FileHandle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub orphaned_forward: usize,
    pub orphaned_reverse: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_forward == 0 && self.orphaned_reverse == 0
    }
}

pub struct HandleStore {
    store: RwLock<Option<Arc<dyn DataStore>>>,
    state: watch::Sender<StoreState>,
    locks: PathLocks,
    location: Option<PathBuf>,
}

fn forward_key(path: &Path) -> Vec<u8> {
    [FORWARD_PREFIX, path.as_os_str().as_bytes()].concat()
}

fn reverse_key(handle: &FileHandle) -> Vec<u8> {
    [REVERSE_PREFIX, handle.to_string().as_bytes()].concat()
}

fn path_bytes(path: &Path) -> Vec<u8> {
    path.as_os_str().as_bytes().to_vec()
}

fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes))
}

fn handle_from_value(value: &[u8]) -> Result<FileHandle, FhdbError> {
    std::str::from_utf8(value)
        .map_err(|_| FhdbError::Corrupt("handle value is not text".to_string()))?
        .parse()
}

async fn open_backing(location: &Path) -> Result<Arc<dyn DataStore>, FhdbError> {
    let io_err = |source| FhdbError::Io {
        path: location.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(location).await.map_err(io_err)?;
    tokio::fs::set_permissions(location, std::fs::Permissions::from_mode(0o700))
        .await
        .map_err(io_err)?;

    let db_path = location.join(DB_NAME);
    let store = tokio::task::spawn_blocking(move || RocksDBDataStore::new(db_path))
        .await
        .map_err(|e| FhdbError::Unavailable(e.to_string()))??;
    let store: Arc<dyn DataStore> = Arc::new(store);
    Ok(store)
}

impl HandleStore {
    /// Starts opening the RocksDB store under `location` and returns at once.
    ///
    /// The directory is created if absent and restricted to the owner.
    /// Readiness is published through [`HandleStore::subscribe`]; every
    /// operation waits until the store has left [`StoreState::Opening`].
    /// Must be called from within a tokio runtime.
    pub fn open(location: impl Into<PathBuf>) -> Arc<HandleStore> {
        let location = location.into();
        let (state, _) = watch::channel(StoreState::Opening);
        let fhdb = Arc::new(HandleStore {
            store: RwLock::new(None),
            state,
            locks: PathLocks::new(),
            location: Some(location.clone()),
        });

        let opening = Arc::clone(&fhdb);
        tokio::spawn(async move {
            match open_backing(&location).await {
                Ok(store) => {
                    let mut installed = false;
                    opening.state.send_if_modified(|state| {
                        if *state != StoreState::Opening {
                            return false;
                        }
                        *opening.store.write() = Some(Arc::clone(&store));
                        *state = StoreState::Ready;
                        installed = true;
                        true
                    });
                    if installed {
                        info!("handle store ready at {}", location.display());
                    } else if let Err(e) = store.close().await {
                        warn!("closing store opened after shutdown: {}", e);
                    }
                }
                Err(e) => {
                    error!("handle store at {} failed to open: {}", location.display(), e);
                    opening.state.send_if_modified(|state| {
                        if *state == StoreState::Opening {
                            *state = StoreState::Failed(e.to_string());
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        });
        fhdb
    }

    /// Wraps an already open store; the result is ready immediately.
    pub fn with_store(store: Arc<dyn DataStore>) -> HandleStore {
        let (state, _) = watch::channel(StoreState::Ready);
        HandleStore {
            store: RwLock::new(Some(store)),
            state,
            locks: PathLocks::new(),
            location: None,
        }
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn state(&self) -> StoreState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreState> {
        self.state.subscribe()
    }

    pub async fn wait_ready(&self) -> Result<(), FhdbError> {
        self.backing().await.map(|_| ())
    }

    async fn backing(&self) -> Result<Arc<dyn DataStore>, FhdbError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != StoreState::Opening)
            .await
            .map_err(|_| FhdbError::Closed)?
            .clone();
        match state {
            StoreState::Ready => self.store.read().clone().ok_or(FhdbError::Closed),
            StoreState::Failed(reason) => Err(FhdbError::Unavailable(reason)),
            StoreState::Opening | StoreState::Closed => Err(FhdbError::Closed),
        }
    }

    async fn forward(&self, store: &dyn DataStore, path: &Path) -> Result<Option<FileHandle>, FhdbError> {
        match store.get(&forward_key(path)).await? {
            Some(value) => handle_from_value(&value).map(Some),
            None => Ok(None),
        }
    }

    async fn reverse(&self, store: &dyn DataStore, handle: &FileHandle) -> Result<Option<PathBuf>, FhdbError> {
        Ok(store.get(&reverse_key(handle)).await?.map(path_from_bytes))
    }

    /// Returns the path currently mapped to `handle`.
    pub async fn resolve(&self, handle: &FileHandle) -> Result<PathBuf, FhdbError> {
        let store = self.backing().await?;
        self.reverse(store.as_ref(), handle)
            .await?
            .ok_or_else(|| FhdbError::NotFound(handle.to_string()))
    }

    /// Returns the handle mapped to `path`, minting and persisting one if the
    /// path exists on disk but has no mapping yet.
    pub async fn lookup_or_create(&self, path: &Path) -> Result<FileHandle, FhdbError> {
        let store = self.backing().await?;
        if let Some(handle) = self.forward(store.as_ref(), path).await? {
            return Ok(handle);
        }

        let _guard = self.locks.lock(path).await;
        if let Some(handle) = self.forward(store.as_ref(), path).await? {
            return Ok(handle);
        }

        match tokio::fs::symlink_metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FhdbError::NotFound(path.display().to_string()))
            }
            Err(source) => {
                return Err(FhdbError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let handle = FileHandle::generate();
        store
            .write(
                WriteBatch::new()
                    .put(forward_key(path), handle.to_string())
                    .put(reverse_key(&handle), path_bytes(path)),
            )
            .await?;
        debug!("minted {} for {}", handle, path.display());
        #[cfg(feature = "metrics")]
        crate::kernel::metrics::HANDLES_MINTED.inc();
        Ok(handle)
    }

    /// Carries the handle of `old` over to `new`.
    ///
    /// The new forward and reverse entries are written first; the stale
    /// forward entry for `old` is deleted in a second write. A handle that
    /// was mapped at `new` loses its reverse entry in the first write.
    pub async fn move_path(&self, old: &Path, new: &Path) -> Result<MoveOutcome, FhdbError> {
        let store = self.backing().await?;
        let _guards = self.locks.lock_pair(old, new).await;

        let existing = self.forward(store.as_ref(), old).await?;
        let displaced = self
            .forward(store.as_ref(), new)
            .await?
            .filter(|previous| Some(*previous) != existing);
        let handle = existing.unwrap_or_else(FileHandle::generate);

        let mut batch = WriteBatch::new()
            .put(forward_key(new), handle.to_string())
            .put(reverse_key(&handle), path_bytes(new));
        if let Some(previous) = displaced {
            batch = batch.delete(reverse_key(&previous));
        }
        store.write(batch).await?;

        if existing.is_some() && old != new {
            store.write(WriteBatch::new().delete(forward_key(old))).await?;
        }

        debug!(
            "moved {} -> {} ({}{})",
            old.display(),
            new.display(),
            handle,
            if existing.is_none() { ", minted" } else { "" }
        );
        Ok(MoveOutcome {
            handle,
            minted: existing.is_none(),
            displaced,
        })
    }

    /// Drops the mapping of `path`, returning the handle it had.
    pub async fn remove(&self, path: &Path) -> Result<Option<FileHandle>, FhdbError> {
        let store = self.backing().await?;
        let _guard = self.locks.lock(path).await;

        let handle = match self.forward(store.as_ref(), path).await? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let mut batch = WriteBatch::new().delete(forward_key(path));
        // a handle already carried elsewhere by an interrupted move keeps its reverse entry
        if self.reverse(store.as_ref(), &handle).await?.as_deref() == Some(path) {
            batch = batch.delete(reverse_key(&handle));
        }
        store.write(batch).await?;
        debug!("removed {} ({})", path.display(), handle);
        Ok(Some(handle))
    }

    /// Deletes entries that have no matching partner: forward entries whose
    /// handle maps elsewhere and reverse entries whose path maps elsewhere.
    /// Meant to run before the server starts answering calls.
    pub async fn repair(&self) -> Result<RepairReport, FhdbError> {
        let store = self.backing().await?;
        let forward: HashMap<Vec<u8>, Vec<u8>> = store
            .scan_prefix(FORWARD_PREFIX)
            .await?
            .into_iter()
            .map(|(k, v)| (k[FORWARD_PREFIX.len()..].to_vec(), v))
            .collect();
        let reverse: HashMap<Vec<u8>, Vec<u8>> = store
            .scan_prefix(REVERSE_PREFIX)
            .await?
            .into_iter()
            .map(|(k, v)| (k[REVERSE_PREFIX.len()..].to_vec(), v))
            .collect();

        let mut report = RepairReport::default();
        let mut batch = WriteBatch::new();
        for (path, handle) in &forward {
            if reverse.get(handle) != Some(path) {
                warn!(
                    "dropping orphaned forward entry {}",
                    String::from_utf8_lossy(path)
                );
                batch = batch.delete([FORWARD_PREFIX, path.as_slice()].concat());
                report.orphaned_forward += 1;
            }
        }
        for (handle, path) in &reverse {
            if forward.get(path) != Some(handle) {
                warn!(
                    "dropping orphaned reverse entry {}",
                    String::from_utf8_lossy(handle)
                );
                batch = batch.delete([REVERSE_PREFIX, handle.as_slice()].concat());
                report.orphaned_reverse += 1;
            }
        }
        if !batch.is_empty() {
            store.write(batch).await?;
        }
        info!(
            "handle store repair: {} forward, {} reverse orphans removed",
            report.orphaned_forward, report.orphaned_reverse
        );
        Ok(report)
    }

    /// Every forward mapping, ordered by path.
    pub async fn entries(&self) -> Result<Vec<(PathBuf, FileHandle)>, FhdbError> {
        let store = self.backing().await?;
        store
            .scan_prefix(FORWARD_PREFIX)
            .await?
            .into_iter()
            .map(|(k, v)| {
                let handle = handle_from_value(&v)?;
                Ok((path_from_bytes(k[FORWARD_PREFIX.len()..].to_vec()), handle))
            })
            .collect()
    }

    /// Closes the backing store. Later calls, and calls racing an
    /// unfinished open, are no-ops.
    pub async fn close(&self) -> Result<(), FhdbError> {
        let previous = self.state.send_replace(StoreState::Closed);
        if previous == StoreState::Closed {
            return Ok(());
        }
        let store = self.store.write().take();
        if let Some(store) = store {
            store.close().await?;
            info!("handle store closed");
        }
        Ok(())
    }
}
