//! Bounded cache of open file descriptors keyed by file handle.
//!
//! Entries leave the cache when capacity is exceeded (least recently used
//! first), when they sit unused for longer than the TTL, when they are
//! replaced, or on explicit deletion. Every departure is handed to the
//! [`EvictionPolicy`], which owns closing the descriptor.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::fhdb::FileHandle;
use crate::settings::FdCacheSettings;

/// An open descriptor plus the file size last observed through it.
#[derive(Debug)]
pub struct OpenFile {
    file: File,
    size: AtomicU64,
}

impl OpenFile {
    pub fn new(file: File, size: u64) -> OpenFile {
        OpenFile {
            file,
            size: AtomicU64::new(size),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Raises the cached size to `end` if a write went past it.
    pub fn extend_to(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Capacity,
    Expired,
    Explicit,
    Replaced,
}

/// Called synchronously for every record that leaves the cache.
/// Implementations must not panic and must not propagate close failures.
pub trait EvictionPolicy: Send + Sync {
    fn on_evict(&self, handle: FileHandle, record: Arc<OpenFile>, reason: EvictionReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// A call still holds the record; the descriptor closes when it lets go.
    Deferred,
}

/// Closes the descriptor if this is the last reference to the record.
pub fn close_record(record: Arc<OpenFile>) -> CloseOutcome {
    match Arc::try_unwrap(record) {
        Ok(open) => {
            drop(OwnedFd::from(open.file));
            CloseOutcome::Closed
        }
        Err(_) => CloseOutcome::Deferred,
    }
}

/// Default policy: close and log.
#[derive(Debug, Default)]
pub struct CloseOnEvict;

impl EvictionPolicy for CloseOnEvict {
    fn on_evict(&self, handle: FileHandle, record: Arc<OpenFile>, reason: EvictionReason) {
        match close_record(record) {
            CloseOutcome::Closed => debug!("fd_cache: closed {} ({:?})", handle, reason),
            CloseOutcome::Deferred => debug!("fd_cache: {} still in use, close deferred ({:?})", handle, reason),
        }
    }
}

struct Slot {
    record: Arc<OpenFile>,
    last_access: Instant,
}

pub struct FdCache {
    entries: Mutex<LruCache<FileHandle, Slot>>,
    ttl: Duration,
    policy: Arc<dyn EvictionPolicy>,
}

type Evicted = Vec<(FileHandle, Arc<OpenFile>, EvictionReason)>;

impl FdCache {
    pub fn new(max: usize, ttl: Duration) -> FdCache {
        Self::with_policy(max, ttl, Arc::new(CloseOnEvict))
    }

    pub fn from_settings(settings: &FdCacheSettings) -> FdCache {
        Self::new(settings.max, settings.ttl())
    }

    pub fn with_policy(max: usize, ttl: Duration, policy: Arc<dyn EvictionPolicy>) -> FdCache {
        let capacity = NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN);
        FdCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            policy,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, slot: &Slot, now: Instant) -> bool {
        now.duration_since(slot.last_access) >= self.ttl
    }

    fn notify(&self, evicted: Evicted) {
        for (handle, record, reason) in evicted {
            #[cfg(feature = "metrics")]
            crate::kernel::metrics::FD_EVICTIONS.inc();
            self.policy.on_evict(handle, record, reason);
        }
        #[cfg(feature = "metrics")]
        crate::kernel::metrics::OPEN_DESCRIPTORS.set(self.len() as i64);
    }

    /// Returns the record and marks it most recently used. Expired records
    /// are evicted and reported as absent.
    pub fn get(&self, handle: &FileHandle) -> Option<Arc<OpenFile>> {
        let now = Instant::now();
        let mut evicted = Evicted::new();
        let found = {
            let mut entries = self.entries.lock();
            let stale = entries.peek(handle).map(|slot| self.expired(slot, now));
            match stale {
                None => None,
                Some(true) => {
                    if let Some(slot) = entries.pop(handle) {
                        evicted.push((*handle, slot.record, EvictionReason::Expired));
                    }
                    None
                }
                Some(false) => entries.get_mut(handle).map(|slot| {
                    slot.last_access = now;
                    Arc::clone(&slot.record)
                }),
            }
        };
        self.notify(evicted);
        found
    }

    /// True when a live record exists. Does not refresh its age.
    pub fn has(&self, handle: &FileHandle) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(handle)
            .map(|slot| !self.expired(slot, now))
            .unwrap_or(false)
    }

    pub fn set(&self, handle: FileHandle, record: Arc<OpenFile>) {
        let slot = Slot {
            record: Arc::clone(&record),
            last_access: Instant::now(),
        };
        let mut evicted = Evicted::new();
        {
            let mut entries = self.entries.lock();
            if let Some((old_handle, old)) = entries.push(handle, slot) {
                if old_handle != handle {
                    evicted.push((old_handle, old.record, EvictionReason::Capacity));
                } else if !Arc::ptr_eq(&old.record, &record) {
                    evicted.push((old_handle, old.record, EvictionReason::Replaced));
                }
            }
        }
        self.notify(evicted);
    }

    pub fn delete(&self, handle: &FileHandle) -> bool {
        let removed = self.entries.lock().pop(handle);
        match removed {
            Some(slot) => {
                self.notify(vec![(*handle, slot.record, EvictionReason::Explicit)]);
                true
            }
            None => false,
        }
    }

    /// Evicts every record unused for at least the TTL.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Evicted::new();
        {
            let mut entries = self.entries.lock();
            // LRU order is access order, so expired records sit at the tail
            while entries
                .peek_lru()
                .map(|(_, slot)| self.expired(slot, now))
                .unwrap_or(false)
            {
                if let Some((handle, slot)) = entries.pop_lru() {
                    evicted.push((handle, slot.record, EvictionReason::Expired));
                }
            }
        }
        let count = evicted.len();
        self.notify(evicted);
        count
    }

    /// Periodically purges expired records until the cache is dropped.
    pub fn start_monitoring(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<FdCache> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(live) = cache.upgrade() else {
                    break;
                };
                let purged = live.purge_expired();
                if purged > 0 {
                    debug!("fd_cache: purged {} expired descriptors", purged);
                }
            }
        })
    }
}
