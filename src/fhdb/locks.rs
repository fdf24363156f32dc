use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use tokio::sync::{Mutex, MutexGuard};

const LOCK_STRIPES: usize = 64;

/// Striped advisory locks keyed by path. Two paths may share a stripe, which
/// only costs some extra serialization.
pub(crate) struct PathLocks {
    stripes: Vec<Mutex<()>>,
}

impl PathLocks {
    pub(crate) fn new() -> Self {
        PathLocks {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(path: &Path) -> usize {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() as usize) % LOCK_STRIPES
    }

    pub(crate) async fn lock(&self, path: &Path) -> MutexGuard<'_, ()> {
        self.stripes[Self::stripe(path)].lock().await
    }

    /// Locks the stripes of both paths in index order.
    pub(crate) async fn lock_pair(
        &self,
        a: &Path,
        b: &Path,
    ) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (first, second) = {
            let (x, y) = (Self::stripe(a), Self::stripe(b));
            (x.min(y), x.max(y))
        };
        let first_guard = self.stripes[first].lock().await;
        let second_guard = if second != first {
            Some(self.stripes[second].lock().await)
        } else {
            None
        };
        (first_guard, second_guard)
    }
}
