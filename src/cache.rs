/// Running-Data Cache
///
/// Per-connection cache of running datastore trees, keyed by module name and
/// guarded by a read-preferring RW lock. Each entry remembers the module
/// version it was loaded at; a descriptor version ahead of the entry makes
/// the entry stale and forces a refresh under the write lock. The cache
/// never stores a version ahead of the descriptor.
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tracing::debug;

use crate::error::StoreResult;
use crate::tree::Tree;

#[derive(Clone)]
pub struct CacheEntry {
    pub tree: Arc<Tree>,
    pub ver: u32,
}

pub struct RunningCache {
    enabled: bool,
    map: RwLock<LruCache<String, CacheEntry>>,
}

impl RunningCache {
    pub fn new(enabled: bool, capacity: usize) -> RunningCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        RunningCache {
            enabled,
            map: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fresh-entry lookup without promotion. Returns `None` on miss, on a
    /// stale entry, or when the cache is disabled.
    pub fn read(&self, module: &str, desc_ver: u32) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let guard = self.map.read();
        match guard.peek(module) {
            Some(entry) if entry.ver >= desc_ver => Some(entry.clone()),
            _ => None,
        }
    }

    /// Return a tree for `module` current at `desc_ver`. A fresh entry is
    /// served under the read lock; a stale or missing entry upgrades to the
    /// write lock and installs either `upd` (data an in-progress write
    /// already has in hand) or the result of `read_file`. With the cache
    /// disabled this degrades to a plain load.
    pub fn ensure(
        &self,
        module: &str,
        desc_ver: u32,
        upd: Option<Tree>,
        read_file: impl FnOnce() -> StoreResult<Tree>,
    ) -> StoreResult<Arc<Tree>> {
        if !self.enabled {
            return Ok(Arc::new(match upd {
                Some(tree) => tree,
                None => read_file()?,
            }));
        }

        {
            let guard = self.map.read();
            if let Some(entry) = guard.peek(module) {
                if entry.ver >= desc_ver {
                    return Ok(Arc::clone(&entry.tree));
                }
            }
        }

        let mut guard = self.map.write();
        // Another thread may have refreshed while we waited for the upgrade.
        if let Some(entry) = guard.peek(module) {
            if entry.ver >= desc_ver {
                return Ok(Arc::clone(&entry.tree));
            }
        }

        debug!(target: "yangstore::cache", "refreshing '{}' to ver {}", module, desc_ver);
        let tree = Arc::new(match upd {
            Some(tree) => tree,
            None => read_file()?,
        });
        guard.put(
            module.to_string(),
            CacheEntry {
                tree: Arc::clone(&tree),
                ver: desc_ver,
            },
        );
        Ok(tree)
    }

    /// Install post-write data at the version the write just produced.
    pub fn refresh(&self, module: &str, tree: Tree, ver: u32) {
        if !self.enabled {
            return;
        }
        let mut guard = self.map.write();
        guard.put(
            module.to_string(),
            CacheEntry {
                tree: Arc::new(tree),
                ver,
            },
        );
    }

    /// Drop a module's entry outright.
    pub fn invalidate(&self, module: &str) {
        if !self.enabled {
            return;
        }
        self.map.write().pop(module);
    }
}
