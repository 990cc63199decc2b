/// Module-Info Set
///
/// The per-operation working set: an ordered array of module entries with
/// per-entry state (requested, pulled in as dependency, revalidation
/// candidate), the loaded data forest, and the accumulated diff.
///
/// The dependency resolver closes the seed set under data dependencies and
/// inverse dependencies, upgrading entry kinds where a module is reached on
/// several paths, then sorts the set by descriptor offset. That order is the
/// canonical lock order: every operation acquires module locks in ascending
/// descriptor address, which rules out lock-order deadlocks between
/// concurrent operations by construction.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::conn::Connection;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::registry;
use crate::rwlock::{LockMode, ShmRwLock};
use crate::schema::DepTag;
use crate::store::{self, Datastore};
use crate::tree::{Node, Tree};

/// Strength-ordered entry state: a directly requested module outranks a
/// revalidation candidate, which outranks a plain dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepKind {
    Dep,
    InvDep,
    Req,
}

/// Dependency-closure directions.
pub const WITH_DEPS: u8 = 0x1;
pub const WITH_INV_DEPS: u8 = 0x2;

#[derive(Debug, Clone)]
pub struct ModEntry {
    pub idx: u32,
    pub name: String,
    pub kind: DepKind,
    pub changed: bool,
    pub data_loaded: bool,
}

struct Acquired {
    lock_off: usize,
    mode: LockMode,
    primary: bool,
}

/// The working set of one operation.
pub struct ModInfo<'c> {
    pub(crate) conn: &'c Connection,
    pub ds: Datastore,
    /// Secondary datastore, read-locked alongside the primary (running, for
    /// operational requests).
    pub ds2: Option<Datastore>,
    pub entries: Vec<ModEntry>,
    pub data: Tree,
    pub diff: Tree,
    pub data_cached: bool,
    pub(crate) cached: Vec<(String, Arc<Tree>)>,
    acquired: Vec<Acquired>,
}

impl<'c> ModInfo<'c> {
    pub fn new(conn: &'c Connection, ds: Datastore) -> ModInfo<'c> {
        ModInfo {
            conn,
            ds,
            ds2: if ds == Datastore::Operational {
                Some(Datastore::Running)
            } else {
                None
            },
            entries: Vec::new(),
            data: Tree::new(),
            diff: Tree::new(),
            data_cached: false,
            cached: Vec::new(),
            acquired: Vec::new(),
        }
    }

    /// Add a module with the given kind, then close over its dependencies
    /// per `want_deps`. Present entries are upgraded to the stronger kind;
    /// dependency edges are only followed from entries strong enough to
    /// warrant it.
    pub fn add_mod(&mut self, name: &str, kind: DepKind, want_deps: u8) -> StoreResult<()> {
        let (idx, desc) = registry::find_module(&self.conn.shm, name)?.ok_or_else(|| {
            StoreError::new(ErrorKind::NotFound, format!("module '{}' is not installed", name))
        })?;

        match self.entries.iter_mut().find(|e| e.idx == idx) {
            Some(entry) => {
                if entry.kind >= kind {
                    return Ok(());
                }
                entry.kind = kind;
            }
            None => self.entries.push(ModEntry {
                idx,
                name: name.to_string(),
                kind,
                changed: false,
                data_loaded: false,
            }),
        }

        if want_deps & WITH_DEPS != 0 && kind >= DepKind::InvDep {
            for dep in registry::data_deps(&self.conn.shm, &desc)? {
                // Instance-identifier targets are only known with data in
                // hand; they are resolved later against actual instances.
                if dep.tag == DepTag::Instid {
                    continue;
                }
                self.add_mod(&dep.target, DepKind::Dep, want_deps & WITH_DEPS)?;
            }
        }
        if want_deps & WITH_INV_DEPS != 0 && kind == DepKind::Req {
            for inv in registry::inv_deps(&self.conn.shm, &desc)? {
                self.add_mod(&inv.target, DepKind::InvDep, want_deps)?;
            }
        }
        Ok(())
    }

    /// Canonical order: ascending descriptor offset. Must run after the
    /// closure and before any locking.
    pub fn finalize(&mut self) {
        self.entries.sort_by_key(|e| e.idx);
    }

    pub fn entry(&self, name: &str) -> Option<&ModEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn mark_changed(&mut self, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.changed = true;
        }
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.changed)
    }

    /// Permission gate: effective read/write access per requested module.
    /// Strict mode fails the whole operation; non-strict mode silently drops
    /// inaccessible modules and is only valid before any data is loaded.
    pub fn perm_check(&mut self, write: bool, strict: bool) -> StoreResult<()> {
        if !strict && self.entries.iter().any(|e| e.data_loaded) {
            return Err(StoreError::new(
                ErrorKind::Internal,
                "non-strict permission filtering requires an unloaded module-info set",
            ));
        }

        let cfg = self.conn.config();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &self.entries[i];
            if entry.kind != DepKind::Req && !entry.changed {
                i += 1;
                continue;
            }
            let allowed = store::access_check(cfg, &entry.name, write)?;
            if allowed {
                i += 1;
            } else if strict {
                return Err(StoreError::new(
                    ErrorKind::Unauthorized,
                    format!(
                        "{} access to module '{}' denied",
                        if write { "write" } else { "read" },
                        entry.name
                    ),
                ));
            } else {
                info!(
                    target: "yangstore::modinfo",
                    "dropping module '{}' from request: no {} access",
                    entry.name,
                    if write { "write" } else { "read" }
                );
                self.entries.remove(i);
            }
        }
        Ok(())
    }

    /// READ-lock the whole set in canonical order. With `upgradeable`, the
    /// requested modules take the read-upgradeable mode on the primary
    /// datastore so a later `upgrade_locks` can promote them to WRITE.
    pub fn rdlock(&mut self, upgradeable: bool, timeout: Duration) -> StoreResult<()> {
        self.lock_all(
            |entry| {
                if upgradeable && entry.kind == DepKind::Req {
                    LockMode::ReadUpgr
                } else {
                    LockMode::Read
                }
            },
            timeout,
        )
    }

    /// WRITE-lock the whole set in canonical order.
    pub fn wrlock(&mut self, timeout: Duration) -> StoreResult<()> {
        self.lock_all(|_| LockMode::Write, timeout)
    }

    fn lock_all(
        &mut self,
        mode_of: impl Fn(&ModEntry) -> LockMode,
        timeout: Duration,
    ) -> StoreResult<()> {
        debug_assert!(self.acquired.is_empty());
        let conn: &'c Connection = self.conn;
        let deadline = Instant::now() + timeout;
        let cid = conn.cid();

        for i in 0..self.entries.len() {
            let idx = self.entries[i].idx;
            let mode = mode_of(&self.entries[i]);

            let off = registry::data_lock_off(idx, self.ds.index());
            if let Err(e) = ShmRwLock::at(&conn.shm.main, off).lock(mode, cid, deadline) {
                self.unlock();
                return Err(e);
            }
            self.acquired.push(Acquired {
                lock_off: off,
                mode,
                primary: true,
            });

            if let Some(ds2) = self.ds2 {
                let off2 = registry::data_lock_off(idx, ds2.index());
                if let Err(e) =
                    ShmRwLock::at(&conn.shm.main, off2).lock(LockMode::Read, cid, deadline)
                {
                    self.unlock();
                    return Err(e);
                }
                self.acquired.push(Acquired {
                    lock_off: off2,
                    mode: LockMode::Read,
                    primary: false,
                });
            }
        }
        debug!(
            target: "yangstore::modinfo",
            "locked {} modules on {} (cid {})",
            self.entries.len(),
            self.ds.as_str(),
            cid
        );
        Ok(())
    }

    /// Promote the read-upgradeable primary locks to WRITE.
    pub fn upgrade_locks(&mut self, timeout: Duration) -> StoreResult<()> {
        let conn: &'c Connection = self.conn;
        let deadline = Instant::now() + timeout;
        let cid = conn.cid();
        for acq in self.acquired.iter_mut() {
            if acq.primary && acq.mode == LockMode::ReadUpgr {
                ShmRwLock::at(&conn.shm.main, acq.lock_off).upgrade(cid, deadline)?;
                acq.mode = LockMode::Write;
            }
        }
        Ok(())
    }

    /// Release everything acquired so far, in reverse order.
    pub fn unlock(&mut self) {
        let conn = self.conn;
        let cid = conn.cid();
        while let Some(acq) = self.acquired.pop() {
            ShmRwLock::at(&conn.shm.main, acq.lock_off).unlock(acq.mode, cid);
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.acquired.is_empty()
    }

    /// Evaluate an xpath against the loaded data, transparently using the
    /// aliased cache trees on the pure-read fast path.
    pub fn eval_data(&self, path: &crate::xpath::XPath) -> Tree {
        if self.data_cached {
            let mut out = Tree::new();
            for (_, tree) in &self.cached {
                out.merge(tree.select_with_parents(path), &crate::tree::LastWins);
            }
            out
        } else {
            self.data.select_with_parents(path)
        }
    }
}

impl Drop for ModInfo<'_> {
    fn drop(&mut self) {
        if !self.acquired.is_empty() {
            self.unlock();
        }
    }
}

/// Iterator over the modules owning nodes of an edit, yielding each module
/// once together with its first top-level node. The visited bitmap keeps
/// the walk linear in the number of edit roots.
pub struct EditModIter<'a> {
    edit: &'a Tree,
    visited: Vec<bool>,
    pos: usize,
}

impl<'a> EditModIter<'a> {
    pub fn new(edit: &'a Tree) -> EditModIter<'a> {
        EditModIter {
            edit,
            visited: vec![false; edit.roots.len()],
            pos: 0,
        }
    }
}

impl<'a> Iterator for EditModIter<'a> {
    type Item = (String, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.edit.roots.len() {
            let i = self.pos;
            self.pos += 1;
            if self.visited[i] {
                continue;
            }
            let module = self.edit.roots[i].module.clone();
            for (j, other) in self.edit.roots.iter().enumerate().skip(i) {
                if other.module == module {
                    self.visited[j] = true;
                }
            }
            return Some((module, &self.edit.roots[i]));
        }
        None
    }
}
