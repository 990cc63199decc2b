/// Connection Management
///
/// A connection owns one process mapping of the SHM pair, the process-local
/// schema registry and running cache, a fresh connection id, and a flock'd
/// liveness lock file. Recovery runs on every WRITE acquisition of the SHM
/// lock: any registered connection whose lock file is no longer flocked is
/// dead, and its module locks, subscriptions, and stored operational
/// overlay entries are reclaimed before the acquirer proceeds.
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cache::RunningCache;
use crate::config::Config;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::registry;
use crate::rwlock::{ConnLockFile, LockMode, ShmRwLock};
use crate::schema::{ModuleDef, ModuleSchema, NodeSchema, SchemaNodeKind, SchemaRegistry};
use crate::session::Session;
use crate::shm::{ConnEntryShm, ShmCtx, OFF_NEXT_CID, OFF_NEXT_SID, OFF_SCHEMA_LOCK, OFF_SHM_LOCK};
use crate::store::{self, Datastore};
use crate::subscr;
use crate::{MONITORING_MODULE, YANG_LIBRARY_MODULE};

pub struct Connection {
    cfg: Config,
    prefix: String,
    pub(crate) shm: ShmCtx,
    pub(crate) schemas: RwLock<SchemaRegistry>,
    pub(crate) cache: RunningCache,
    cid: u32,
    _lock_file: ConnLockFile,
}

/// Held SHM lock. WRITE holders trigger Ext SHM defragmentation on release
/// when the wasted share crossed the configured threshold.
pub(crate) struct ShmGuard<'a> {
    conn: &'a Connection,
    mode: LockMode,
}

impl Drop for ShmGuard<'_> {
    fn drop(&mut self) {
        if self.mode == LockMode::Write
            && self
                .conn
                .shm
                .ext
                .needs_defrag(self.conn.cfg.shm.defrag_percent)
        {
            if let Err(e) = registry::defrag(&self.conn.shm) {
                warn!(target: "yangstore::conn", "Ext SHM defragmentation failed: {}", e);
            }
        }
        ShmRwLock::at(&self.conn.shm.main, OFF_SHM_LOCK).unlock(self.mode, self.conn.cid);
    }
}

impl Connection {
    /// Open (or create) the SHM pair and register this connection.
    pub fn connect(cfg: Config) -> StoreResult<Arc<Connection>> {
        cfg.validate()?;
        let prefix = cfg.effective_prefix()?;

        for dir in [
            cfg.data_dir(),
            cfg.yang_dir(),
            cfg.notif_dir(),
            cfg.shm.dir.clone(),
            cfg.conn_locks_dir(&prefix),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| StoreError::sys(format!("failed to create {:?}", dir), e))?;
        }

        let (shm, created) = ShmCtx::open(
            &cfg.main_shm_path(&prefix),
            &cfg.ext_shm_path(&prefix),
            &cfg.shm.dir.join(format!("{}_create.lock", prefix)),
        )?;

        let cid = shm.main.next_id(OFF_NEXT_CID)?;
        let lock_file = ConnLockFile::acquire(&cfg.conn_lock_path(&prefix, cid))?;
        let cache = RunningCache::new(cfg.cache.enabled, cfg.cache.capacity);

        let conn = Arc::new(Connection {
            cfg,
            prefix,
            shm,
            schemas: RwLock::new(SchemaRegistry::new()),
            cache,
            cid,
            _lock_file: lock_file,
        });

        {
            let _guard = conn.shm_write(conn.cfg.lock_timeout())?;
            let header = conn.shm.main.read_header()?;
            let entry = ConnEntryShm {
                cid,
                pid: std::process::id(),
            };
            let new_off = conn
                .shm
                .ext
                .array_add(header.conn_list_off, header.conn_count, &entry)?;
            conn.shm.main.update_header(|h| {
                h.conn_list_off = new_off;
                h.conn_count += 1;
            })?;
        }

        conn.install_internal_modules()?;

        info!(
            target: "yangstore::conn",
            "connection {} attached (prefix '{}', shm {})",
            cid,
            conn.prefix,
            if created { "created" } else { "mapped" }
        );
        Ok(conn)
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Start a session on this connection.
    pub fn session_start(self: &Arc<Self>, user: &str) -> StoreResult<Session> {
        let sid = self.shm.main.next_id(OFF_NEXT_SID)?;
        Ok(Session::new(Arc::clone(self), sid, user))
    }

    /// Acquire the global SHM lock for reading.
    pub(crate) fn shm_read(&self, timeout: std::time::Duration) -> StoreResult<ShmGuard<'_>> {
        ShmRwLock::at(&self.shm.main, OFF_SHM_LOCK).lock(
            LockMode::Read,
            self.cid,
            Instant::now() + timeout,
        )?;
        Ok(ShmGuard {
            conn: self,
            mode: LockMode::Read,
        })
    }

    /// Acquire the global SHM lock for writing; runs dead-connection
    /// recovery before returning.
    pub(crate) fn shm_write(&self, timeout: std::time::Duration) -> StoreResult<ShmGuard<'_>> {
        ShmRwLock::at(&self.shm.main, OFF_SHM_LOCK).lock(
            LockMode::Write,
            self.cid,
            Instant::now() + timeout,
        )?;
        let guard = ShmGuard {
            conn: self,
            mode: LockMode::Write,
        };
        self.recover_dead()?;
        Ok(guard)
    }

    /// Reclaim the state of every registered connection whose liveness lock
    /// is gone: module locks, subscriptions, stored overlay entries, and the
    /// registration itself. Runs under the held SHM WRITE lock.
    fn recover_dead(&self) -> StoreResult<()> {
        let header = self.shm.main.read_header()?;
        let conns: Vec<ConnEntryShm> =
            self.shm.ext.array_get(header.conn_list_off, header.conn_count)?;

        for entry in conns {
            if entry.cid == self.cid {
                continue;
            }
            let lock_path = self.cfg.conn_lock_path(&self.prefix, entry.cid);
            if ConnLockFile::is_alive(&lock_path) {
                continue;
            }
            info!(target: "yangstore::conn", "recovering dead connection {}", entry.cid);

            let count = self.shm.main.mod_count()?;
            for idx in 0..count {
                for ds in 0..4 {
                    ShmRwLock::at(&self.shm.main, registry::data_lock_off(idx, ds))
                        .force_release_conn(entry.cid);
                }
            }
            ShmRwLock::at(&self.shm.main, OFF_SCHEMA_LOCK).force_release_conn(entry.cid);

            subscr::remove_conn_subs(&self.shm, entry.cid)?;

            for name in registry::module_names(&self.shm)? {
                let mut overlay =
                    store::load_module_file(&self.cfg, &self.prefix, &name, Datastore::Operational)?;
                if overlay.is_empty() {
                    continue;
                }
                overlay.retain_not_owned(entry.cid);
                store::write_module_file(
                    &self.cfg,
                    &self.prefix,
                    &name,
                    Datastore::Operational,
                    &overlay,
                )?;
            }

            let header = self.shm.main.read_header()?;
            let current: Vec<ConnEntryShm> =
                self.shm.ext.array_get(header.conn_list_off, header.conn_count)?;
            if let Some(pos) = current.iter().position(|c| c.cid == entry.cid) {
                let new_off = self.shm.ext.array_del::<ConnEntryShm>(
                    header.conn_list_off,
                    header.conn_count,
                    pos as u32,
                )?;
                self.shm.main.update_header(|h| {
                    h.conn_list_off = new_off;
                    h.conn_count -= 1;
                })?;
            }
            ConnLockFile::remove_stale(&lock_path);
        }
        Ok(())
    }

    /// Register a module schema process-locally without installing it (for
    /// connections attaching to an already-populated SHM).
    pub fn load_schema(&self, schema: ModuleSchema) {
        self.schemas.write().add(schema);
    }

    /// Install a module: SHM descriptor, startup file, YANG shelf entry,
    /// and the process-local schema.
    pub fn install_module(&self, def: ModuleDef) -> StoreResult<()> {
        let deadline = Instant::now() + self.cfg.lock_timeout();
        let schema_lock = ShmRwLock::at(&self.shm.main, OFF_SCHEMA_LOCK);
        schema_lock.lock(LockMode::Write, self.cid, deadline)?;

        let result = (|| -> StoreResult<()> {
            {
                let _guard = self.shm_write(self.cfg.lock_timeout())?;
                registry::install_module(&self.shm, &def)?;
            }
            store::init_module_files(&self.cfg, &def.schema.name, None)?;
            if let Some(text) = &def.yang_text {
                crate::schema::save_yang_file(
                    &self.cfg.yang_dir(),
                    &def.schema.name,
                    def.schema.revision.as_deref(),
                    text,
                )?;
            }
            self.schemas.write().add(def.schema.clone());
            Ok(())
        })();

        schema_lock.unlock(LockMode::Write, self.cid);
        result
    }

    /// Uninstall a module and drop its datastore files.
    pub fn uninstall_module(&self, name: &str) -> StoreResult<()> {
        let deadline = Instant::now() + self.cfg.lock_timeout();
        let schema_lock = ShmRwLock::at(&self.shm.main, OFF_SCHEMA_LOCK);
        schema_lock.lock(LockMode::Write, self.cid, deadline)?;

        let result = (|| -> StoreResult<()> {
            {
                let _guard = self.shm_write(self.cfg.lock_timeout())?;
                registry::uninstall_module(&self.shm, name)?;
            }
            store::remove_module_files(&self.cfg, &self.prefix, name);
            self.cache.invalidate(name);
            self.schemas.write().remove(name);
            Ok(())
        })();

        schema_lock.unlock(LockMode::Write, self.cid);
        result
    }

    /// Enable or disable a feature on an installed module.
    pub fn set_feature(&self, module: &str, feature: &str, enable: bool) -> StoreResult<()> {
        let deadline = Instant::now() + self.cfg.lock_timeout();
        let schema_lock = ShmRwLock::at(&self.shm.main, OFF_SCHEMA_LOCK);
        schema_lock.lock(LockMode::Write, self.cid, deadline)?;
        let result = (|| -> StoreResult<()> {
            let _guard = self.shm_write(self.cfg.lock_timeout())?;
            registry::set_feature(&self.shm, module, feature, enable)
        })();
        schema_lock.unlock(LockMode::Write, self.cid);
        result
    }

    /// Names of all installed modules.
    pub fn installed_modules(&self) -> StoreResult<Vec<String>> {
        let _guard = self.shm_read(self.cfg.lock_timeout())?;
        registry::module_names(&self.shm)
    }

    /// Current data version of an installed module.
    pub fn module_version(&self, module: &str) -> StoreResult<u32> {
        let _guard = self.shm_read(self.cfg.lock_timeout())?;
        let (idx, _) = registry::find_module(&self.shm, module)?.ok_or_else(|| {
            StoreError::new(ErrorKind::NotFound, format!("module '{}' is not installed", module))
        })?;
        self.shm.main.ver(idx)
    }

    /// Adjust a module's startup-file ownership/permissions.
    pub fn set_module_access(
        &self,
        module: &str,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> StoreResult<()> {
        store::set_module_access(&self.cfg, module, mode, uid, gid)
    }

    fn install_internal_modules(&self) -> StoreResult<()> {
        for def in [monitoring_def(), yang_library_def()] {
            self.schemas.write().add(def.schema.clone());
            if registry::find_module(&self.shm, &def.schema.name)?.is_none() {
                match self.install_module(def) {
                    Ok(()) => {}
                    // Another connection raced the install.
                    Err(e) if e.kind() == ErrorKind::Exists => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Unregister and drop our subscriptions; best effort with a short
        // deadline so shutdown never hangs.
        let lock = ShmRwLock::at(&self.shm.main, OFF_SHM_LOCK);
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        if lock.lock(LockMode::Write, self.cid, deadline).is_ok() {
            let result = (|| -> StoreResult<()> {
                subscr::remove_conn_subs(&self.shm, self.cid)?;
                let header = self.shm.main.read_header()?;
                let conns: Vec<ConnEntryShm> =
                    self.shm.ext.array_get(header.conn_list_off, header.conn_count)?;
                if let Some(pos) = conns.iter().position(|c| c.cid == self.cid) {
                    let new_off = self.shm.ext.array_del::<ConnEntryShm>(
                        header.conn_list_off,
                        header.conn_count,
                        pos as u32,
                    )?;
                    self.shm.main.update_header(|h| {
                        h.conn_list_off = new_off;
                        h.conn_count -= 1;
                    })?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!(target: "yangstore::conn", "connection {} teardown incomplete: {}", self.cid, e);
            }
            lock.unlock(LockMode::Write, self.cid);
        } else {
            warn!(target: "yangstore::conn", "connection {} could not unregister in time", self.cid);
        }
        debug!(target: "yangstore::conn", "connection {} closed", self.cid);
    }
}

fn monitoring_def() -> ModuleDef {
    ModuleDef::new(
        ModuleSchema::new(MONITORING_MODULE, None)
            .with_node(NodeSchema::new("/modules", SchemaNodeKind::Container).state())
            .with_node(NodeSchema::new("/modules/module", SchemaNodeKind::List).state().with_keys(&["name"]))
            .with_node(NodeSchema::new("/rpcs", SchemaNodeKind::Container).state())
            .with_node(NodeSchema::new("/connections", SchemaNodeKind::Container).state())
            .with_node(
                NodeSchema::new("/connections/connection", SchemaNodeKind::List)
                    .state()
                    .with_keys(&["cid"]),
            ),
    )
}

fn yang_library_def() -> ModuleDef {
    ModuleDef::new(
        ModuleSchema::new(YANG_LIBRARY_MODULE, Some("2019-01-04"))
            .with_node(NodeSchema::new("/modules-state", SchemaNodeKind::Container).state())
            .with_node(
                NodeSchema::new("/modules-state/module", SchemaNodeKind::List)
                    .state()
                    .with_keys(&["name"]),
            )
            .with_node(NodeSchema::new("/datastores", SchemaNodeKind::Container).state())
            .with_node(
                NodeSchema::new("/datastores/datastore", SchemaNodeKind::List)
                    .state()
                    .with_keys(&["name"]),
            ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_cfg(temp: &TempDir, prefix: &str) -> Config {
        let mut cfg = Config::default();
        cfg.repository.path = temp.path().join("repo");
        cfg.shm.dir = temp.path().join("shm");
        cfg.shm.prefix = prefix.to_string();
        cfg
    }

    #[test]
    fn test_connect_creates_shm_and_internal_modules() {
        let temp = TempDir::new().unwrap();
        let conn = Connection::connect(test_cfg(&temp, "c1")).unwrap();

        assert!(conn.config().main_shm_path("c1").exists());
        assert!(conn.config().ext_shm_path("c1").exists());
        assert!(conn.config().conn_lock_path("c1", conn.cid()).exists());

        let modules = conn.installed_modules().unwrap();
        assert!(modules.contains(&MONITORING_MODULE.to_string()));
        assert!(modules.contains(&YANG_LIBRARY_MODULE.to_string()));
    }

    #[test]
    fn test_connections_get_distinct_cids() {
        let temp = TempDir::new().unwrap();
        let c1 = Connection::connect(test_cfg(&temp, "c2")).unwrap();
        let c2 = Connection::connect(test_cfg(&temp, "c2")).unwrap();
        assert_ne!(c1.cid(), c2.cid());
    }

    #[test]
    fn test_disconnect_unregisters() {
        let temp = TempDir::new().unwrap();
        let c1 = Connection::connect(test_cfg(&temp, "c3")).unwrap();
        let cid1 = c1.cid();
        let lock_path = c1.config().conn_lock_path("c3", cid1);
        assert!(lock_path.exists());
        drop(c1);
        assert!(!lock_path.exists());

        // A fresh connection sees an empty connection list plus itself.
        let c2 = Connection::connect(test_cfg(&temp, "c3")).unwrap();
        let header = c2.shm.main.read_header().unwrap();
        assert_eq!(header.conn_count, 1);
    }

    #[test]
    fn test_recovery_reclaims_dead_connection_state() {
        let temp = TempDir::new().unwrap();
        let conn = Connection::connect(test_cfg(&temp, "c4")).unwrap();

        let def = ModuleDef::new(
            ModuleSchema::new("m", None).with_node(NodeSchema::new("/root", SchemaNodeKind::Container)),
        );
        conn.install_module(def).unwrap();
        let (idx, _) = registry::find_module(&conn.shm, "m").unwrap().unwrap();

        // Fabricate a dead connection: registered, holding a module WRITE
        // lock, owning a subscription and an overlay entry, but with no
        // liveness lock file.
        let dead_cid = 9999u32;
        {
            let _guard = conn.shm_write(conn.config().lock_timeout()).unwrap();
            let header = conn.shm.main.read_header().unwrap();
            let entry = ConnEntryShm { cid: dead_cid, pid: 1 };
            let new_off = conn
                .shm
                .ext
                .array_add(header.conn_list_off, header.conn_count, &entry)
                .unwrap();
            conn.shm
                .main
                .update_header(|h| {
                    h.conn_list_off = new_off;
                    h.conn_count += 1;
                })
                .unwrap();
            subscr::change_sub_add(&conn.shm, idx, 1, None, 0, 0, 77, dead_cid).unwrap();
        }
        ShmRwLock::at(&conn.shm.main, registry::data_lock_off(idx, 1))
            .lock(LockMode::Write, dead_cid, Instant::now() + std::time::Duration::from_secs(1))
            .unwrap();
        let overlay = {
            let mut leaf = crate::tree::Node::leaf("m", "stale", "x").with_owner(dead_cid);
            leaf.diff_op = crate::tree::DiffOp::Create;
            crate::tree::Tree::with_root(leaf)
        };
        store::write_module_file(conn.config(), conn.prefix(), "m", Datastore::Operational, &overlay)
            .unwrap();

        // The next WRITE acquisition recovers everything.
        drop(conn.shm_write(conn.config().lock_timeout()).unwrap());

        let state = conn
            .shm
            .main
            .read_lock_state(registry::data_lock_off(idx, 1))
            .unwrap();
        assert_eq!(state.writer_cid, 0);
        assert!(subscr::change_subs(&conn.shm, idx, 1).unwrap().is_empty());
        let overlay =
            store::load_module_file(conn.config(), conn.prefix(), "m", Datastore::Operational)
                .unwrap();
        assert!(overlay.is_empty());
        let header = conn.shm.main.read_header().unwrap();
        assert_eq!(header.conn_count, 1);
    }

}
