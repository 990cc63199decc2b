/// Subscription Tables
///
/// Change, operational, notification, and RPC subscription records live in
/// Ext SHM arrays hanging off the module descriptors (RPC subscriptions off
/// the Main SHM header, keyed by operation path). Subscriptions belong
/// exclusively to one connection and are dropped wholesale when that
/// connection dies.
///
/// Callers must hold the SHM lock in WRITE mode for every mutation and in
/// READ mode for lookups; add/remove never runs while any module data lock
/// is held.
///
/// Event pipes are FIFOs under the repository; writing a single byte wakes
/// the subscriber, which then picks the actual event up from its rendezvous
/// slot.
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::shm::{ChangeSubShm, ExtShm, NotifSubShm, OperSubShm, RpcSubShm, ShmCtx};
use crate::xpath::XPath;

/// Subscription option flags.
pub const SUB_PASSIVE: u32 = 0x1;
pub const SUB_OPER_MERGE: u32 = 0x2;

/// Kind of an operational subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperSubKind {
    State,
    Config,
    Mixed,
}

impl OperSubKind {
    pub fn to_u32(self) -> u32 {
        match self {
            OperSubKind::State => 0,
            OperSubKind::Config => 1,
            OperSubKind::Mixed => 2,
        }
    }

    pub fn from_u32(v: u32) -> OperSubKind {
        match v {
            1 => OperSubKind::Config,
            2 => OperSubKind::Mixed,
            _ => OperSubKind::State,
        }
    }
}

/// Resolved change-subscription record.
#[derive(Debug, Clone)]
pub struct ChangeSub {
    pub xpath: Option<String>,
    pub priority: u32,
    pub opts: u32,
    pub evpipe: u32,
    pub cid: u32,
}

impl ChangeSub {
    pub fn is_passive(&self) -> bool {
        self.opts & SUB_PASSIVE != 0
    }
}

/// Resolved operational-subscription record.
#[derive(Debug, Clone)]
pub struct OperSub {
    pub xpath: String,
    pub kind: OperSubKind,
    pub opts: u32,
    pub evpipe: u32,
    pub cid: u32,
}

impl OperSub {
    pub fn is_merge(&self) -> bool {
        self.opts & SUB_OPER_MERGE != 0
    }
}

/// Resolved notification-subscription record.
#[derive(Debug, Clone)]
pub struct NotifSub {
    pub xpath: Option<String>,
    pub sub_id: u32,
    pub evpipe: u32,
    pub cid: u32,
    pub suspended: bool,
}

/// Resolved RPC-subscription record.
#[derive(Debug, Clone)]
pub struct RpcSub {
    pub path: String,
    pub priority: u32,
    pub sub_id: u32,
    pub evpipe: u32,
    pub cid: u32,
}

// ----- change subscriptions -----

pub fn change_subs(shm: &ShmCtx, mod_idx: u32, ds_idx: usize) -> StoreResult<Vec<ChangeSub>> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<ChangeSubShm> =
        shm.ext.array_get(desc.change_subs_off[ds_idx], desc.change_sub_count[ds_idx])?;
    records
        .iter()
        .map(|r| {
            Ok(ChangeSub {
                xpath: shm.ext.read_opt_str(r.xpath_off)?,
                priority: r.priority,
                opts: r.opts,
                evpipe: r.evpipe,
                cid: r.cid,
            })
        })
        .collect()
}

pub fn change_sub_add(
    shm: &ShmCtx,
    mod_idx: u32,
    ds_idx: usize,
    xpath: Option<&str>,
    priority: u32,
    opts: u32,
    evpipe: u32,
    cid: u32,
) -> StoreResult<()> {
    let record = ChangeSubShm {
        xpath_off: shm.ext.store_opt_str(xpath)?,
        priority,
        opts,
        evpipe,
        cid,
    };
    let desc = shm.main.read_descriptor(mod_idx)?;
    let new_off =
        shm.ext
            .array_add(desc.change_subs_off[ds_idx], desc.change_sub_count[ds_idx], &record)?;
    shm.main.update_descriptor(mod_idx, |d| {
        d.change_subs_off[ds_idx] = new_off;
        d.change_sub_count[ds_idx] += 1;
    })
}

pub fn change_sub_del(shm: &ShmCtx, mod_idx: u32, ds_idx: usize, evpipe: u32) -> StoreResult<()> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<ChangeSubShm> =
        shm.ext.array_get(desc.change_subs_off[ds_idx], desc.change_sub_count[ds_idx])?;
    let pos = records.iter().position(|r| r.evpipe == evpipe).ok_or_else(|| {
        StoreError::new(ErrorKind::NotFound, "change subscription not found")
    })?;
    if let Some(xp) = shm.ext.read_opt_str(records[pos].xpath_off)? {
        shm.ext.wasted_add(ExtShm::str_block_size(&xp))?;
    }
    let new_off = shm.ext.array_del::<ChangeSubShm>(
        desc.change_subs_off[ds_idx],
        desc.change_sub_count[ds_idx],
        pos as u32,
    )?;
    shm.main.update_descriptor(mod_idx, |d| {
        d.change_subs_off[ds_idx] = new_off;
        d.change_sub_count[ds_idx] -= 1;
    })
}

// ----- operational subscriptions -----

/// Operational subscriptions are kept ordered by xpath depth, shallowest
/// first, so composition visits parents before their descendants.
pub fn oper_subs(shm: &ShmCtx, mod_idx: u32) -> StoreResult<Vec<OperSub>> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<OperSubShm> = shm.ext.array_get(desc.oper_subs_off, desc.oper_sub_count)?;
    records
        .iter()
        .map(|r| {
            Ok(OperSub {
                xpath: shm.ext.read_str(r.xpath_off)?,
                kind: OperSubKind::from_u32(r.kind),
                opts: r.opts,
                evpipe: r.evpipe,
                cid: r.cid,
            })
        })
        .collect()
}

pub fn oper_sub_add(
    shm: &ShmCtx,
    mod_idx: u32,
    xpath: &str,
    kind: OperSubKind,
    opts: u32,
    evpipe: u32,
    cid: u32,
) -> StoreResult<()> {
    let depth = XPath::parse(xpath)?.depth() as u32;
    let record = OperSubShm {
        xpath_off: shm.ext.store_str(xpath)?,
        kind: kind.to_u32(),
        opts,
        evpipe,
        cid,
        depth,
        _pad: 0,
    };
    let desc = shm.main.read_descriptor(mod_idx)?;
    let existing: Vec<OperSubShm> = shm.ext.array_get(desc.oper_subs_off, desc.oper_sub_count)?;
    let pos = existing
        .iter()
        .position(|r| r.depth > depth)
        .unwrap_or(existing.len()) as u32;
    let new_off = shm
        .ext
        .array_insert(desc.oper_subs_off, desc.oper_sub_count, pos, &record)?;
    shm.main.update_descriptor(mod_idx, |d| {
        d.oper_subs_off = new_off;
        d.oper_sub_count += 1;
    })
}

pub fn oper_sub_del(shm: &ShmCtx, mod_idx: u32, evpipe: u32) -> StoreResult<()> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<OperSubShm> = shm.ext.array_get(desc.oper_subs_off, desc.oper_sub_count)?;
    let pos = records.iter().position(|r| r.evpipe == evpipe).ok_or_else(|| {
        StoreError::new(ErrorKind::NotFound, "operational subscription not found")
    })?;
    let xp = shm.ext.read_str(records[pos].xpath_off)?;
    shm.ext.wasted_add(ExtShm::str_block_size(&xp))?;
    let new_off =
        shm.ext
            .array_del::<OperSubShm>(desc.oper_subs_off, desc.oper_sub_count, pos as u32)?;
    shm.main.update_descriptor(mod_idx, |d| {
        d.oper_subs_off = new_off;
        d.oper_sub_count -= 1;
    })
}

// ----- notification subscriptions -----

pub fn notif_subs(shm: &ShmCtx, mod_idx: u32) -> StoreResult<Vec<NotifSub>> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<NotifSubShm> = shm.ext.array_get(desc.notif_subs_off, desc.notif_sub_count)?;
    records
        .iter()
        .map(|r| {
            Ok(NotifSub {
                xpath: shm.ext.read_opt_str(r.xpath_off)?,
                sub_id: r.sub_id,
                evpipe: r.evpipe,
                cid: r.cid,
                suspended: r.suspended != 0,
            })
        })
        .collect()
}

pub fn notif_sub_add(
    shm: &ShmCtx,
    mod_idx: u32,
    xpath: Option<&str>,
    sub_id: u32,
    evpipe: u32,
    cid: u32,
) -> StoreResult<()> {
    let record = NotifSubShm {
        xpath_off: shm.ext.store_opt_str(xpath)?,
        sub_id,
        evpipe,
        cid,
        suspended: 0,
    };
    let desc = shm.main.read_descriptor(mod_idx)?;
    let new_off = shm.ext.array_add(desc.notif_subs_off, desc.notif_sub_count, &record)?;
    shm.main.update_descriptor(mod_idx, |d| {
        d.notif_subs_off = new_off;
        d.notif_sub_count += 1;
    })
}

pub fn notif_sub_del(shm: &ShmCtx, mod_idx: u32, sub_id: u32) -> StoreResult<()> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<NotifSubShm> = shm.ext.array_get(desc.notif_subs_off, desc.notif_sub_count)?;
    let pos = records.iter().position(|r| r.sub_id == sub_id).ok_or_else(|| {
        StoreError::new(ErrorKind::NotFound, "notification subscription not found")
    })?;
    if let Some(xp) = shm.ext.read_opt_str(records[pos].xpath_off)? {
        shm.ext.wasted_add(ExtShm::str_block_size(&xp))?;
    }
    let new_off =
        shm.ext
            .array_del::<NotifSubShm>(desc.notif_subs_off, desc.notif_sub_count, pos as u32)?;
    shm.main.update_descriptor(mod_idx, |d| {
        d.notif_subs_off = new_off;
        d.notif_sub_count -= 1;
    })
}

/// Suspend or resume a notification subscription in place.
pub fn notif_sub_suspend(shm: &ShmCtx, mod_idx: u32, sub_id: u32, suspended: bool) -> StoreResult<()> {
    let desc = shm.main.read_descriptor(mod_idx)?;
    let records: Vec<NotifSubShm> = shm.ext.array_get(desc.notif_subs_off, desc.notif_sub_count)?;
    let pos = records.iter().position(|r| r.sub_id == sub_id).ok_or_else(|| {
        StoreError::new(ErrorKind::NotFound, "notification subscription not found")
    })?;
    let mut record = records[pos];
    record.suspended = suspended as u32;
    shm.ext.array_set(desc.notif_subs_off, pos as u32, &record)
}

// ----- RPC subscriptions -----

pub fn rpc_subs(shm: &ShmCtx) -> StoreResult<Vec<RpcSub>> {
    let header = shm.main.read_header()?;
    let records: Vec<RpcSubShm> = shm.ext.array_get(header.rpc_subs_off, header.rpc_sub_count)?;
    records
        .iter()
        .map(|r| {
            Ok(RpcSub {
                path: shm.ext.read_str(r.path_off)?,
                priority: r.priority,
                sub_id: r.sub_id,
                evpipe: r.evpipe,
                cid: r.cid,
            })
        })
        .collect()
}

pub fn rpc_sub_add(
    shm: &ShmCtx,
    path: &str,
    priority: u32,
    sub_id: u32,
    evpipe: u32,
    cid: u32,
) -> StoreResult<()> {
    let record = RpcSubShm {
        path_off: shm.ext.store_str(path)?,
        priority,
        sub_id,
        evpipe,
        cid,
    };
    let header = shm.main.read_header()?;
    let new_off = shm.ext.array_add(header.rpc_subs_off, header.rpc_sub_count, &record)?;
    shm.main.update_header(|h| {
        h.rpc_subs_off = new_off;
        h.rpc_sub_count += 1;
    })
}

pub fn rpc_sub_del(shm: &ShmCtx, sub_id: u32) -> StoreResult<()> {
    let header = shm.main.read_header()?;
    let records: Vec<RpcSubShm> = shm.ext.array_get(header.rpc_subs_off, header.rpc_sub_count)?;
    let pos = records
        .iter()
        .position(|r| r.sub_id == sub_id)
        .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "RPC subscription not found"))?;
    let path = shm.ext.read_str(records[pos].path_off)?;
    shm.ext.wasted_add(ExtShm::str_block_size(&path))?;
    let new_off =
        shm.ext
            .array_del::<RpcSubShm>(header.rpc_subs_off, header.rpc_sub_count, pos as u32)?;
    shm.main.update_header(|h| {
        h.rpc_subs_off = new_off;
        h.rpc_sub_count -= 1;
    })
}

// ----- connection recovery -----

/// Drop every subscription owned by connection `cid`, across all modules and
/// the RPC table. Returns how many records were removed.
pub fn remove_conn_subs(shm: &ShmCtx, cid: u32) -> StoreResult<usize> {
    let mut removed = 0;
    let count = shm.main.mod_count()?;

    for mod_idx in 0..count {
        for ds_idx in 0..4 {
            loop {
                let desc = shm.main.read_descriptor(mod_idx)?;
                let records: Vec<ChangeSubShm> =
                    shm.ext.array_get(desc.change_subs_off[ds_idx], desc.change_sub_count[ds_idx])?;
                match records.iter().position(|r| r.cid == cid) {
                    None => break,
                    Some(pos) => {
                        if let Some(xp) = shm.ext.read_opt_str(records[pos].xpath_off)? {
                            shm.ext.wasted_add(ExtShm::str_block_size(&xp))?;
                        }
                        let new_off = shm.ext.array_del::<ChangeSubShm>(
                            desc.change_subs_off[ds_idx],
                            desc.change_sub_count[ds_idx],
                            pos as u32,
                        )?;
                        shm.main.update_descriptor(mod_idx, |d| {
                            d.change_subs_off[ds_idx] = new_off;
                            d.change_sub_count[ds_idx] -= 1;
                        })?;
                        removed += 1;
                    }
                }
            }
        }

        loop {
            let desc = shm.main.read_descriptor(mod_idx)?;
            let records: Vec<OperSubShm> =
                shm.ext.array_get(desc.oper_subs_off, desc.oper_sub_count)?;
            match records.iter().position(|r| r.cid == cid) {
                None => break,
                Some(pos) => {
                    let record = records[pos];
                    let xp = shm.ext.read_str(record.xpath_off)?;
                    shm.ext.wasted_add(ExtShm::str_block_size(&xp))?;
                    let new_off = shm.ext.array_del::<OperSubShm>(
                        desc.oper_subs_off,
                        desc.oper_sub_count,
                        pos as u32,
                    )?;
                    shm.main.update_descriptor(mod_idx, |d| {
                        d.oper_subs_off = new_off;
                        d.oper_sub_count -= 1;
                    })?;
                    removed += 1;
                }
            }
        }

        loop {
            let desc = shm.main.read_descriptor(mod_idx)?;
            let records: Vec<NotifSubShm> =
                shm.ext.array_get(desc.notif_subs_off, desc.notif_sub_count)?;
            match records.iter().position(|r| r.cid == cid) {
                None => break,
                Some(pos) => {
                    if let Some(xp) = shm.ext.read_opt_str(records[pos].xpath_off)? {
                        shm.ext.wasted_add(ExtShm::str_block_size(&xp))?;
                    }
                    let new_off = shm.ext.array_del::<NotifSubShm>(
                        desc.notif_subs_off,
                        desc.notif_sub_count,
                        pos as u32,
                    )?;
                    shm.main.update_descriptor(mod_idx, |d| {
                        d.notif_subs_off = new_off;
                        d.notif_sub_count -= 1;
                    })?;
                    removed += 1;
                }
            }
        }
    }

    loop {
        let header = shm.main.read_header()?;
        let records: Vec<RpcSubShm> = shm.ext.array_get(header.rpc_subs_off, header.rpc_sub_count)?;
        match records.iter().position(|r| r.cid == cid) {
            None => break,
            Some(pos) => {
                let path = shm.ext.read_str(records[pos].path_off)?;
                shm.ext.wasted_add(ExtShm::str_block_size(&path))?;
                let new_off = shm.ext.array_del::<RpcSubShm>(
                    header.rpc_subs_off,
                    header.rpc_sub_count,
                    pos as u32,
                )?;
                shm.main.update_header(|h| {
                    h.rpc_subs_off = new_off;
                    h.rpc_sub_count -= 1;
                })?;
                removed += 1;
            }
        }
    }

    if removed > 0 {
        debug!(target: "yangstore::subscr", "removed {} subscriptions of dead cid {}", removed, cid);
    }
    Ok(removed)
}

// ----- event pipes -----

/// Create the FIFO for event pipe `num`. Safe to call when it exists.
pub fn evpipe_create(cfg: &Config, num: u32) -> StoreResult<PathBuf> {
    let path = cfg.evpipe_path(num);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::sys(format!("failed to create {:?}", parent), e))?;
    }
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
        StoreError::new(ErrorKind::InvalArg, format!("event pipe path {:?} contains NUL", path))
    })?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(StoreError::sys(format!("failed to mkfifo {:?}", path), err));
        }
    }
    Ok(path)
}

/// Notify a subscriber by writing one byte into its event pipe. Fails with
/// `CallbackFailed` when nobody has the read end open.
pub fn evpipe_notify(path: &Path) -> StoreResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| {
            StoreError::new(
                ErrorKind::CallbackFailed,
                format!("no subscriber listening on {:?}: {}", path, e),
            )
        })?;
    file.write_all(&[1u8])
        .map_err(|e| StoreError::sys(format!("failed to ring {:?}", path), e))?;
    Ok(())
}

pub fn evpipe_remove(cfg: &Config, num: u32) {
    let _ = std::fs::remove_file(cfg.evpipe_path(num));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::install_module;
    use crate::schema::{ModuleDef, ModuleSchema, NodeSchema, SchemaNodeKind};
    use tempfile::TempDir;

    fn open_ctx(temp: &TempDir) -> ShmCtx {
        let (ctx, _) = ShmCtx::open(
            &temp.path().join("s_main"),
            &temp.path().join("s_ext"),
            &temp.path().join("s_create.lock"),
        )
        .unwrap();
        ctx
    }

    fn install_one(ctx: &ShmCtx, name: &str) -> u32 {
        let def = ModuleDef::new(
            ModuleSchema::new(name, None).with_node(NodeSchema::new("/root", SchemaNodeKind::Container)),
        );
        install_module(ctx, &def).unwrap()
    }

    #[test]
    fn test_change_sub_add_read_del() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let idx = install_one(&ctx, "m1");

        change_sub_add(&ctx, idx, 1, Some("/m1:root/a"), 10, 0, 5, 42).unwrap();
        change_sub_add(&ctx, idx, 1, None, 0, SUB_PASSIVE, 6, 42).unwrap();

        let subs = change_subs(&ctx, idx, 1).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].xpath.as_deref(), Some("/m1:root/a"));
        assert!(!subs[0].is_passive());
        assert!(subs[1].is_passive());
        assert!(subs[1].xpath.is_none());
        // Other datastore tables are untouched.
        assert!(change_subs(&ctx, idx, 0).unwrap().is_empty());

        change_sub_del(&ctx, idx, 1, 5).unwrap();
        let subs = change_subs(&ctx, idx, 1).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].evpipe, 6);
    }

    #[test]
    fn test_oper_subs_ordered_by_depth() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let idx = install_one(&ctx, "m1");

        oper_sub_add(&ctx, idx, "/m1:root/a/b/c", OperSubKind::State, 0, 1, 1).unwrap();
        oper_sub_add(&ctx, idx, "/m1:root", OperSubKind::State, 0, 2, 1).unwrap();
        oper_sub_add(&ctx, idx, "/m1:root/a", OperSubKind::Mixed, SUB_OPER_MERGE, 3, 1).unwrap();

        let subs = oper_subs(&ctx, idx).unwrap();
        let depths: Vec<usize> = subs
            .iter()
            .map(|s| XPath::parse(&s.xpath).unwrap().depth())
            .collect();
        assert_eq!(depths, vec![1, 2, 4]);
        assert!(subs[1].is_merge());
        assert_eq!(subs[1].kind, OperSubKind::Mixed);
    }

    #[test]
    fn test_notif_sub_suspend() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let idx = install_one(&ctx, "m1");

        notif_sub_add(&ctx, idx, None, 100, 7, 3).unwrap();
        assert!(!notif_subs(&ctx, idx).unwrap()[0].suspended);

        notif_sub_suspend(&ctx, idx, 100, true).unwrap();
        assert!(notif_subs(&ctx, idx).unwrap()[0].suspended);

        notif_sub_suspend(&ctx, idx, 100, false).unwrap();
        assert!(!notif_subs(&ctx, idx).unwrap()[0].suspended);
    }

    #[test]
    fn test_remove_conn_subs_spans_all_tables() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let m1 = install_one(&ctx, "m1");
        let m2 = install_one(&ctx, "m2");

        change_sub_add(&ctx, m1, 0, Some("/m1:root"), 0, 0, 1, 7).unwrap();
        change_sub_add(&ctx, m1, 1, None, 0, 0, 2, 8).unwrap();
        oper_sub_add(&ctx, m2, "/m2:root/x", OperSubKind::State, 0, 3, 7).unwrap();
        notif_sub_add(&ctx, m2, None, 50, 4, 7).unwrap();
        rpc_sub_add(&ctx, "/m1:do-thing", 5, 60, 5, 7).unwrap();

        let removed = remove_conn_subs(&ctx, 7).unwrap();
        assert_eq!(removed, 4);

        assert!(change_subs(&ctx, m1, 0).unwrap().is_empty());
        // cid 8's subscription survives.
        assert_eq!(change_subs(&ctx, m1, 1).unwrap().len(), 1);
        assert!(oper_subs(&ctx, m2).unwrap().is_empty());
        assert!(notif_subs(&ctx, m2).unwrap().is_empty());
        assert!(rpc_subs(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_evpipe_create_and_notify() {
        let temp = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.repository.path = temp.path().to_path_buf();

        let path = evpipe_create(&cfg, 9).unwrap();
        // Creating again is fine.
        evpipe_create(&cfg, 9).unwrap();

        // Nobody listening yet.
        let err = evpipe_notify(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackFailed);

        // Open the read end, then the ring succeeds.
        let reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();
        evpipe_notify(&path).unwrap();
        drop(reader);

        evpipe_remove(&cfg, 9);
        assert!(!path.exists());
    }
}
