/// Datastore Loader & Writer
///
/// File layout per installed module: a durable startup file under the
/// repository, plus running/candidate/operational files in the SHM directory
/// named with the connection's prefix. The operational file stores a diff
/// overlay rather than a data tree. All writes are create-temp + rename so
/// concurrent readers always open a committed image.
///
/// The loader materializes module data into a module-info set: from the
/// running cache when enabled and fresh, from the persisted files otherwise.
/// Operational requests hand off to the composer after the base data is
/// assembled. The writer persists every changed module, bumps the
/// descriptor version for running writes, refreshes the cache, and re-bases
/// the stored operational overlay when running moved underneath it.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::modinfo::{DepKind, ModInfo};
use crate::tree::{OriginAware, Tree};
use crate::xpath::XPath;

/// The four datastores of an installed module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datastore {
    Startup,
    Running,
    Candidate,
    Operational,
}

impl Datastore {
    pub fn index(self) -> usize {
        match self {
            Datastore::Startup => 0,
            Datastore::Running => 1,
            Datastore::Candidate => 2,
            Datastore::Operational => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Datastore::Startup => "startup",
            Datastore::Running => "running",
            Datastore::Candidate => "candidate",
            Datastore::Operational => "operational",
        }
    }

    /// Conventional datastores hold configuration and take part in commit
    /// diffs; operational is a composed view.
    pub fn is_conventional(self) -> bool {
        !matches!(self, Datastore::Operational)
    }
}

/// Options steering the loader and the operational composer.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOpts {
    /// Drop config-false subtrees after composition.
    pub no_state: bool,
    /// Drop config-true leaves with no descendants after composition.
    pub no_config: bool,
    /// Bypass the stored operational overlay.
    pub no_stored: bool,
    /// Bypass provider callouts.
    pub no_subs: bool,
    /// Preserve and stamp origin metadata.
    pub with_origin: bool,
}

/// Parameters threaded into operational composition.
pub struct OperParams<'a> {
    pub request_xpath: Option<&'a XPath>,
    pub sid: u32,
    pub timeout: Duration,
}

// ----- file paths -----

pub fn startup_path(cfg: &Config, module: &str) -> PathBuf {
    cfg.data_dir().join(format!("{}.startup", module))
}

pub fn shm_ds_path(cfg: &Config, prefix: &str, module: &str, ds: Datastore) -> PathBuf {
    cfg.shm.dir.join(format!("{}_{}.{}", prefix, module, ds.as_str()))
}

fn ds_path(cfg: &Config, prefix: &str, module: &str, ds: Datastore) -> PathBuf {
    match ds {
        Datastore::Startup => startup_path(cfg, module),
        other => shm_ds_path(cfg, prefix, module, other),
    }
}

// ----- low-level file IO -----

fn read_tree_file(path: &Path) -> StoreResult<Option<Tree>> {
    match std::fs::read(path) {
        Ok(bytes) => Tree::from_bytes(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::sys(format!("failed to read {:?}", path), e)),
    }
}

/// Atomic write: create-temp in the target directory, then rename over.
fn write_tree_file(path: &Path, tree: &Tree) -> StoreResult<()> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::new(ErrorKind::Internal, format!("datastore path {:?} has no parent", path))
    })?;
    std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::sys(format!("failed to create {:?}", parent), e))?;

    let tmp = parent.join(format!(
        ".{}.tmp{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("ds"),
        std::process::id()
    ));
    std::fs::write(&tmp, tree.to_bytes()?)
        .map_err(|e| StoreError::sys(format!("failed to write {:?}", tmp), e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StoreError::sys(format!("failed to rename {:?} into place", tmp), e)
    })?;
    Ok(())
}

/// Create the startup file at install time.
pub fn init_module_files(cfg: &Config, module: &str, initial: Option<Tree>) -> StoreResult<()> {
    let path = startup_path(cfg, module);
    if path.exists() {
        return Ok(());
    }
    write_tree_file(&path, &initial.unwrap_or_default())
}

/// Remove every datastore file of a module (uninstall).
pub fn remove_module_files(cfg: &Config, prefix: &str, module: &str) {
    for ds in [
        Datastore::Startup,
        Datastore::Running,
        Datastore::Candidate,
        Datastore::Operational,
    ] {
        let _ = std::fs::remove_file(ds_path(cfg, prefix, module, ds));
    }
}

/// Load one module's data for one datastore. Running is recreated from
/// startup on first access; candidate falls back to running while its file
/// does not exist; operational returns the stored overlay diff.
pub fn load_module_file(cfg: &Config, prefix: &str, module: &str, ds: Datastore) -> StoreResult<Tree> {
    match ds {
        Datastore::Startup => Ok(read_tree_file(&startup_path(cfg, module))?.unwrap_or_default()),
        Datastore::Running => {
            let path = shm_ds_path(cfg, prefix, module, Datastore::Running);
            if let Some(tree) = read_tree_file(&path)? {
                return Ok(tree);
            }
            // First access: materialize running from startup.
            let tree = read_tree_file(&startup_path(cfg, module))?.unwrap_or_default();
            if let Err(e) = write_tree_file(&path, &tree) {
                warn!(target: "yangstore::store", "failed to materialize running for '{}': {}", module, e);
            }
            Ok(tree)
        }
        Datastore::Candidate => {
            let path = shm_ds_path(cfg, prefix, module, Datastore::Candidate);
            match read_tree_file(&path)? {
                Some(tree) => Ok(tree),
                None => load_module_file(cfg, prefix, module, Datastore::Running),
            }
        }
        Datastore::Operational => {
            let path = shm_ds_path(cfg, prefix, module, Datastore::Operational);
            Ok(read_tree_file(&path)?.unwrap_or_default())
        }
    }
}

/// Persist one module's subtree for a conventional datastore.
pub fn write_module_file(
    cfg: &Config,
    prefix: &str,
    module: &str,
    ds: Datastore,
    tree: &Tree,
) -> StoreResult<()> {
    write_tree_file(&ds_path(cfg, prefix, module, ds), tree)
}

/// Discard the candidate overlay: unlink the candidate file carrying the
/// current prefix. A stale file under a different prefix is left untouched.
pub fn candidate_reset(cfg: &Config, prefix: &str, module: &str) -> StoreResult<()> {
    let path = shm_ds_path(cfg, prefix, module, Datastore::Candidate);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::sys(format!("failed to unlink {:?}", path), e)),
    }
}

// ----- permissions -----

/// Effective-permission probe against the module's startup file. Missing
/// files are treated as accessible (the module was installed without data).
pub fn access_check(cfg: &Config, module: &str, write: bool) -> StoreResult<bool> {
    let path = startup_path(cfg, module);
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| StoreError::new(ErrorKind::InvalArg, "startup path contains NUL"))?;
    let mode = if write { libc::W_OK } else { libc::R_OK };
    let rc = unsafe { libc::faccessat(libc::AT_FDCWD, cpath.as_ptr(), mode, libc::AT_EACCESS) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => Ok(false),
        Some(libc::ENOENT) => Ok(true),
        _ => Err(StoreError::sys(format!("access check on {:?} failed", path), err)),
    }
}

/// Adjust ownership/permissions of a module's startup file. Both `EACCES`
/// and `EPERM` classify as `Unauthorized`.
pub fn set_module_access(
    cfg: &Config,
    module: &str,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
) -> StoreResult<()> {
    let path = startup_path(cfg, module);
    let classify = |err: std::io::Error, what: &str| -> StoreError {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => StoreError::new(
                ErrorKind::Unauthorized,
                format!("{} of {:?} denied: {}", what, path, err),
            ),
            _ => StoreError::sys(format!("{} of {:?} failed", what, path), err),
        }
    };

    if let Some(mode) = mode {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| classify(e, "chmod"))?;
        }
    }
    if uid.is_some() || gid.is_some() {
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| StoreError::new(ErrorKind::InvalArg, "startup path contains NUL"))?;
        let rc = unsafe {
            libc::chown(
                cpath.as_ptr(),
                uid.unwrap_or(u32::MAX),
                gid.unwrap_or(u32::MAX),
            )
        };
        if rc != 0 {
            return Err(classify(std::io::Error::last_os_error(), "chown"));
        }
    }
    Ok(())
}

// ----- module-info loader -----

/// Materialize data for every module in the module-info set: cache-first
/// for running, persisted files otherwise, and operational composition for
/// the operational datastore.
pub fn load_modinfo(
    minfo: &mut ModInfo<'_>,
    opts: &GetOpts,
    read_only: bool,
    oper: Option<&OperParams<'_>>,
) -> StoreResult<()> {
    let conn = minfo.conn;
    let cfg = conn.config();
    let prefix = conn.prefix();
    let primary = minfo.ds;
    let uses_running = primary == Datastore::Running || minfo.ds2 == Some(Datastore::Running);

    let mut all_cached = read_only && primary == Datastore::Running && conn.cache.enabled();

    for i in 0..minfo.entries.len() {
        if minfo.entries[i].data_loaded {
            continue;
        }
        let name = minfo.entries[i].name.clone();
        let idx = minfo.entries[i].idx;

        if primary == Datastore::Operational {
            // The composer assembles operational data per module; dependency
            // modules only need their running data for validation context.
            if minfo.entries[i].kind != DepKind::Req {
                let running = running_tree(minfo, &name, idx)?;
                minfo.data.attach(running);
            } else {
                let running = running_tree(minfo, &name, idx)?;
                let composed = crate::oper::compose_module_base(minfo.conn, idx, &name, running, opts)?;
                minfo.data.attach(composed);
            }
            minfo.entries[i].data_loaded = true;
            all_cached = false;
            continue;
        }

        if uses_running && conn.cache.enabled() && primary == Datastore::Running {
            let ver = conn.shm.main.ver(idx)?;
            let cached = conn.cache.ensure(&name, ver, None, || {
                load_module_file(cfg, prefix, &name, Datastore::Running)
            })?;
            if read_only {
                minfo.cached.push((name.clone(), cached));
            } else {
                minfo.data.attach((*cached).clone());
            }
        } else {
            let tree = load_module_file(cfg, prefix, &name, primary)?;
            minfo.data.attach(tree);
            all_cached = false;
        }
        minfo.entries[i].data_loaded = true;
    }

    minfo.data_cached = all_cached && !minfo.cached.is_empty();

    if primary == Datastore::Operational {
        if let Some(params) = oper {
            if !opts.no_subs {
                crate::oper::provider_callouts(minfo, params)?;
            }
        }
        crate::oper::finish_composition(minfo, opts);
    }
    Ok(())
}

fn running_tree(minfo: &ModInfo<'_>, name: &str, idx: u32) -> StoreResult<Tree> {
    let conn = minfo.conn;
    let cfg = conn.config();
    let prefix = conn.prefix();
    if conn.cache.enabled() {
        let ver = conn.shm.main.ver(idx)?;
        let cached = conn.cache.ensure(name, ver, None, || {
            load_module_file(cfg, prefix, name, Datastore::Running)
        })?;
        Ok((*cached).clone())
    } else {
        load_module_file(cfg, prefix, name, Datastore::Running)
    }
}

// ----- module-info writer -----

/// Persist every changed module of the set. Conventional stores write the
/// data subtree, bump the version, refresh the cache, and re-base the stored
/// operational overlay; the operational store merges the diff into the
/// overlay with origin-aware semantics.
pub fn store_modinfo(minfo: &mut ModInfo<'_>, owner_cid: Option<u32>) -> StoreResult<()> {
    let conn = minfo.conn;
    let cfg = conn.config().clone();
    let prefix = conn.prefix().to_string();

    for i in 0..minfo.entries.len() {
        if !minfo.entries[i].changed {
            continue;
        }
        let name = minfo.entries[i].name.clone();
        let idx = minfo.entries[i].idx;

        if minfo.ds == Datastore::Operational {
            let mut diff_part = minfo.diff.module_data(&name);
            if let Some(cid) = owner_cid {
                stamp_owner(&mut diff_part, cid);
            }
            let mut stored =
                load_module_file(&cfg, &prefix, &name, Datastore::Operational)?;
            Tree::diff_merge(&mut stored, diff_part, &OriginAware);
            write_module_file(&cfg, &prefix, &name, Datastore::Operational, &stored)?;
            debug!(target: "yangstore::store", "stored operational overlay for '{}'", name);
            continue;
        }

        // Detach, persist, reattach.
        let module_data = minfo.data.take_module(&name);
        let result = write_module_file(&cfg, &prefix, &name, minfo.ds, &module_data);
        if let Err(e) = result {
            minfo.data.attach(module_data);
            warn!(target: "yangstore::store", "commit of '{}' failed mid-loop: {}", name, e);
            return Err(e.merge(StoreError::new(
                ErrorKind::Internal,
                format!("commit was partial; module '{}' and later modules were not persisted", name),
            )));
        }

        if minfo.ds == Datastore::Running {
            // Write first, then bump: readers observing the new version are
            // guaranteed to find the new file.
            let new_ver = conn.shm.main.bump_ver(idx)?;
            conn.cache.refresh(&name, module_data.clone(), new_ver);

            // Running moved: parts of the stored operational overlay may no
            // longer apply.
            let mut overlay = load_module_file(&cfg, &prefix, &name, Datastore::Operational)?;
            if !overlay.is_empty() {
                Tree::diff_mod_update(&mut overlay, &module_data);
                write_module_file(&cfg, &prefix, &name, Datastore::Operational, &overlay)?;
            }
            info!(target: "yangstore::store", "running write of '{}' at ver {}", name, new_ver);
        }
        minfo.data.attach(module_data);
    }
    Ok(())
}

fn stamp_owner(tree: &mut Tree, cid: u32) {
    fn rec(node: &mut crate::tree::Node, cid: u32) {
        node.owner_cid = Some(cid);
        for child in &mut node.children {
            rec(child, cid);
        }
    }
    for root in &mut tree.roots {
        rec(root, cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;
    use tempfile::TempDir;

    fn test_cfg(temp: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.repository.path = temp.path().join("repo");
        cfg.shm.dir = temp.path().join("shm");
        cfg
    }

    #[test]
    fn test_running_materialized_from_startup() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        let startup = Tree::with_root(Node::leaf("m1", "a", "1"));
        write_module_file(&cfg, "p", "m1", Datastore::Startup, &startup).unwrap();

        let running = load_module_file(&cfg, "p", "m1", Datastore::Running).unwrap();
        assert_eq!(running, startup);
        // The running file now exists on its own.
        assert!(shm_ds_path(&cfg, "p", "m1", Datastore::Running).exists());
    }

    #[test]
    fn test_candidate_falls_back_to_running() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        let running = Tree::with_root(Node::leaf("m1", "a", "run"));
        write_module_file(&cfg, "p", "m1", Datastore::Running, &running).unwrap();

        let cand = load_module_file(&cfg, "p", "m1", Datastore::Candidate).unwrap();
        assert_eq!(cand, running);

        // An explicit candidate write decouples it.
        let edited = Tree::with_root(Node::leaf("m1", "a", "cand"));
        write_module_file(&cfg, "p", "m1", Datastore::Candidate, &edited).unwrap();
        let cand = load_module_file(&cfg, "p", "m1", Datastore::Candidate).unwrap();
        assert_eq!(cand, edited);

        // Reset drops the overlay again.
        candidate_reset(&cfg, "p", "m1").unwrap();
        let cand = load_module_file(&cfg, "p", "m1", Datastore::Candidate).unwrap();
        assert_eq!(cand, running);
    }

    #[test]
    fn test_candidate_reset_leaves_other_prefixes() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        let other = Tree::with_root(Node::leaf("m1", "a", "other"));
        write_module_file(&cfg, "stale", "m1", Datastore::Candidate, &other).unwrap();

        candidate_reset(&cfg, "p", "m1").unwrap();
        assert!(shm_ds_path(&cfg, "stale", "m1", Datastore::Candidate).exists());
    }

    #[test]
    fn test_operational_defaults_to_empty_overlay() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);
        let overlay = load_module_file(&cfg, "p", "m1", Datastore::Operational).unwrap();
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_atomic_write_replaces_whole_image() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        let one = Tree::with_root(Node::leaf("m1", "a", "1"));
        write_module_file(&cfg, "p", "m1", Datastore::Startup, &one).unwrap();
        let two = Tree::with_root(Node::leaf("m1", "a", "2"));
        write_module_file(&cfg, "p", "m1", Datastore::Startup, &two).unwrap();

        let read = load_module_file(&cfg, "p", "m1", Datastore::Startup).unwrap();
        assert_eq!(read, two);
        // No temp droppings left behind.
        let entries: Vec<_> = std::fs::read_dir(cfg.data_dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_access_check_missing_file_allowed() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);
        assert!(access_check(&cfg, "ghost", false).unwrap());
        assert!(access_check(&cfg, "ghost", true).unwrap());
    }

    #[test]
    fn test_init_module_files_keeps_existing() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        let data = Tree::with_root(Node::leaf("m1", "a", "keep"));
        init_module_files(&cfg, "m1", Some(data.clone())).unwrap();
        // A second install attempt must not clobber the data.
        init_module_files(&cfg, "m1", None).unwrap();
        let read = load_module_file(&cfg, "p", "m1", Datastore::Startup).unwrap();
        assert_eq!(read, data);
    }
}
