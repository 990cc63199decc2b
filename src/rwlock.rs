/// Lock Primitives
///
/// Process-shared read/write locks over fixed-layout records inside the Main
/// SHM, plus the advisory file locks used for one-time SHM creation and
/// per-connection liveness detection.
///
/// The lock record serializes its transitions through a spin word (the
/// "mutex"); waiting is trylock plus a bounded sleep against the caller's
/// absolute deadline. Three modes: READ, READ-UPGRADEABLE (at most one such
/// holder, allowed to upgrade to WRITE without releasing), and WRITE.
/// Deadline expiry fails with `Timeout` and leaves no side effects. Reader
/// connection ids are recorded in the lock record so crash recovery can
/// release locks held by dead connections.
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::shm::{MainShm, MAX_READ_HOLDERS};

/// Requested lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    ReadUpgr,
    Write,
}

// Field offsets within a LockState record.
const L_MUTEX: usize = 0;
const L_READERS: usize = 4;
const L_WRITER: usize = 8;
const L_UPGR: usize = 12;
const L_RCIDS: usize = 16;

/// Sleep between admission attempts.
const SPIN_SLEEP: Duration = Duration::from_micros(200);

/// Bound on spin-word acquisition during unlock paths, where no caller
/// deadline exists.
const UNLOCK_BOUND: Duration = Duration::from_secs(5);

/// Handle to one RW lock record living at `off` inside the Main SHM.
pub struct ShmRwLock<'a> {
    shm: &'a MainShm,
    off: usize,
}

impl<'a> ShmRwLock<'a> {
    pub fn at(shm: &'a MainShm, off: usize) -> ShmRwLock<'a> {
        ShmRwLock { shm, off }
    }

    fn mutex_lock(&self, deadline: Instant) -> StoreResult<()> {
        loop {
            if self.shm.lock_atomic_cas(self.off + L_MUTEX, 0, 1)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::new(
                    ErrorKind::Timeout,
                    "timed out waiting for lock word",
                ));
            }
            std::thread::sleep(SPIN_SLEEP);
        }
    }

    fn mutex_unlock(&self) {
        let _ = self.shm.lock_atomic_store(self.off + L_MUTEX, 0);
    }

    fn load(&self, field: usize) -> StoreResult<u32> {
        self.shm.lock_atomic_load(self.off + field)
    }

    fn store(&self, field: usize, val: u32) -> StoreResult<()> {
        self.shm.lock_atomic_store(self.off + field, val)
    }

    fn rcid_slot(&self, want: u32) -> StoreResult<Option<usize>> {
        for i in 0..MAX_READ_HOLDERS {
            if self.load(L_RCIDS + i * 4)? == want {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Acquire the lock in `mode` for connection `cid`, waiting no longer
    /// than `deadline`.
    pub fn lock(&self, mode: LockMode, cid: u32, deadline: Instant) -> StoreResult<()> {
        loop {
            self.mutex_lock(deadline)?;

            let writer = self.load(L_WRITER)?;
            let readers = self.load(L_READERS)?;
            let upgr = self.load(L_UPGR)?;

            let admitted = match mode {
                LockMode::Read => writer == 0,
                LockMode::ReadUpgr => writer == 0 && upgr == 0,
                LockMode::Write => writer == 0 && readers == 0,
            };

            if admitted {
                let result = self.admit(mode, cid, readers);
                self.mutex_unlock();
                return result;
            }

            self.mutex_unlock();
            if Instant::now() >= deadline {
                return Err(StoreError::new(
                    ErrorKind::Timeout,
                    format!("lock acquisition timed out (mode {:?}, cid {})", mode, cid),
                ));
            }
            std::thread::sleep(SPIN_SLEEP);
        }
    }

    fn admit(&self, mode: LockMode, cid: u32, readers: u32) -> StoreResult<()> {
        match mode {
            LockMode::Read | LockMode::ReadUpgr => {
                let slot = self.rcid_slot(0)?.ok_or_else(|| {
                    StoreError::new(ErrorKind::Internal, "lock reader table is full")
                })?;
                self.store(L_RCIDS + slot * 4, cid)?;
                self.store(L_READERS, readers + 1)?;
                if mode == LockMode::ReadUpgr {
                    self.store(L_UPGR, cid)?;
                }
            }
            LockMode::Write => {
                self.store(L_WRITER, cid)?;
            }
        }
        Ok(())
    }

    /// Release a lock previously acquired in `mode` by `cid`.
    pub fn unlock(&self, mode: LockMode, cid: u32) {
        let deadline = Instant::now() + UNLOCK_BOUND;
        if self.mutex_lock(deadline).is_err() {
            warn!(target: "yangstore::lock", "unlock spin bound exceeded (cid {})", cid);
            return;
        }
        let result = self.release(mode, cid);
        self.mutex_unlock();
        if let Err(e) = result {
            warn!(target: "yangstore::lock", "unlock failed: {}", e);
        }
    }

    fn release(&self, mode: LockMode, cid: u32) -> StoreResult<()> {
        match mode {
            LockMode::Read | LockMode::ReadUpgr => {
                if let Some(slot) = self.rcid_slot(cid)? {
                    self.store(L_RCIDS + slot * 4, 0)?;
                }
                let readers = self.load(L_READERS)?;
                self.store(L_READERS, readers.saturating_sub(1))?;
                if mode == LockMode::ReadUpgr && self.load(L_UPGR)? == cid {
                    self.store(L_UPGR, 0)?;
                }
            }
            LockMode::Write => {
                if self.load(L_WRITER)? == cid {
                    self.store(L_WRITER, 0)?;
                }
            }
        }
        Ok(())
    }

    /// Upgrade a READ-UPGRADEABLE hold to WRITE: waits until this connection
    /// is the only reader, then swaps the reader slot for the writer slot.
    /// The upgradeable claim is kept so `downgrade` can restore it.
    pub fn upgrade(&self, cid: u32, deadline: Instant) -> StoreResult<()> {
        loop {
            self.mutex_lock(deadline)?;

            let slot = self.rcid_slot(cid)?;
            let sole_reader = self.load(L_UPGR)? == cid
                && self.load(L_WRITER)? == 0
                && self.load(L_READERS)? == 1;
            if let (true, Some(slot)) = (sole_reader, slot) {
                self.store(L_RCIDS + slot * 4, 0)?;
                self.store(L_READERS, 0)?;
                self.store(L_WRITER, cid)?;
                self.mutex_unlock();
                return Ok(());
            }

            self.mutex_unlock();
            if Instant::now() >= deadline {
                return Err(StoreError::new(
                    ErrorKind::Timeout,
                    format!("lock upgrade timed out (cid {})", cid),
                ));
            }
            std::thread::sleep(SPIN_SLEEP);
        }
    }

    /// Downgrade a WRITE hold (obtained through `upgrade`) back to
    /// READ-UPGRADEABLE.
    pub fn downgrade(&self, cid: u32) {
        let deadline = Instant::now() + UNLOCK_BOUND;
        if self.mutex_lock(deadline).is_err() {
            warn!(target: "yangstore::lock", "downgrade spin bound exceeded (cid {})", cid);
            return;
        }
        let result = (|| -> StoreResult<()> {
            if self.load(L_WRITER)? == cid {
                self.store(L_WRITER, 0)?;
                if let Some(slot) = self.rcid_slot(0)? {
                    self.store(L_RCIDS + slot * 4, cid)?;
                    let readers = self.load(L_READERS)?;
                    self.store(L_READERS, readers + 1)?;
                }
                self.store(L_UPGR, cid)?;
            }
            Ok(())
        })();
        self.mutex_unlock();
        if let Err(e) = result {
            warn!(target: "yangstore::lock", "downgrade failed: {}", e);
        }
    }

    /// Recovery: strip every hold of connection `cid` from this record.
    /// Returns whether anything was released.
    pub fn force_release_conn(&self, cid: u32) -> bool {
        let deadline = Instant::now() + UNLOCK_BOUND;
        if self.mutex_lock(deadline).is_err() {
            return false;
        }
        let mut changed = false;
        let result = (|| -> StoreResult<()> {
            if self.load(L_WRITER)? == cid {
                self.store(L_WRITER, 0)?;
                changed = true;
            }
            if self.load(L_UPGR)? == cid {
                self.store(L_UPGR, 0)?;
                changed = true;
            }
            for i in 0..MAX_READ_HOLDERS {
                if self.load(L_RCIDS + i * 4)? == cid {
                    self.store(L_RCIDS + i * 4, 0)?;
                    let readers = self.load(L_READERS)?;
                    self.store(L_READERS, readers.saturating_sub(1))?;
                    changed = true;
                }
            }
            Ok(())
        })();
        self.mutex_unlock();
        if let Err(e) = result {
            warn!(target: "yangstore::lock", "force release failed: {}", e);
        }
        changed
    }
}

/// Advisory exclusive file lock, released on drop. Serializes one-time SHM
/// creation.
pub struct FileLockGuard {
    file: File,
}

impl FileLockGuard {
    pub fn lock_exclusive(path: &Path) -> StoreResult<FileLockGuard> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::sys(format!("failed to create {:?}", parent), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::sys(format!("failed to open lock file {:?}", path), e))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(StoreError::sys(
                format!("failed to flock {:?}", path),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(FileLockGuard { file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Per-connection liveness lock file: created and flock'd for the lifetime
/// of the connection. Other connections probe it with a non-blocking flock;
/// success means the owner is gone.
pub struct ConnLockFile {
    path: PathBuf,
    file: File,
}

impl ConnLockFile {
    pub fn acquire(path: &Path) -> StoreResult<ConnLockFile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::sys(format!("failed to create {:?}", parent), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::sys(format!("failed to open conn lock {:?}", path), e))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(StoreError::new(
                ErrorKind::Internal,
                format!("connection lock {:?} is already held", path),
            ));
        }
        Ok(ConnLockFile {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Probe whether the connection owning `path` is still alive.
    pub fn is_alive(path: &Path) -> bool {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            // No lock file: the connection is gone (or never registered).
            Err(_) => return false,
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
            return false;
        }
        true
    }

    /// Force-drop the lock file of a dead connection.
    pub fn remove_stale(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

impl Drop for ConnLockFile {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{ShmCtx, OFF_SHM_LOCK};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_ctx(temp: &TempDir) -> Arc<ShmCtx> {
        let (ctx, _) = ShmCtx::open(
            &temp.path().join("l_main"),
            &temp.path().join("l_ext"),
            &temp.path().join("l_create.lock"),
        )
        .unwrap();
        Arc::new(ctx)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_read_write_exclusion() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let lock = ShmRwLock::at(&ctx.main, OFF_SHM_LOCK);

        lock.lock(LockMode::Read, 1, far_deadline()).unwrap();
        lock.lock(LockMode::Read, 2, far_deadline()).unwrap();

        // A writer cannot get in while readers hold the lock.
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = lock.lock(LockMode::Write, 3, deadline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        lock.unlock(LockMode::Read, 1);
        lock.unlock(LockMode::Read, 2);
        lock.lock(LockMode::Write, 3, far_deadline()).unwrap();

        // And readers cannot get in while the writer holds it.
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(lock.lock(LockMode::Read, 4, deadline).is_err());
        lock.unlock(LockMode::Write, 3);
    }

    #[test]
    fn test_single_upgradeable_reader() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let lock = ShmRwLock::at(&ctx.main, OFF_SHM_LOCK);

        lock.lock(LockMode::ReadUpgr, 1, far_deadline()).unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(lock.lock(LockMode::ReadUpgr, 2, deadline).is_err());
        // Plain readers are still admitted.
        lock.lock(LockMode::Read, 3, far_deadline()).unwrap();
        lock.unlock(LockMode::Read, 3);
        lock.unlock(LockMode::ReadUpgr, 1);
    }

    #[test]
    fn test_upgrade_waits_for_readers_then_downgrade() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let lock = ShmRwLock::at(&ctx.main, OFF_SHM_LOCK);

        lock.lock(LockMode::ReadUpgr, 1, far_deadline()).unwrap();
        lock.lock(LockMode::Read, 2, far_deadline()).unwrap();

        // Cannot upgrade while another reader is present.
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(lock.upgrade(1, deadline).is_err());

        lock.unlock(LockMode::Read, 2);
        lock.upgrade(1, far_deadline()).unwrap();

        // Exclusive now.
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(lock.lock(LockMode::Read, 3, deadline).is_err());

        lock.downgrade(1);
        lock.lock(LockMode::Read, 3, far_deadline()).unwrap();
        lock.unlock(LockMode::Read, 3);
        lock.unlock(LockMode::ReadUpgr, 1);
    }

    #[test]
    fn test_timeout_leaves_no_side_effects() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let lock = ShmRwLock::at(&ctx.main, OFF_SHM_LOCK);

        lock.lock(LockMode::Write, 1, far_deadline()).unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert!(lock.lock(LockMode::Read, 2, deadline).is_err());
        lock.unlock(LockMode::Write, 1);

        let state = ctx.main.read_lock_state(OFF_SHM_LOCK).unwrap();
        assert_eq!(state.readers, 0);
        assert_eq!(state.writer_cid, 0);
        assert!(state.rcids.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_force_release_conn() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let lock = ShmRwLock::at(&ctx.main, OFF_SHM_LOCK);

        lock.lock(LockMode::Read, 7, far_deadline()).unwrap();
        assert!(lock.force_release_conn(7));
        // Writer can proceed immediately.
        lock.lock(LockMode::Write, 8, far_deadline()).unwrap();
        lock.unlock(LockMode::Write, 8);
        assert!(!lock.force_release_conn(7));
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);

        let mut handles = Vec::new();
        for cid in 1..=4u32 {
            let ctx = Arc::clone(&ctx);
            handles.push(std::thread::spawn(move || {
                let lock = ShmRwLock::at(&ctx.main, OFF_SHM_LOCK);
                for _ in 0..25 {
                    lock.lock(LockMode::Write, cid, Instant::now() + Duration::from_secs(10))
                        .unwrap();
                    lock.unlock(LockMode::Write, cid);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let state = ctx.main.read_lock_state(OFF_SHM_LOCK).unwrap();
        assert_eq!(state.writer_cid, 0);
        assert_eq!(state.readers, 0);
    }

    #[test]
    fn test_conn_lock_file_liveness() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conn_7.lock");

        assert!(!ConnLockFile::is_alive(&path));
        let guard = ConnLockFile::acquire(&path).unwrap();
        assert!(ConnLockFile::is_alive(&path));
        drop(guard);
        assert!(!ConnLockFile::is_alive(&path));
    }
}
