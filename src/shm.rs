/// Shared Memory Arena
///
/// Two file-backed, process-shared regions. The Main SHM holds a fixed
/// header (version tag, global locks, id counters, table roots) followed by
/// a contiguous array of module descriptors. The Ext SHM is a heap of
/// 8-byte-aligned blocks reached only through offsets stored in Main SHM or
/// in other Ext SHM blocks; a `wasted` counter tracks bytes stranded by
/// array reallocation and deletion so unlock paths can trigger compaction.
///
/// Every process keeps its own mapping of each region behind a
/// `parking_lot::RwLock` (the remap lock): offset dereferences hold it for
/// READ, growth remaps under WRITE. Cross-process coordination runs over
/// atomics living inside the regions; the arena itself never blocks.
use bytemuck::{Pod, Zeroable};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ErrorKind, StoreError, StoreResult};

/// Version tag in the first four bytes of both regions. Bump on any layout
/// change; connections refuse to attach to an incompatible region.
pub const SHM_VERSION: u32 = 0x7953_0001;

/// All blocks are aligned to the platform pointer size.
pub const SHM_ALIGN: usize = 8;

/// Maximum reader connections tracked per lock record.
pub const MAX_READ_HOLDERS: usize = 10;

/// In-arena RW lock record, operated through atomics (see `rwlock`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LockState {
    /// Spin word serializing state transitions.
    pub mutex: u32,
    pub readers: u32,
    pub writer_cid: u32,
    pub upgr_cid: u32,
    /// Connection ids of current readers, 0 = free slot.
    pub rcids: [u32; MAX_READ_HOLDERS],
    pub _pad: [u32; 2],
}

pub const LOCK_STATE_SIZE: usize = 64;

/// Fixed header at the start of the Main SHM.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MainHeader {
    pub magic: u32,
    pub mod_count: u32,
    /// Global SHM lock: WRITE for any Ext SHM mutation.
    pub shm_lock: LockState,
    /// Serializes module install/uninstall/feature changes.
    pub schema_lock: LockState,
    pub next_cid: u32,
    pub next_sid: u32,
    pub next_sub_id: u32,
    pub next_evpipe: u32,
    pub rpc_subs_off: u64,
    pub conn_list_off: u64,
    pub rpc_sub_count: u32,
    pub conn_count: u32,
}

pub const OFF_MAGIC: usize = 0;
pub const OFF_MOD_COUNT: usize = 4;
pub const OFF_SHM_LOCK: usize = 8;
pub const OFF_SCHEMA_LOCK: usize = 72;
pub const OFF_NEXT_CID: usize = 136;
pub const OFF_NEXT_SID: usize = 140;
pub const OFF_NEXT_SUB_ID: usize = 144;
pub const OFF_NEXT_EVPIPE: usize = 148;
pub const OFF_RPC_SUBS: usize = 152;
pub const OFF_CONN_LIST: usize = 160;
pub const OFF_RPC_SUB_COUNT: usize = 168;
pub const OFF_CONN_COUNT: usize = 172;
pub const MAIN_HEADER_SIZE: usize = 176;

/// One installed module, addressed by index behind the Main SHM header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ModDescriptor {
    pub name_off: u64,
    pub rev_off: u64,
    pub features_off: u64,
    pub data_deps_off: u64,
    pub inv_deps_off: u64,
    pub op_deps_off: u64,
    /// Change-subscription tables, one per datastore.
    pub change_subs_off: [u64; 4],
    pub oper_subs_off: u64,
    pub notif_subs_off: u64,
    pub flags: u32,
    /// Monotonic data version, bumped after every successful running write.
    pub ver: u32,
    pub feature_count: u32,
    pub data_dep_count: u32,
    pub inv_dep_count: u32,
    pub op_dep_count: u32,
    pub change_sub_count: [u32; 4],
    pub oper_sub_count: u32,
    pub notif_sub_count: u32,
    /// Per-datastore data locks.
    pub data_locks: [LockState; 4],
}

pub const MOD_DESC_SIZE: usize = 400;
pub const MOD_DESC_OFF_VER: usize = 100;
pub const MOD_DESC_OFF_DATA_LOCKS: usize = 144;

/// Module descriptor flags.
pub const MOD_FLAG_REPLAY: u32 = 0x1;

/// Inter-module dependency entry stored in Ext SHM arrays.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DepEntryShm {
    pub target_off: u64,
    pub xpath_off: u64,
    /// 0 = REF, 1 = INSTID.
    pub tag: u32,
    pub _pad: u32,
}

pub const DEP_TAG_REF: u32 = 0;
pub const DEP_TAG_INSTID: u32 = 1;

/// Connection-list entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ConnEntryShm {
    pub cid: u32,
    pub pid: u32,
}

/// Change-subscription record (one table per module per datastore).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ChangeSubShm {
    /// 0 = whole-module subscription.
    pub xpath_off: u64,
    pub priority: u32,
    pub opts: u32,
    pub evpipe: u32,
    pub cid: u32,
}

/// Operational-subscription record, kept ordered by xpath depth.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OperSubShm {
    pub xpath_off: u64,
    /// 0 = STATE, 1 = CONFIG, 2 = MIXED.
    pub kind: u32,
    pub opts: u32,
    pub evpipe: u32,
    pub cid: u32,
    pub depth: u32,
    pub _pad: u32,
}

/// Notification-subscription record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct NotifSubShm {
    pub xpath_off: u64,
    pub sub_id: u32,
    pub evpipe: u32,
    pub cid: u32,
    pub suspended: u32,
}

/// RPC/action-subscription record (global table in the Main SHM header).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RpcSubShm {
    pub path_off: u64,
    pub priority: u32,
    pub sub_id: u32,
    pub evpipe: u32,
    pub cid: u32,
}

pub const fn align_up(n: usize) -> usize {
    (n + SHM_ALIGN - 1) & !(SHM_ALIGN - 1)
}

pub const fn mod_desc_off(idx: u32) -> usize {
    MAIN_HEADER_SIZE + idx as usize * MOD_DESC_SIZE
}

/// A mapped region with remap-on-growth.
#[derive(Debug)]
struct Region {
    file: File,
    map: RwLock<MmapMut>,
    path: PathBuf,
}

impl Region {
    fn open(path: &Path, min_len: usize) -> StoreResult<(Region, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::sys(format!("failed to open SHM {:?}", path), e))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::sys(format!("failed to stat SHM {:?}", path), e))?
            .len() as usize;
        let created = len < min_len;
        if created {
            file.set_len(min_len as u64)
                .map_err(|e| StoreError::sys(format!("failed to size SHM {:?}", path), e))?;
        }
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StoreError::sys(format!("failed to map SHM {:?}", path), e))?;
        Ok((
            Region {
                file,
                map: RwLock::new(map),
                path: path.to_path_buf(),
            },
            created,
        ))
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Authoritative region size: the file length, which another process
    /// may have grown past our mapping.
    fn file_len(&self) -> StoreResult<usize> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| StoreError::sys(format!("failed to stat SHM {:?}", self.path), e))?
            .len() as usize)
    }

    /// Remap when another process grew the file past our mapping.
    fn ensure_mapped(&self, needed: usize) -> StoreResult<()> {
        if self.map.read().len() >= needed {
            return Ok(());
        }
        let mut guard = self.map.write();
        if guard.len() >= needed {
            return Ok(());
        }
        let file_len = self
            .file
            .metadata()
            .map_err(|e| StoreError::sys(format!("failed to stat SHM {:?}", self.path), e))?
            .len() as usize;
        if file_len < needed {
            return Err(StoreError::new(
                ErrorKind::Internal,
                format!("SHM {:?} offset {} beyond file size {}", self.path, needed, file_len),
            ));
        }
        *guard = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| StoreError::sys(format!("failed to remap SHM {:?}", self.path), e))?;
        Ok(())
    }

    /// Grow the file to at least `new_len` and remap. Never shrinks: other
    /// processes may still have the larger size mapped.
    fn grow(&self, new_len: usize) -> StoreResult<()> {
        let mut guard = self.map.write();
        if guard.len() >= new_len {
            return Ok(());
        }
        let file_len = self.file_len()?;
        if file_len < new_len {
            self.file
                .set_len(new_len as u64)
                .map_err(|e| StoreError::sys(format!("failed to grow SHM {:?}", self.path), e))?;
        }
        *guard = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| StoreError::sys(format!("failed to remap SHM {:?}", self.path), e))?;
        Ok(())
    }

    fn read_bytes(&self, off: usize, len: usize) -> StoreResult<Vec<u8>> {
        self.ensure_mapped(off + len)?;
        let guard = self.map.read();
        Ok(guard[off..off + len].to_vec())
    }

    fn write_bytes(&self, off: usize, bytes: &[u8]) -> StoreResult<()> {
        self.ensure_mapped(off + bytes.len())?;
        let mut guard = self.map.write();
        guard[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_pod<T: Pod>(&self, off: usize) -> StoreResult<T> {
        let bytes = self.read_bytes(off, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn write_pod<T: Pod>(&self, off: usize, value: &T) -> StoreResult<()> {
        self.write_bytes(off, bytemuck::bytes_of(value))
    }

    /// Run `f` with an atomic view of the u32 at `off`. The remap lock is
    /// held for READ for the duration, so the mapping cannot move.
    fn with_atomic<R>(&self, off: usize, f: impl FnOnce(&AtomicU32) -> R) -> StoreResult<R> {
        debug_assert_eq!(off % 4, 0, "misaligned atomic access");
        self.ensure_mapped(off + 4)?;
        let guard = self.map.read();
        // The region is MAP_SHARED and the offset is 4-aligned; reading it
        // through an AtomicU32 is the defined way to share it with other
        // processes doing the same.
        let atomic = unsafe { &*(guard.as_ptr().add(off) as *const AtomicU32) };
        Ok(f(atomic))
    }

    fn atomic_load(&self, off: usize) -> StoreResult<u32> {
        self.with_atomic(off, |a| a.load(Ordering::SeqCst))
    }

    fn atomic_store(&self, off: usize, val: u32) -> StoreResult<()> {
        self.with_atomic(off, |a| a.store(val, Ordering::SeqCst))
    }

    fn atomic_fetch_add(&self, off: usize, val: u32) -> StoreResult<u32> {
        self.with_atomic(off, |a| a.fetch_add(val, Ordering::SeqCst))
    }

    fn atomic_cas(&self, off: usize, current: u32, new: u32) -> StoreResult<bool> {
        self.with_atomic(off, |a| {
            a.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }
}

/// The Main SHM region.
#[derive(Debug)]
pub struct MainShm {
    region: Region,
}

impl MainShm {
    pub fn open(path: &Path) -> StoreResult<(MainShm, bool)> {
        let (region, created) = Region::open(path, MAIN_HEADER_SIZE)?;
        let shm = MainShm { region };
        if created {
            let mut header = MainHeader::zeroed();
            header.magic = SHM_VERSION;
            header.next_cid = 1;
            header.next_sid = 1;
            header.next_sub_id = 1;
            header.next_evpipe = 1;
            shm.region.write_pod(0, &header)?;
        } else {
            let magic = shm.region.atomic_load(OFF_MAGIC)?;
            if magic != SHM_VERSION {
                return Err(StoreError::new(
                    ErrorKind::Unsupported,
                    format!(
                        "incompatible SHM version tag {:#x} (expected {:#x})",
                        magic, SHM_VERSION
                    ),
                ));
            }
        }
        Ok((shm, created))
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn mod_count(&self) -> StoreResult<u32> {
        self.region.atomic_load(OFF_MOD_COUNT)
    }

    pub fn set_mod_count(&self, count: u32) -> StoreResult<()> {
        self.region.atomic_store(OFF_MOD_COUNT, count)
    }

    /// Allocate a fresh id from one of the header counters.
    pub fn next_id(&self, counter_off: usize) -> StoreResult<u32> {
        self.region.atomic_fetch_add(counter_off, 1)
    }

    pub fn read_header(&self) -> StoreResult<MainHeader> {
        self.region.read_pod(0)
    }

    pub fn update_header(&self, f: impl FnOnce(&mut MainHeader)) -> StoreResult<()> {
        let mut header: MainHeader = self.region.read_pod(0)?;
        f(&mut header);
        self.region.write_pod(0, &header)
    }

    pub fn read_descriptor(&self, idx: u32) -> StoreResult<ModDescriptor> {
        self.region.read_pod(mod_desc_off(idx))
    }

    pub fn write_descriptor(&self, idx: u32, desc: &ModDescriptor) -> StoreResult<()> {
        self.region.write_pod(mod_desc_off(idx), desc)
    }

    pub fn update_descriptor(
        &self,
        idx: u32,
        f: impl FnOnce(&mut ModDescriptor),
    ) -> StoreResult<()> {
        let mut desc = self.read_descriptor(idx)?;
        f(&mut desc);
        self.write_descriptor(idx, &desc)
    }

    /// Grow the region to hold one more descriptor.
    pub fn grow_for_descriptor(&self, new_count: u32) -> StoreResult<()> {
        self.region.grow(mod_desc_off(new_count))
    }

    pub fn ver(&self, idx: u32) -> StoreResult<u32> {
        self.region.atomic_load(mod_desc_off(idx) + MOD_DESC_OFF_VER)
    }

    pub fn bump_ver(&self, idx: u32) -> StoreResult<u32> {
        Ok(self
            .region
            .atomic_fetch_add(mod_desc_off(idx) + MOD_DESC_OFF_VER, 1)?
            + 1)
    }

    /// Snapshot of a lock record, for monitoring and recovery decisions.
    pub fn read_lock_state(&self, off: usize) -> StoreResult<LockState> {
        self.region.read_pod(off)
    }

    // Atomic plumbing for the lock records living in this region.

    pub(crate) fn lock_atomic_load(&self, off: usize) -> StoreResult<u32> {
        self.region.atomic_load(off)
    }

    pub(crate) fn lock_atomic_store(&self, off: usize, val: u32) -> StoreResult<()> {
        self.region.atomic_store(off, val)
    }

    pub(crate) fn lock_atomic_cas(&self, off: usize, cur: u32, new: u32) -> StoreResult<bool> {
        self.region.atomic_cas(off, cur, new)
    }
}

/// The Ext SHM region: `wasted` counter plus the offset heap.
#[derive(Debug)]
pub struct ExtShm {
    region: Region,
}

pub const OFF_WASTED: usize = 0;
pub const EXT_HEADER_SIZE: usize = 8;

impl ExtShm {
    pub fn open(path: &Path) -> StoreResult<(ExtShm, bool)> {
        let (region, created) = Region::open(path, EXT_HEADER_SIZE)?;
        let shm = ExtShm { region };
        if created {
            shm.region.atomic_store(OFF_WASTED, 0)?;
        }
        Ok((shm, created))
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn wasted(&self) -> StoreResult<u32> {
        self.region.atomic_load(OFF_WASTED)
    }

    pub fn wasted_add(&self, bytes: u32) -> StoreResult<()> {
        self.region.atomic_fetch_add(OFF_WASTED, bytes).map(|_| ())
    }

    pub fn wasted_reset(&self) -> StoreResult<()> {
        self.region.atomic_store(OFF_WASTED, 0)
    }

    /// Append a block at the tail, growing the file. The tail is the file
    /// length, not the mapping length: the caller holds the SHM WRITE lock,
    /// but our mapping may lag behind growth done by other processes.
    pub fn alloc(&self, bytes: &[u8]) -> StoreResult<u64> {
        let off = align_up(self.region.file_len()?.max(EXT_HEADER_SIZE));
        let new_len = off + align_up(bytes.len().max(1));
        self.region.grow(new_len)?;
        self.region.write_bytes(off, bytes)?;
        Ok(off as u64)
    }

    pub fn read_bytes(&self, off: u64, len: usize) -> StoreResult<Vec<u8>> {
        self.region.read_bytes(off as usize, len)
    }

    pub fn write_bytes(&self, off: u64, bytes: &[u8]) -> StoreResult<()> {
        self.region.write_bytes(off as usize, bytes)
    }

    /// Store a length-prefixed string; returns its offset. Offset 0 is the
    /// header and therefore doubles as the null string.
    pub fn store_str(&self, s: &str) -> StoreResult<u64> {
        let mut block = Vec::with_capacity(4 + s.len());
        block.extend_from_slice(&(s.len() as u32).to_le_bytes());
        block.extend_from_slice(s.as_bytes());
        self.alloc(&block)
    }

    pub fn store_opt_str(&self, s: Option<&str>) -> StoreResult<u64> {
        match s {
            Some(s) => self.store_str(s),
            None => Ok(0),
        }
    }

    pub fn read_str(&self, off: u64) -> StoreResult<String> {
        let len_bytes = self.region.read_bytes(off as usize, 4)?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let bytes = self.region.read_bytes(off as usize + 4, len as usize)?;
        String::from_utf8(bytes).map_err(|e| {
            StoreError::new(ErrorKind::Internal, format!("corrupt SHM string at {}: {}", off, e))
        })
    }

    pub fn read_opt_str(&self, off: u64) -> StoreResult<Option<String>> {
        if off == 0 {
            return Ok(None);
        }
        self.read_str(off).map(Some)
    }

    /// The byte size a string block occupies, for `wasted` accounting.
    pub fn str_block_size(s: &str) -> u32 {
        align_up(4 + s.len()) as u32
    }

    pub fn array_get<T: Pod>(&self, off: u64, count: u32) -> StoreResult<Vec<T>> {
        let item = std::mem::size_of::<T>();
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let bytes = self.region.read_bytes(off as usize + i * item, item)?;
            out.push(bytemuck::pod_read_unaligned(&bytes));
        }
        Ok(out)
    }

    pub fn array_set<T: Pod>(&self, off: u64, idx: u32, value: &T) -> StoreResult<()> {
        let item = std::mem::size_of::<T>();
        self.region
            .write_bytes(off as usize + idx as usize * item, bytemuck::bytes_of(value))
    }

    /// Insert `value` at `idx` into the array at `off` holding `count`
    /// items. Grows in place when the block's alignment slack suffices,
    /// otherwise reallocates at the tail and marks the old block wasted.
    /// Returns the (possibly moved) array offset.
    pub fn array_insert<T: Pod>(
        &self,
        off: u64,
        count: u32,
        idx: u32,
        value: &T,
    ) -> StoreResult<u64> {
        debug_assert!(idx <= count);
        let item = std::mem::size_of::<T>();
        let old_size = count as usize * item;
        let new_size = old_size + item;

        let mut items: Vec<u8> = if count > 0 {
            self.region.read_bytes(off as usize, old_size)?
        } else {
            Vec::new()
        };
        let at = idx as usize * item;
        items.splice(at..at, bytemuck::bytes_of(value).iter().copied());
        debug_assert_eq!(items.len(), new_size);

        if count > 0 && align_up(old_size) >= new_size {
            // In-place growth within the block's alignment slack.
            self.region.write_bytes(off as usize, &items)?;
            return Ok(off);
        }

        let new_off = self.alloc(&items)?;
        if count > 0 {
            self.wasted_add(align_up(old_size) as u32)?;
        }
        Ok(new_off)
    }

    /// Append `value` to the array at `off`.
    pub fn array_add<T: Pod>(&self, off: u64, count: u32, value: &T) -> StoreResult<u64> {
        self.array_insert(off, count, count, value)
    }

    /// Delete item `idx`, compacting the suffix with a memmove and adding
    /// the freed span to `wasted`. Returns the new offset (0 when the array
    /// becomes empty and the whole block is surrendered).
    pub fn array_del<T: Pod>(&self, off: u64, count: u32, idx: u32) -> StoreResult<u64> {
        debug_assert!(idx < count);
        let item = std::mem::size_of::<T>();
        if count == 1 {
            self.wasted_add(align_up(item) as u32)?;
            return Ok(0);
        }
        let tail_off = off as usize + (idx as usize + 1) * item;
        let tail_len = (count as usize - idx as usize - 1) * item;
        if tail_len > 0 {
            let tail = self.region.read_bytes(tail_off, tail_len)?;
            self.region.write_bytes(tail_off - item, &tail)?;
        }
        self.wasted_add(item as u32)?;
        Ok(off)
    }

    /// Whether the wasted share exceeds the configured percentage.
    pub fn needs_defrag(&self, percent: u32) -> bool {
        let len = self.region.len().max(1);
        match self.wasted() {
            Ok(wasted) => (wasted as usize) * 100 > len * percent as usize,
            Err(_) => false,
        }
    }

    /// Replace the heap with a compacted image (built by the registry from
    /// the Main SHM roots) and reset `wasted`. The file keeps its
    /// high-water size: shrinking it would invalidate mappings other
    /// processes still hold.
    pub fn replace_with(&self, image: &[u8]) -> StoreResult<()> {
        let new_len = align_up(image.len().max(EXT_HEADER_SIZE));
        if new_len > self.region.len() {
            self.region.grow(new_len)?;
        }
        self.region.write_bytes(0, image)?;
        self.wasted_reset()
    }
}

/// The pair of regions a connection operates on.
#[derive(Debug)]
pub struct ShmCtx {
    pub main: MainShm,
    pub ext: ExtShm,
}

impl ShmCtx {
    /// Open or create both regions. One-time creation is serialized by an
    /// advisory file lock so concurrent first connections race safely.
    pub fn open(
        main_path: &Path,
        ext_path: &Path,
        create_lock_path: &Path,
    ) -> StoreResult<(ShmCtx, bool)> {
        let _guard = crate::rwlock::FileLockGuard::lock_exclusive(create_lock_path)?;
        let (main, created_main) = MainShm::open(main_path)?;
        let (ext, _created_ext) = ExtShm::open(ext_path)?;
        Ok((ShmCtx { main, ext }, created_main))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_ctx(temp: &TempDir) -> ShmCtx {
        let (ctx, created) = ShmCtx::open(
            &temp.path().join("t_main"),
            &temp.path().join("t_ext"),
            &temp.path().join("t_create.lock"),
        )
        .unwrap();
        assert!(created);
        ctx
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<LockState>(), LOCK_STATE_SIZE);
        assert_eq!(std::mem::size_of::<MainHeader>(), MAIN_HEADER_SIZE);
        assert_eq!(std::mem::size_of::<ModDescriptor>(), MOD_DESC_SIZE);
        assert_eq!(std::mem::size_of::<DepEntryShm>(), 24);
    }

    #[test]
    fn test_header_initialized_on_create() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let header = ctx.main.read_header().unwrap();
        assert_eq!(header.magic, SHM_VERSION);
        assert_eq!(header.mod_count, 0);
        assert_eq!(header.next_cid, 1);
    }

    #[test]
    fn test_version_tag_mismatch_refused() {
        let temp = TempDir::new().unwrap();
        {
            let ctx = open_ctx(&temp);
            ctx.main
                .update_header(|h| h.magic = 0xdead_beef)
                .unwrap();
        }
        let err = ShmCtx::open(
            &temp.path().join("t_main"),
            &temp.path().join("t_ext"),
            &temp.path().join("t_create.lock"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_id_counters_monotonic() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let a = ctx.main.next_id(OFF_NEXT_CID).unwrap();
        let b = ctx.main.next_id(OFF_NEXT_CID).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_string_round_trip_and_null() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let off = ctx.ext.store_str("ietf-interfaces").unwrap();
        assert_ne!(off, 0);
        assert_eq!(off % SHM_ALIGN as u64, 0);
        assert_eq!(ctx.ext.read_str(off).unwrap(), "ietf-interfaces");
        assert_eq!(ctx.ext.read_opt_str(0).unwrap(), None);
    }

    #[test]
    fn test_array_add_del_round_trip() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);

        let mut off = 0u64;
        for i in 0..5u64 {
            let entry = DepEntryShm {
                target_off: i,
                xpath_off: i * 10,
                tag: DEP_TAG_REF,
                _pad: 0,
            };
            off = ctx.ext.array_add(off, i as u32, &entry).unwrap();
        }
        let items: Vec<DepEntryShm> = ctx.ext.array_get(off, 5).unwrap();
        assert_eq!(items.len(), 5);
        assert_eq!(items[3].target_off, 3);

        // Delete the middle entry; suffix compacts.
        let off2 = ctx.ext.array_del::<DepEntryShm>(off, 5, 2).unwrap();
        assert_eq!(off2, off);
        let items: Vec<DepEntryShm> = ctx.ext.array_get(off2, 4).unwrap();
        assert_eq!(items.iter().map(|d| d.target_off).collect::<Vec<_>>(), vec![0, 1, 3, 4]);
        assert!(ctx.ext.wasted().unwrap() > 0);
    }

    #[test]
    fn test_array_insert_ordered() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let entry = |v: u64| DepEntryShm {
            target_off: v,
            xpath_off: 0,
            tag: DEP_TAG_REF,
            _pad: 0,
        };
        let off = ctx.ext.array_add(0, 0, &entry(10)).unwrap();
        let off = ctx.ext.array_add(off, 1, &entry(30)).unwrap();
        let off = ctx.ext.array_insert(off, 2, 1, &entry(20)).unwrap();
        let items: Vec<DepEntryShm> = ctx.ext.array_get(off, 3).unwrap();
        assert_eq!(items.iter().map(|d| d.target_off).collect::<Vec<_>>(), vec![10, 20, 30]);
    }

    #[test]
    fn test_array_del_to_empty_surrenders_block() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        let entry = DepEntryShm {
            target_off: 1,
            xpath_off: 2,
            tag: DEP_TAG_INSTID,
            _pad: 0,
        };
        let off = ctx.ext.array_add(0, 0, &entry).unwrap();
        let off = ctx.ext.array_del::<DepEntryShm>(off, 1, 0).unwrap();
        assert_eq!(off, 0);
        assert_eq!(ctx.ext.wasted().unwrap(), align_up(24) as u32);
    }

    #[test]
    fn test_descriptor_ver_bump() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        ctx.main.grow_for_descriptor(1).unwrap();
        ctx.main.write_descriptor(0, &ModDescriptor::zeroed()).unwrap();
        ctx.main.set_mod_count(1).unwrap();

        assert_eq!(ctx.main.ver(0).unwrap(), 0);
        assert_eq!(ctx.main.bump_ver(0).unwrap(), 1);
        assert_eq!(ctx.main.ver(0).unwrap(), 1);
        let desc = ctx.main.read_descriptor(0).unwrap();
        assert_eq!(desc.ver, 1);
    }

    #[test]
    fn test_needs_defrag_threshold() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        // Small heap: wasting most of it crosses any sane threshold.
        let off = ctx.ext.store_str("abcdefgh-abcdefgh").unwrap();
        assert!(!ctx.ext.needs_defrag(25));
        ctx.ext
            .wasted_add(ExtShm::str_block_size("abcdefgh-abcdefgh"))
            .unwrap();
        let _ = off;
        assert!(ctx.ext.needs_defrag(25));
        ctx.ext.wasted_reset().unwrap();
        assert!(!ctx.ext.needs_defrag(25));
    }
}
