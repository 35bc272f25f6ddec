//! Vinodes: the volatile side of persistent inodes.
//!
//! A vinode binds runtime state to one persistent inode: a reference
//! count, a rwlock guarding the per-inode volatile data (the offset→
//! block index and the first-block pointer), the orphan-list slot, and
//! a weak parent reference kept only to reconstruct paths for log
//! lines.
//!
//! The inode map interns persistent inodes into vinodes. A vinode is
//! reachable from the map exactly while its reference count is
//! nonzero; increments from zero happen only under the map lock, so
//! the drop-to-zero path can safely remove the entry and, when the
//! inode is orphaned, reclaim its persistent storage.
//!
//! Lock discipline for the persistent inode itself: all field access
//! goes through the guards below, so readers hold the shared side and
//! writers the exclusive side of the vinode rwlock. Double-slotted
//! fields are updated through the guard's setters, which journal the
//! selector word into the supplied transaction first.

use core::mem::offset_of;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cred::Cred;
use crate::error::Result;
use crate::index::BlockIndex;
use crate::layout::{
    BlockArray, Dir, Inode, InodeArray, InodeType, Time, BLOCK_ARRAY_VERSION, DIR_VERSION,
    INLINE_BLOCK_CAP, INLINE_DIRENT_CAP, INODE_ARRAY_VERSION, INODE_HEAD_SIZE,
    INODE_SLOTS_OFFSET, INODE_VERSION, METADATA_BLOCK_SIZE, NUMINODES_PER_ENTRY, S_IFDIR, S_IFREG,
    Super,
};
use crate::obj::{Obj, ObjStore, ObjType, Tx};
use crate::pool::Pool;
use crate::{data, dir, locks};

use zerocopy::IntoBytes;

/// Where an orphaned inode sits in the pool orphan list.
#[derive(Debug, Clone, Copy)]
pub struct OrphanSlot {
    pub arr: Obj<InodeArray>,
    pub idx: u32,
}

/// Volatile per-inode data, guarded by the vinode rwlock.
#[derive(Default)]
pub struct VinodeInner {
    /// Offset → block index; `None` until first use or after an
    /// aborted transaction that touched the chain.
    pub index: Option<BlockIndex>,
    /// First block of the file in offset order (null = none).
    pub first_block: u64,
    snapshot_first_block: u64,
}

impl VinodeInner {
    /// Save the volatile chain state for rollback.
    pub fn snapshot(&mut self) {
        self.snapshot_first_block = self.first_block;
    }

    /// Restore the snapshot. The index is not restored, only dropped;
    /// it is rebuilt the next time the vinode is used.
    pub fn restore_on_abort(&mut self) {
        self.first_block = self.snapshot_first_block;
        self.index = None;
    }

    pub fn destroy_data_state(&mut self) {
        self.index = None;
    }
}

/// Debug-only path breadcrumbs; the parent reference is weak and never
/// keeps the parent alive.
#[derive(Default)]
struct DebugPath {
    parent: Option<Weak<Vinode>>,
    name: Vec<u8>,
}

pub struct Vinode {
    pub tinode: Obj<Inode>,
    /// Cached from the inode mode bits; the type never changes.
    pub typ: InodeType,
    pub(crate) inner: Arc<RwLock<VinodeInner>>,
    ref_count: AtomicU32,
    orphan: Mutex<Option<OrphanSlot>>,
    debug: Mutex<DebugPath>,
}

impl Vinode {
    pub fn is_dir(&self) -> bool {
        self.typ == InodeType::Dir
    }

    pub fn is_regular(&self) -> bool {
        self.typ == InodeType::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.typ == InodeType::Symlink
    }

    pub fn read<'a>(&'a self, store: &'a ObjStore) -> InodeReadGuard<'a> {
        InodeReadGuard {
            store,
            vinode: self,
            guard: self.inner.read(),
        }
    }

    pub fn write<'a>(&'a self, store: &'a ObjStore) -> InodeWriteGuard<'a> {
        InodeWriteGuard {
            store,
            vinode: self,
            guard: Some(self.inner.write()),
        }
    }

    pub(crate) fn set_debug_path(&self, parent: Option<&VinodeRef>, name: &[u8]) {
        let mut debug = self.debug.lock();
        debug.parent = parent.map(|p| Arc::downgrade(&p.v));
        debug.name = name.to_vec();
    }

    /// Best-effort path for log lines.
    pub fn debug_path(&self) -> String {
        let debug = self.debug.lock();
        let name = String::from_utf8_lossy(&debug.name).into_owned();
        match debug.parent.as_ref().and_then(Weak::upgrade) {
            Some(parent) => {
                let prefix = parent.debug_path();
                if prefix.ends_with('/') {
                    format!("{}{}", prefix, name)
                } else {
                    format!("{}/{}", prefix, name)
                }
            }
            None => {
                if name.is_empty() {
                    "/".to_string()
                } else {
                    name
                }
            }
        }
    }
}

/// Shared access to one inode and its volatile state.
pub struct InodeReadGuard<'a> {
    store: &'a ObjStore,
    vinode: &'a Vinode,
    guard: RwLockReadGuard<'a, VinodeInner>,
}

impl InodeReadGuard<'_> {
    pub fn inode(&self) -> &Inode {
        // SAFETY: the shared side of the vinode rwlock is held, so no
        // writer is mutating this inode.
        unsafe { self.store.as_ref(self.vinode.tinode) }
    }

    pub fn inner(&self) -> &VinodeInner {
        &self.guard
    }

    pub fn vinode(&self) -> &Vinode {
        self.vinode
    }

    /// The symlink target bytes, wherever they live.
    pub fn symlink_target(&self) -> Vec<u8> {
        let inode = self.inode();
        debug_assert_eq!(self.vinode.typ, InodeType::Symlink);
        let len = inode.size() as usize;
        if inode.is_long_symlink() {
            self.store.bytes(inode.long_symlink(), len as u64).to_vec()
        } else {
            inode.file_data[..len].to_vec()
        }
    }
}

/// Exclusive access to one inode and its volatile state.
///
/// Constructed either with an owned lock guard (released on drop) or
/// transaction-enlisted via [`tx_write`], in which case release is in
/// the hands of the transaction's abort/commit callbacks.
pub struct InodeWriteGuard<'a> {
    store: &'a ObjStore,
    vinode: &'a Vinode,
    guard: Option<RwLockWriteGuard<'a, VinodeInner>>,
}

impl<'a> InodeWriteGuard<'a> {
    pub fn vinode(&self) -> &'a Vinode {
        self.vinode
    }

    pub fn tinode(&self) -> Obj<Inode> {
        self.vinode.tinode
    }

    pub fn store(&self) -> &'a ObjStore {
        self.store
    }

    pub fn inode(&self) -> &Inode {
        // SAFETY: the exclusive side of the vinode rwlock is held.
        unsafe { self.store.as_ref(self.vinode.tinode) }
    }

    pub fn inode_mut(&mut self) -> &mut Inode {
        // SAFETY: the exclusive side of the vinode rwlock is held and
        // `&mut self` makes this the only live reference.
        unsafe { self.store.as_mut(self.vinode.tinode) }
    }

    pub fn inner(&self) -> &VinodeInner {
        match &self.guard {
            Some(guard) => guard,
            // SAFETY: tx-enlisted guards hold the write lock without a
            // guard value; see `tx_write`.
            None => unsafe { &*self.vinode.inner.data_ptr() },
        }
    }

    pub fn inner_mut(&mut self) -> &mut VinodeInner {
        match &mut self.guard {
            Some(guard) => guard,
            // SAFETY: as in `inner`, plus `&mut self` exclusivity.
            None => unsafe { &mut *self.vinode.inner.data_ptr() },
        }
    }

    /// Journal the selector word so every slot flip below can be
    /// rolled back.
    fn add_slots(&self, tx: &Tx<'_>) {
        tx.add_range(self.vinode.tinode.raw() + INODE_SLOTS_OFFSET, 8);
    }

    /// Journal the single-slot head fields (uid/gid).
    pub fn add_head(&self, tx: &Tx<'_>) {
        tx.add_range(self.vinode.tinode.raw(), INODE_HEAD_SIZE);
    }

    pub fn set_size(&mut self, tx: &Tx<'_>, v: u64) {
        self.add_slots(tx);
        self.inode_mut().set_size(v);
    }

    pub fn set_nlink(&mut self, tx: &Tx<'_>, v: u64) {
        self.add_slots(tx);
        self.inode_mut().set_nlink(v);
    }

    pub fn set_allocated_space(&mut self, tx: &Tx<'_>, v: u64) {
        self.add_slots(tx);
        self.inode_mut().set_allocated_space(v);
    }

    pub fn set_flags_word(&mut self, tx: &Tx<'_>, v: u64) {
        self.add_slots(tx);
        self.inode_mut().set_flags_word(v);
    }

    pub fn set_atime(&mut self, tx: &Tx<'_>, t: Time) {
        self.add_slots(tx);
        self.inode_mut().set_atime(t);
    }

    pub fn set_ctime(&mut self, tx: &Tx<'_>, t: Time) {
        self.add_slots(tx);
        self.inode_mut().set_ctime(t);
    }

    pub fn set_mtime(&mut self, tx: &Tx<'_>, t: Time) {
        self.add_slots(tx);
        self.inode_mut().set_mtime(t);
    }

    /// Hand lock release over to the transaction's commit callbacks.
    /// Only valid for tx-enlisted guards.
    pub fn unlock_on_commit(self, tx: &Tx<'_>) {
        assert!(self.guard.is_none(), "guard is not tx-enlisted");
        locks::rwlock_tx_unlock_on_commit(tx, &self.vinode.inner);
    }
}

/// Write-acquire the vinode inside `tx`; the lock is released by the
/// transaction (abort callbacks, or commit after
/// [`InodeWriteGuard::unlock_on_commit`]).
pub fn tx_write<'a>(tx: &Tx<'_>, store: &'a ObjStore, vinode: &'a VinodeRef) -> InodeWriteGuard<'a> {
    locks::rwlock_tx_wlock(tx, &vinode.v.inner);
    InodeWriteGuard {
        store,
        vinode: &vinode.v,
        guard: None,
    }
}

/// A counted reference to a vinode. Clones bump the count; dropping
/// without [`VinodeRef::unref`] leaks the count (open-file handles
/// must be closed, as in the C library).
pub struct VinodeRef {
    v: Arc<Vinode>,
}

impl core::ops::Deref for VinodeRef {
    type Target = Vinode;

    fn deref(&self) -> &Vinode {
        &self.v
    }
}

impl Clone for VinodeRef {
    fn clone(&self) -> Self {
        // The count is at least one (ours), so the map entry cannot
        // disappear underneath us.
        self.v.ref_count.fetch_add(1, Ordering::Relaxed);
        Self { v: Arc::clone(&self.v) }
    }
}

impl VinodeRef {
    /// Stable ordering key for multi-vinode lock acquisition.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.v) as usize
    }

    pub fn same_as(&self, other: &VinodeRef) -> bool {
        Arc::ptr_eq(&self.v, &other.v)
    }

    pub(crate) fn arc(&self) -> &Arc<Vinode> {
        &self.v
    }

    /// Drop this reference. The last reference removes the vinode from
    /// the map; if the inode is orphaned its persistent storage is
    /// freed inside a transaction.
    pub fn unref(self, pool: &Pool) {
        let v = self.v;
        if v.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        let mut map = pool.inode_map.map.write();
        // an intern may have resurrected the count in the meantime
        if v.ref_count.load(Ordering::Acquire) != 0 {
            return;
        }
        map.remove(&v.tinode.raw());
        drop(map);

        let orphan = v.orphan.lock().take();
        if let Some(slot) = orphan {
            log::debug!("reclaiming orphaned inode {:?}", v.tinode);
            inode_free(pool, &v, slot);
        }
    }
}

/// The pool's persistent-inode → vinode map.
pub struct InodeMap {
    map: RwLock<HashMap<u64, Arc<Vinode>>>,
    /// Pool-scoped mutex serialising orphan/suspended list mutation;
    /// enlisted into transactions via the lock-composition layer.
    pub(crate) orphan_mtx: Arc<Mutex<()>>,
}

impl Default for InodeMap {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            orphan_mtx: Arc::new(Mutex::new(())),
        }
    }
}

impl InodeMap {
    /// Return the vinode for `tinode`, creating it on first use.
    pub fn intern(&self, store: &ObjStore, tinode: Obj<Inode>) -> VinodeRef {
        let mut map = self.map.write();
        if let Some(v) = map.get(&tinode.raw()) {
            v.ref_count.fetch_add(1, Ordering::Relaxed);
            return VinodeRef { v: Arc::clone(v) };
        }
        // SAFETY: the caller got `tinode` from a live reference (a
        // dirent, a root slot, or the orphan list), so the object is a
        // valid inode.
        let inode = unsafe { store.as_ref(tinode) };
        let typ = inode.typ().expect("corrupt inode: no type bits");
        let v = Arc::new(Vinode {
            tinode,
            typ,
            inner: Arc::new(RwLock::new(VinodeInner::default())),
            ref_count: AtomicU32::new(1),
            orphan: Mutex::new(None),
            debug: Mutex::new(DebugPath::default()),
        });
        map.insert(tinode.raw(), Arc::clone(&v));
        VinodeRef { v }
    }
}

/// Allocate and initialise a fresh inode inside `tx`.
///
/// The new inode has link count zero; the caller links it into a
/// directory (or the orphan list) in the same transaction.
pub(crate) fn inode_alloc(
    store: &ObjStore,
    tx: &Tx<'_>,
    cred: &Cred,
    mode: u64,
    gid: u32,
    t: Time,
) -> Result<Obj<Inode>> {
    let obj = Obj::<Inode>::from_raw(tx.alloc(ObjType::Inode, METADATA_BLOCK_SIZE as u64)?);
    // SAFETY: freshly allocated and zeroed; nothing else references it.
    let inode = unsafe { store.as_mut(obj) };
    inode.version = INODE_VERSION;
    inode.uid = cred.fsuid;
    inode.gid = gid;
    // fresh storage: slot flips need no journaling here
    inode.set_flags_word(mode);
    inode.set_size(0);
    inode.set_nlink(0);
    inode.set_allocated_space(0);
    inode.set_atime(t);
    inode.set_ctime(t);
    inode.set_mtime(t);

    match mode & crate::layout::S_IFMT {
        S_IFDIR => {
            let hdr = Dir {
                version: DIR_VERSION,
                num_elements: INLINE_DIRENT_CAP,
                next: 0,
            };
            inode.file_data[..core::mem::size_of::<Dir>()].copy_from_slice(hdr.as_bytes());
        }
        S_IFREG => {
            let hdr = BlockArray {
                version: BLOCK_ARRAY_VERSION,
                length: INLINE_BLOCK_CAP,
                next: 0,
            };
            inode.file_data[..core::mem::size_of::<BlockArray>()].copy_from_slice(hdr.as_bytes());
        }
        _ => {} // symlink storage is written by the caller
    }
    Ok(obj)
}

const SUPER_ORPHANED_OFFSET: u64 = offset_of!(Super, orphaned_inodes) as u64;
const ARRAY_USED_OFFSET: u64 = offset_of!(InodeArray, used) as u64;
const ARRAY_PREV_OFFSET: u64 = offset_of!(InodeArray, prev) as u64;
const ARRAY_NEXT_OFFSET: u64 = offset_of!(InodeArray, next) as u64;
const ARRAY_INODES_OFFSET: u64 = offset_of!(InodeArray, inodes) as u64;

fn orphan_head(pool: &Pool) -> u64 {
    // SAFETY: the super block is always live; 8-byte reads of the head
    // are serialised by the orphan mutex held by all callers.
    unsafe { pool.store.as_ref::<Super>(pool.super_obj) }.orphaned_inodes
}

/// Append `tinode` to the pool orphan list. Caller must have enlisted
/// the orphan mutex into `tx`.
fn inode_array_add(pool: &Pool, tx: &Tx<'_>, tinode: Obj<Inode>) -> Result<OrphanSlot> {
    let store = &pool.store;
    let mut arr = Obj::<InodeArray>::from_raw(orphan_head(pool));

    while !arr.is_null() {
        // SAFETY: list pages are live while linked; mutation is
        // serialised by the orphan mutex.
        let a = unsafe { store.as_ref(arr) };
        if (a.used as usize) < NUMINODES_PER_ENTRY {
            let idx = a
                .inodes
                .iter()
                .position(|&h| h == 0)
                .expect("used count disagrees with slots") as u32;
            tx.add_range(arr.raw() + ARRAY_INODES_OFFSET + 8 * idx as u64, 8);
            tx.add_range(arr.raw() + ARRAY_USED_OFFSET, 4);
            // SAFETY: as above, exclusive under the orphan mutex.
            let a = unsafe { store.as_mut(arr) };
            a.inodes[idx as usize] = tinode.raw();
            a.used += 1;
            return Ok(OrphanSlot { arr, idx });
        }
        arr = Obj::from_raw(a.next);
    }

    // no free slot anywhere: push a fresh page at the head
    let new = Obj::<InodeArray>::from_raw(tx.alloc(ObjType::InodeArray, METADATA_BLOCK_SIZE as u64)?);
    let old_head = orphan_head(pool);
    // SAFETY: freshly allocated page.
    let a = unsafe { store.as_mut(new) };
    a.version = INODE_ARRAY_VERSION;
    a.next = old_head;
    a.inodes[0] = tinode.raw();
    a.used = 1;
    if old_head != 0 {
        tx.add_range(old_head + ARRAY_PREV_OFFSET, 8);
        // SAFETY: old head page is live, exclusive under the mutex.
        unsafe { store.as_mut(Obj::<InodeArray>::from_raw(old_head)) }.prev = new.raw();
    }
    tx.add_range(pool.super_obj.raw() + SUPER_ORPHANED_OFFSET, 8);
    // SAFETY: super block is live, head updates under the mutex.
    unsafe { store.as_mut::<Super>(pool.super_obj) }.orphaned_inodes = new.raw();
    Ok(OrphanSlot { arr: new, idx: 0 })
}

/// Clear an orphan slot; empty pages are unlinked and freed. Caller
/// must have enlisted the orphan mutex into `tx`.
fn inode_array_unregister(pool: &Pool, tx: &Tx<'_>, slot: OrphanSlot) {
    let store = &pool.store;
    tx.add_range(slot.arr.raw() + ARRAY_INODES_OFFSET + 8 * slot.idx as u64, 8);
    tx.add_range(slot.arr.raw() + ARRAY_USED_OFFSET, 4);
    // SAFETY: the page is live; exclusive under the orphan mutex.
    let a = unsafe { store.as_mut(slot.arr) };
    debug_assert_ne!(a.inodes[slot.idx as usize], 0);
    a.inodes[slot.idx as usize] = 0;
    a.used -= 1;

    if a.used == 0 {
        let (prev, next) = (a.prev, a.next);
        if prev != 0 {
            tx.add_range(prev + ARRAY_NEXT_OFFSET, 8);
            // SAFETY: live page, exclusive under the mutex.
            unsafe { store.as_mut(Obj::<InodeArray>::from_raw(prev)) }.next = next;
        } else {
            tx.add_range(pool.super_obj.raw() + SUPER_ORPHANED_OFFSET, 8);
            // SAFETY: super block is live; head updates under the mutex.
            unsafe { store.as_mut::<Super>(pool.super_obj) }.orphaned_inodes = next;
        }
        if next != 0 {
            tx.add_range(next + ARRAY_PREV_OFFSET, 8);
            // SAFETY: live page, exclusive under the mutex.
            unsafe { store.as_mut(Obj::<InodeArray>::from_raw(next)) }.prev = prev;
        }
        tx.free(slot.arr.raw());
    }
}

/// Put `vinode` on the orphan list inside `tx`: the inode keeps one
/// on-media link (the list's own reference) until the last open
/// reference goes away.
pub(crate) fn vinode_orphan(
    pool: &Pool,
    tx: &Tx<'_>,
    vinode: &VinodeRef,
    guard: &mut InodeWriteGuard<'_>,
) -> Result<()> {
    debug_assert!(vinode.orphan.lock().is_none(), "already orphaned");

    locks::mutex_tx_lock(tx, &pool.inode_map.orphan_mtx);
    locks::mutex_tx_unlock_on_commit(tx, &pool.inode_map.orphan_mtx);

    let slot = inode_array_add(pool, tx, vinode.tinode)?;
    let nlink = guard.inode().nlink();
    guard.set_nlink(tx, nlink + 1);

    *vinode.orphan.lock() = Some(slot);
    let v = Arc::clone(vinode.arc());
    tx.on_abort(move || {
        *v.orphan.lock() = None;
    });
    Ok(())
}

/// Orphan an inode created in this very transaction (tmpfile-open):
/// there is no vinode yet, the caller attaches the returned slot to
/// one after commit.
pub(crate) fn orphan_new_inode(pool: &Pool, tx: &Tx<'_>, tinode: Obj<Inode>) -> Result<OrphanSlot> {
    locks::mutex_tx_lock(tx, &pool.inode_map.orphan_mtx);
    locks::mutex_tx_unlock_on_commit(tx, &pool.inode_map.orphan_mtx);

    let slot = inode_array_add(pool, tx, tinode)?;
    // SAFETY: the inode is fresh; nothing else references it.
    let inode = unsafe { pool.store.as_mut(tinode) };
    let nlink = inode.nlink();
    inode.set_nlink(nlink + 1);
    Ok(slot)
}

impl Vinode {
    /// Attach the orphan slot of an inode orphaned before this vinode
    /// existed (tmpfile-open does this right after commit).
    pub(crate) fn set_orphan_slot(&self, slot: OrphanSlot) {
        let mut orphan = self.orphan.lock();
        debug_assert!(orphan.is_none());
        *orphan = Some(slot);
    }
}

/// Reclaim the persistent storage of an orphaned inode whose last
/// vinode reference just went away.
fn inode_free(pool: &Pool, vinode: &Vinode, slot: OrphanSlot) {
    let store = &pool.store;
    let tx = store.tx_begin();
    locks::mutex_tx_lock(&tx, &pool.inode_map.orphan_mtx);
    locks::mutex_tx_unlock_on_commit(&tx, &pool.inode_map.orphan_mtx);

    match vinode.typ {
        InodeType::Regular => data::free_file_blocks(store, &tx, vinode.tinode),
        InodeType::Dir => dir::free_dir_pages(store, &tx, vinode.tinode),
        InodeType::Symlink => {
            // SAFETY: sole reference to the inode; no guard needed.
            let inode = unsafe { store.as_ref(vinode.tinode) };
            if inode.is_long_symlink() {
                tx.free(inode.long_symlink());
            }
        }
    }
    inode_array_unregister(pool, &tx, slot);
    tx.free(vinode.tinode.raw());
    tx.commit();
}
