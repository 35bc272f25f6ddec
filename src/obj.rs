//! The object pool: a contiguous, persistently-imaged memory arena with
//! typed allocations and undo-log transactions.
//!
//! The pool is one 4096-aligned arena. Offset 0 holds the pool header;
//! it doubles as the null handle, so a zeroed on-media reference is
//! always "none". Allocations carry a 64-byte header recording the
//! chunk size and an object type tag; the tag drives the object census
//! (`stats`) and nothing else.
//!
//! A transaction journals pre-images of ranges it is about to mutate
//! (`add_range`). Abort restores the journal in reverse order, frees
//! any allocation made inside the transaction, then runs the `on_abort`
//! callbacks LIFO. Commit applies deferred frees and runs the
//! `on_commit` callbacks FIFO. Only the outermost transaction of a
//! nested group does any of this; inner handles share the outer
//! context and an inner abort poisons the whole group.

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use parking_lot::Mutex;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};

/// Granularity of the allocator; also the alignment of user data.
const CHUNK_ALIGN: u64 = 64;
/// Size of the allocation header preceding every chunk's user data.
const CHUNK_HDR: u64 = 64;
/// First allocatable offset; the header page below it is reserved.
const HEAP_START: u64 = 4096;

/// "PMFSPOOL", little endian.
const POOL_MAGIC: u64 = 0x4C4F_4F50_5346_4D50;
const POOL_VERSION: u64 = 1;

/// A typed handle into the pool. On media this is a plain `u64` byte
/// offset; zero is the null handle.
pub struct Obj<T> {
    off: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Obj<T> {
    pub const fn null() -> Self {
        Self::from_raw(0)
    }

    pub const fn from_raw(off: u64) -> Self {
        Self {
            off,
            _marker: PhantomData,
        }
    }

    pub const fn raw(self) -> u64 {
        self.off
    }

    pub const fn is_null(self) -> bool {
        self.off == 0
    }
}

impl<T> Clone for Obj<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Obj<T> {}
impl<T> PartialEq for Obj<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for Obj<T> {}
impl<T> core::fmt::Debug for Obj<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Obj({:#x})", self.off)
    }
}

/// Object type tags, recorded in allocation headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjType {
    Free = 0,
    Super = 1,
    Inode = 2,
    Dir = 3,
    BlockArray = 4,
    InodeArray = 5,
    Data = 6,
}

/// Live-object census of a pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub inodes: u64,
    pub dirs: u64,
    pub block_arrays: u64,
    pub inode_arrays: u64,
    pub blocks: u64,
}

#[repr(C)]
struct PoolHdr {
    magic: u64,
    version: u64,
    len: u64,
    root: u64,
}

#[repr(C)]
struct ChunkHdr {
    /// Whole chunk size, header included.
    size: u64,
    typ: u32,
    used: u32,
    _pad: [u8; 48],
}

const_assert_eq!(core::mem::size_of::<ChunkHdr>(), CHUNK_HDR as usize);

struct Allocator {
    /// Free regions, offset -> size. Entries exactly tile the free
    /// space; `free` coalesces neighbours to keep it that way.
    free: BTreeMap<u64, u64>,
}

impl Allocator {
    fn new(len: u64) -> Self {
        let mut free = BTreeMap::new();
        if len > HEAP_START {
            free.insert(HEAP_START, len - HEAP_START);
        }
        Self { free }
    }

    /// First fit. Returns the carved region and, when the region was
    /// split, the remainder that needs a fresh free-chunk header.
    fn alloc(&mut self, need: u64) -> Option<(u64, Option<(u64, u64)>)> {
        let (&off, &size) = self.free.iter().find(|(_, &size)| size >= need)?;
        self.free.remove(&off);
        let mut rem = None;
        if size > need {
            self.free.insert(off + need, size - need);
            rem = Some((off + need, size - need));
        }
        Some((off, rem))
    }

    /// Returns the region after coalescing with its free neighbours;
    /// the caller restamps its header.
    fn dealloc(&mut self, off: u64, size: u64) -> (u64, u64) {
        let mut off = off;
        let mut size = size;
        // merge with the preceding free region
        if let Some((&poff, &psize)) = self.free.range(..off).next_back() {
            if poff + psize == off {
                self.free.remove(&poff);
                off = poff;
                size += psize;
            }
        }
        // merge with the following free region
        if let Some(&nsize) = self.free.get(&(off + size)) {
            self.free.remove(&(off + size));
            size += nsize;
        }
        self.free.insert(off, size);
        (off, size)
    }
}

/// The arena plus its allocator. One per pool.
pub struct ObjStore {
    base: *mut u8,
    len: u64,
    alloc: Mutex<Allocator>,
    image: Option<PathBuf>,
}

// SAFETY: the arena itself is plain memory; all mutation goes through
// methods whose callers follow the filesystem locking discipline
// (vinode rwlocks serialise same-object access, the allocator mutex
// serialises chunk bookkeeping).
unsafe impl Send for ObjStore {}
unsafe impl Sync for ObjStore {}

impl Drop for ObjStore {
    fn drop(&mut self) {
        if self.image.is_some() {
            if let Err(err) = self.sync() {
                log::warn!("pool image not synced on drop: {}", err);
            }
        }
        // SAFETY: base was allocated in `new_arena` with this exact layout.
        unsafe { dealloc(self.base, Self::arena_layout(self.len)) };
    }
}

impl ObjStore {
    fn arena_layout(len: u64) -> Layout {
        Layout::from_size_align(len as usize, 4096).expect("pool layout")
    }

    fn new_arena(len: u64) -> *mut u8 {
        // SAFETY: len is nonzero and 4096-aligned by the callers.
        let base = unsafe { alloc_zeroed(Self::arena_layout(len)) };
        assert!(!base.is_null(), "pool arena allocation failed");
        base
    }

    /// A fresh, zeroed, in-memory pool arena.
    pub fn create(len: u64) -> Self {
        let len = len.max(2 * HEAP_START).next_multiple_of(4096);
        let store = Self {
            base: Self::new_arena(len),
            len,
            alloc: Mutex::new(Allocator::new(len)),
            image: None,
        };
        // SAFETY: offset 0 is the reserved header page; nothing else
        // references it yet.
        let hdr = unsafe { &mut *(store.base as *mut PoolHdr) };
        hdr.magic = POOL_MAGIC;
        hdr.version = POOL_VERSION;
        hdr.len = len;
        store.stamp_free(HEAP_START, len - HEAP_START);
        store
    }

    /// Stamp a free-chunk header so the heap always tiles into chunks
    /// that `rebuild_free_map` can walk.
    fn stamp_free(&self, off: u64, size: u64) {
        // SAFETY: the region is free, so nothing references its bytes.
        unsafe {
            let hdr = &mut *(self.base.add(off as usize) as *mut ChunkHdr);
            hdr.size = size;
            hdr.typ = ObjType::Free as u32;
            hdr.used = 0;
        }
    }

    /// Load a pool image from a file. The free map is rebuilt by
    /// walking the chunk headers.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let mut file = std::fs::File::open(&path)?;
        let len = file.metadata()?.len();
        if len < HEAP_START || len % 4096 != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad pool size"));
        }
        let base = Self::new_arena(len);
        // SAFETY: base spans len bytes and is not shared yet.
        file.read_exact(unsafe { core::slice::from_raw_parts_mut(base, len as usize) })?;
        // SAFETY: the header page was just read in.
        let hdr = unsafe { &*(base as *const PoolHdr) };
        if hdr.magic != POOL_MAGIC || hdr.version != POOL_VERSION || hdr.len != len {
            // the arena is freed again below
            // SAFETY: allocated above with the same layout.
            unsafe { dealloc(base, Self::arena_layout(len)) };
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a pmfs pool"));
        }
        let store = Self {
            base,
            len,
            alloc: Mutex::new(Allocator::new(len)),
            image: Some(path),
        };
        store.rebuild_free_map();
        Ok(store)
    }

    /// Bind an in-memory pool to a backing file.
    pub fn bind_image(&mut self, path: PathBuf) {
        self.image = Some(path);
    }

    /// Write the whole image back to the backing file, if any.
    pub fn sync(&self) -> io::Result<()> {
        if let Some(path) = &self.image {
            let mut file = std::fs::File::create(path)?;
            // SAFETY: the arena spans len bytes; concurrent writers may
            // race individual bytes but the image stays a pool image.
            file.write_all(unsafe {
                core::slice::from_raw_parts(self.base, self.len as usize)
            })?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn rebuild_free_map(&self) {
        let mut alloc = self.alloc.lock();
        alloc.free.clear();
        let mut off = HEAP_START;
        while off < self.len {
            // SAFETY: the heap tiles into chunks; every chunk, free or
            // live, carries a header with its size.
            let hdr = unsafe { &*(self.base.add(off as usize) as *const ChunkHdr) };
            assert!(
                hdr.size >= CHUNK_HDR && off + hdr.size <= self.len,
                "corrupt pool image"
            );
            if hdr.used == 0 {
                alloc.dealloc(off, hdr.size);
            }
            off += hdr.size;
        }
    }

    /// The root-object offset stored in the pool header.
    pub fn root(&self) -> u64 {
        // SAFETY: header page is always mapped.
        unsafe { &*(self.base as *const PoolHdr) }.root
    }

    pub fn set_root(&self, root: u64) {
        // SAFETY: header page is always mapped; set once during format.
        unsafe { &mut *(self.base as *mut PoolHdr) }.root = root;
    }

    /// Allocate a zeroed chunk of at least `size` user bytes.
    pub fn alloc(&self, typ: ObjType, size: u64) -> Result<u64> {
        debug_assert!(size > 0);
        let need = (size + CHUNK_HDR).next_multiple_of(CHUNK_ALIGN);
        // hold the allocator lock across the header stamping: free
        // regions may only change hands with their headers in place
        let mut alloc = self.alloc.lock();
        let (off, rem) = alloc.alloc(need).ok_or(Error::NoSpace)?;
        if let Some((rem_off, rem_size)) = rem {
            self.stamp_free(rem_off, rem_size);
        }
        drop(alloc);
        // SAFETY: the region [off, off+need) was just carved out of the
        // free map, so nothing else references it.
        unsafe {
            core::ptr::write_bytes(self.base.add(off as usize), 0, need as usize);
            let hdr = &mut *(self.base.add(off as usize) as *mut ChunkHdr);
            hdr.size = need;
            hdr.typ = typ as u32;
            hdr.used = 1;
        }
        Ok(off + CHUNK_HDR)
    }

    /// Usable size of an allocation (may exceed the requested size).
    pub fn usable_size(&self, obj: u64) -> u64 {
        debug_assert!(obj >= HEAP_START + CHUNK_HDR);
        // SAFETY: obj points at the user data of a live chunk.
        let hdr = unsafe { &*(self.base.add((obj - CHUNK_HDR) as usize) as *const ChunkHdr) };
        hdr.size - CHUNK_HDR
    }

    pub fn free(&self, obj: u64) {
        let off = obj - CHUNK_HDR;
        // SAFETY: obj points at the user data of a live chunk; after
        // this call the caller owns no references into it.
        let size = unsafe {
            let hdr = &*(self.base.add(off as usize) as *const ChunkHdr);
            debug_assert_eq!(hdr.used, 1, "double free");
            hdr.size
        };
        let mut alloc = self.alloc.lock();
        let (moff, msize) = alloc.dealloc(off, size);
        self.stamp_free(moff, msize);
        drop(alloc);
    }

    /// Count live objects by type tag.
    pub fn stats(&self) -> PoolStats {
        let alloc = self.alloc.lock();
        let mut stats = PoolStats::default();
        let mut off = HEAP_START;
        while off < self.len {
            if let Some(&size) = alloc.free.get(&off) {
                off += size;
                continue;
            }
            // SAFETY: off is a live chunk header (not in the free map).
            let hdr = unsafe { &*(self.base.add(off as usize) as *const ChunkHdr) };
            match hdr.typ {
                t if t == ObjType::Inode as u32 => stats.inodes += 1,
                t if t == ObjType::Dir as u32 => stats.dirs += 1,
                t if t == ObjType::BlockArray as u32 => stats.block_arrays += 1,
                t if t == ObjType::InodeArray as u32 => stats.inode_arrays += 1,
                t if t == ObjType::Data as u32 => stats.blocks += 1,
                _ => {}
            }
            off += hdr.size;
        }
        stats
    }

    fn check_range(&self, off: u64, len: u64) {
        debug_assert!(off >= HEAP_START && off + len <= self.len, "pool range");
    }

    /// A shared view of `len` bytes at `off`.
    ///
    /// Callers must hold whatever lock covers the object (readers the
    /// shared side, so a writer cannot be mutating the same bytes).
    pub fn bytes(&self, off: u64, len: u64) -> &[u8] {
        self.check_range(off, len);
        // SAFETY: in range; aliasing discharged by the caller's lock.
        unsafe { core::slice::from_raw_parts(self.base.add(off as usize), len as usize) }
    }

    /// Typed shared view of the object behind `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must point at a live, properly initialised `T` and the
    /// caller must hold the lock that covers it.
    pub unsafe fn as_ref<T>(&self, obj: Obj<T>) -> &T {
        self.check_range(obj.raw(), core::mem::size_of::<T>() as u64);
        unsafe { &*(self.base.add(obj.raw() as usize) as *const T) }
    }

    /// Typed exclusive view of the object behind `obj`.
    ///
    /// # Safety
    ///
    /// As [`Self::as_ref`], with the exclusive side of the lock held,
    /// and no other live reference into the same bytes.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<T>(&self, obj: Obj<T>) -> &mut T {
        self.check_range(obj.raw(), core::mem::size_of::<T>() as u64);
        unsafe { &mut *(self.base.add(obj.raw() as usize) as *mut T) }
    }

    /// Flush a range to media. Durability here is image-granular, so
    /// this is the named seam only.
    pub fn persist(&self, _off: u64, _len: u64) {}

    /// Copy `src` into the pool at `off` and persist it.
    pub fn memcpy_persist(&self, off: u64, src: &[u8]) {
        self.check_range(off, src.len() as u64);
        // SAFETY: in range; destination covered by the caller's
        // exclusive lock; src cannot overlap the pool destination
        // because user buffers live outside the arena.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.base.add(off as usize),
                src.len(),
            );
        }
        self.persist(off, src.len() as u64);
    }

    /// Fill `[off, off+len)` with `byte` and persist it.
    pub fn memset_persist(&self, off: u64, byte: u8, len: u64) {
        self.check_range(off, len);
        // SAFETY: in range; covered by the caller's exclusive lock.
        unsafe { core::ptr::write_bytes(self.base.add(off as usize), byte, len as usize) };
        self.persist(off, len);
    }

    /// Begin a transaction. Dropping the returned value without
    /// committing aborts it.
    pub fn tx_begin(&self) -> Tx<'_> {
        Tx {
            store: self,
            inner: Rc::new(RefCell::new(TxInner::default())),
            outermost: true,
            done: Cell::new(false),
        }
    }
}

#[derive(Default)]
struct TxInner {
    /// Pre-images, restored in reverse order on abort.
    undo: Vec<(u64, Box<[u8]>)>,
    /// Chunks allocated inside the tx; freed on abort.
    allocs: Vec<u64>,
    /// Frees requested inside the tx; applied on commit.
    frees: Vec<u64>,
    on_abort: Vec<Box<dyn FnOnce()>>,
    on_commit: Vec<Box<dyn FnOnce()>>,
    poisoned: bool,
}

/// A pool transaction. All multi-field on-media mutation happens
/// inside one of these; see the module doc for the rollback rules.
pub struct Tx<'p> {
    store: &'p ObjStore,
    inner: Rc<RefCell<TxInner>>,
    outermost: bool,
    done: Cell<bool>,
}

impl<'p> Tx<'p> {
    pub fn store(&self) -> &'p ObjStore {
        self.store
    }

    /// A nested handle sharing this transaction's context. Nested
    /// commit is a no-op; a nested handle dropped without commit
    /// poisons the group, turning the outermost commit into an abort.
    pub fn nested(&self) -> Tx<'p> {
        Tx {
            store: self.store,
            inner: Rc::clone(&self.inner),
            outermost: false,
            done: Cell::new(false),
        }
    }

    /// Journal `[off, off+len)` for rollback. Must precede any direct
    /// mutation of those bytes.
    pub fn add_range(&self, off: u64, len: u64) {
        let saved: Box<[u8]> = self.store.bytes(off, len).into();
        self.inner.borrow_mut().undo.push((off, saved));
    }

    /// Allocate inside the transaction; freed again if it aborts.
    pub fn alloc(&self, typ: ObjType, size: u64) -> Result<u64> {
        let obj = self.store.alloc(typ, size)?;
        self.inner.borrow_mut().allocs.push(obj);
        Ok(obj)
    }

    /// Free on commit; kept alive if the transaction aborts.
    pub fn free(&self, obj: u64) {
        self.inner.borrow_mut().frees.push(obj);
    }

    pub fn on_abort(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_abort.push(Box::new(f));
    }

    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_commit.push(Box::new(f));
    }

    fn run_abort(&self) {
        let mut inner = self.inner.borrow_mut();
        while let Some((off, saved)) = inner.undo.pop() {
            self.store.memcpy_persist(off, &saved);
        }
        for obj in inner.allocs.drain(..) {
            self.store.free(obj);
        }
        inner.frees.clear();
        inner.on_commit.clear();
        let mut callbacks = core::mem::take(&mut inner.on_abort);
        drop(inner);
        while let Some(f) = callbacks.pop() {
            f();
        }
    }

    /// Commit. Only the outermost handle of a group commits for real.
    pub fn commit(self) {
        self.done.set(true);
        if !self.outermost {
            return;
        }
        if self.inner.borrow().poisoned {
            self.run_abort();
            return;
        }
        let mut inner = self.inner.borrow_mut();
        inner.undo.clear();
        inner.allocs.clear();
        for obj in inner.frees.drain(..) {
            self.store.free(obj);
        }
        inner.on_abort.clear();
        let callbacks = core::mem::take(&mut inner.on_commit);
        drop(inner);
        for f in callbacks {
            f();
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.done.get() {
            return;
        }
        if self.outermost {
            self.run_abort();
        } else {
            self.inner.borrow_mut().poisoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let store = ObjStore::create(1 << 20);
        let a = store.alloc(ObjType::Data, 4096).unwrap();
        let b = store.alloc(ObjType::Data, 4096).unwrap();
        assert_ne!(a, b);
        assert!(store.usable_size(a) >= 4096);
        store.free(a);
        let c = store.alloc(ObjType::Data, 4096).unwrap();
        assert_eq!(a, c, "first fit reuses the freed chunk");
        store.free(b);
        store.free(c);
        assert_eq!(store.stats(), PoolStats::default());
    }

    #[test]
    fn exhaustion_reports_nospace() {
        let store = ObjStore::create(64 * 1024);
        let mut objs = Vec::new();
        loop {
            match store.alloc(ObjType::Data, 4096) {
                Ok(o) => objs.push(o),
                Err(err) => {
                    assert_eq!(err, Error::NoSpace);
                    break;
                }
            }
        }
        assert!(!objs.is_empty());
    }

    #[test]
    fn abort_restores_preimage_and_frees() {
        let store = ObjStore::create(1 << 20);
        let obj = store.alloc(ObjType::Data, 64).unwrap();
        store.memcpy_persist(obj, b"before");

        let before = store.stats();
        {
            let tx = store.tx_begin();
            tx.add_range(obj, 6);
            store.memcpy_persist(obj, b"after!");
            let scratch = tx.alloc(ObjType::Data, 4096).unwrap();
            store.memset_persist(scratch, 0xAB, 16);
            // dropped without commit: abort
        }
        assert_eq!(store.bytes(obj, 6), b"before");
        assert_eq!(store.stats(), before, "tx allocation was rolled back");
    }

    #[test]
    fn commit_applies_frees_and_keeps_writes() {
        let store = ObjStore::create(1 << 20);
        let keep = store.alloc(ObjType::Data, 64).unwrap();
        let gone = store.alloc(ObjType::Data, 64).unwrap();

        let tx = store.tx_begin();
        tx.add_range(keep, 4);
        store.memcpy_persist(keep, b"data");
        tx.free(gone);
        tx.commit();

        assert_eq!(store.bytes(keep, 4), b"data");
        assert_eq!(store.stats().blocks, 1);
    }

    #[test]
    fn callback_order() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let store = ObjStore::create(1 << 20);
        let order = Arc::new(AtomicU32::new(0));

        // on_commit runs FIFO
        let tx = store.tx_begin();
        for expect in 0..3u32 {
            let order = Arc::clone(&order);
            tx.on_commit(move || {
                assert_eq!(order.fetch_add(1, Ordering::SeqCst), expect);
            });
        }
        tx.commit();
        assert_eq!(order.load(Ordering::SeqCst), 3);

        // on_abort runs LIFO
        order.store(0, Ordering::SeqCst);
        let tx = store.tx_begin();
        for expect in (0..3u32).rev() {
            let order = Arc::clone(&order);
            tx.on_abort(move || {
                assert_eq!(order.fetch_add(1, Ordering::SeqCst), expect);
            });
        }
        drop(tx);
        assert_eq!(order.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn nested_flattens_and_poisons() {
        let store = ObjStore::create(1 << 20);
        let obj = store.alloc(ObjType::Data, 64).unwrap();
        store.memcpy_persist(obj, b"orig");

        // nested commit defers to the outermost
        let tx = store.tx_begin();
        {
            let inner = tx.nested();
            inner.add_range(obj, 4);
            store.memcpy_persist(obj, b"new!");
            inner.commit();
        }
        drop(tx); // outermost aborts: the nested write rolls back
        assert_eq!(store.bytes(obj, 4), b"orig");

        // nested abort poisons the outermost commit
        let tx = store.tx_begin();
        tx.add_range(obj, 4);
        store.memcpy_persist(obj, b"new!");
        {
            let _inner = tx.nested(); // dropped uncommitted
        }
        tx.commit();
        assert_eq!(store.bytes(obj, 4), b"orig");
    }

    #[test]
    fn image_round_trip() {
        let dir = std::env::temp_dir().join("pmfs-obj-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pool.img");

        let mut store = ObjStore::create(1 << 20);
        let obj = store.alloc(ObjType::Data, 64).unwrap();
        store.memcpy_persist(obj, b"persisted");
        store.set_root(obj);
        store.bind_image(path.clone());
        store.sync().unwrap();
        drop(store);

        let store = ObjStore::open(path.clone()).unwrap();
        assert_eq!(store.root(), obj);
        assert_eq!(store.bytes(obj, 9), b"persisted");
        assert_eq!(store.stats().blocks, 1);
        drop(store);
        std::fs::remove_file(path).ok();
    }
}
