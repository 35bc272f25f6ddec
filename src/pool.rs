//! The pool handle: one open filesystem image.
//!
//! Everything that would be process-global in a kernel lives here:
//! the object store, the root vinodes, the current working directory,
//! the filesystem credentials, and the configuration knobs. All
//! access goes through the pool handle; two pools in one process
//! never share state.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::cred::{Caps, Cred};
use crate::dir;
use crate::error::{Error, Result};
use crate::file::File;
use crate::inode::{self, InodeMap, VinodeRef};
use crate::layout::{
    Super, Time, MAX_BLOCK_SIZE, METADATA_BLOCK_SIZE, PAGE_SIZE, ROOT_COUNT, SUPER_VERSION,
    S_IFDIR,
};
use crate::obj::{Obj, ObjStore, ObjType, PoolStats};
use crate::path::Path;

/// Pool-wide configuration knobs.
pub(crate) struct Config {
    overallocate: AtomicBool,
    block_size: AtomicU64,
}

impl Config {
    fn new() -> Self {
        Self {
            overallocate: AtomicBool::new(true),
            block_size: AtomicU64::new(0),
        }
    }

    pub(crate) fn overallocate_on_append(&self) -> bool {
        self.overallocate.load(Ordering::Relaxed)
    }

    /// 0 means size blocks to fit each allocation.
    pub(crate) fn block_size(&self) -> u64 {
        self.block_size.load(Ordering::Relaxed)
    }
}

/// An open pool: a complete filesystem.
pub struct Pool {
    pub(crate) store: ObjStore,
    pub(crate) super_obj: Obj<Super>,
    pub(crate) inode_map: InodeMap,
    pub(crate) config: Config,
    pub(crate) cred: RwLock<Cred>,
    pub(crate) cwd: RwLock<VinodeRef>,
    roots: Vec<VinodeRef>,
}

fn initial_cred() -> Cred {
    // SAFETY: trivially safe libc calls.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    Cred::new(uid, gid)
}

fn mkfs(store: &ObjStore, cred: &Cred) -> Result<()> {
    let super_off = store.alloc(ObjType::Super, METADATA_BLOCK_SIZE as u64)?;
    store.set_root(super_off);
    // SAFETY: freshly allocated; nothing else references it.
    let sup = unsafe { store.as_mut(Obj::<Super>::from_raw(super_off)) };
    sup.version = SUPER_VERSION;

    let tx = store.tx_begin();
    for slot in sup.root_inode.iter_mut() {
        let root = inode::inode_alloc(store, &tx, cred, S_IFDIR | 0o777, cred.fsgid, Time::now())?;
        dir::init_dot_entries(store, root, root);
        // `.`, its own `..`, and the root slot itself
        // SAFETY: fresh inode.
        unsafe { store.as_mut(root) }.set_nlink(3);
        *slot = root.raw();
    }
    tx.commit();
    Ok(())
}

impl Pool {
    /// A fresh in-memory pool of (at least) `len` bytes.
    pub fn new(len: u64) -> Result<Pool> {
        let store = ObjStore::create(len);
        mkfs(&store, &initial_cred())?;
        log::info!("created pool, {} bytes", len);
        Ok(Self::from_store(store))
    }

    /// A fresh pool bound to an image file; `sync`/`close` write the
    /// image back.
    pub fn create_image(path: impl AsRef<std::path::Path>, len: u64) -> io::Result<Pool> {
        let mut store = ObjStore::create(len);
        mkfs(&store, &initial_cred()).map_err(io::Error::other)?;
        store.bind_image(path.as_ref().to_path_buf());
        store.sync()?;
        log::info!("created pool at {:?}, {} bytes", path.as_ref(), len);
        Ok(Self::from_store(store))
    }

    /// Open an existing pool image.
    pub fn open_image(path: impl AsRef<std::path::Path>) -> io::Result<Pool> {
        let store = ObjStore::open(path.as_ref().to_path_buf())?;
        let super_obj = Obj::<Super>::from_raw(store.root());
        // SAFETY: the root offset of a valid image points at the super
        // block.
        if super_obj.is_null() || unsafe { store.as_ref(super_obj) }.version != SUPER_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad super block",
            ));
        }
        log::info!("opened pool at {:?}", path.as_ref());
        Ok(Self::from_store(store))
    }

    fn from_store(store: ObjStore) -> Pool {
        let super_obj = Obj::<Super>::from_raw(store.root());
        let inode_map = InodeMap::default();
        // SAFETY: validated (or freshly written) super block.
        let sup = unsafe { store.as_ref(super_obj) };
        let roots: Vec<VinodeRef> = sup
            .root_inode
            .iter()
            .map(|&tinode| inode_map.intern(&store, Obj::from_raw(tinode)))
            .collect();
        let cwd = roots[0].clone();
        Pool {
            store,
            super_obj,
            inode_map,
            config: Config::new(),
            cred: RwLock::new(initial_cred()),
            cwd: RwLock::new(cwd),
            roots,
        }
    }

    /// Write the image back to its backing file, if bound to one.
    /// Dropping the pool also syncs, best-effort; syncing explicitly
    /// surfaces the error.
    pub fn sync(&self) -> io::Result<()> {
        self.store.sync()
    }

    pub(crate) fn root_ref(&self, index: usize) -> VinodeRef {
        self.roots[index].clone()
    }

    /// A PATH-style handle on one of the pool's root directories.
    /// `/` resolves to root 0; this is the only way to the others.
    pub fn open_root(&self, index: usize) -> Result<File> {
        if index >= ROOT_COUNT {
            return Err(Error::Inval);
        }
        Ok(File::new_path_handle(self.root_ref(index)))
    }

    /// The directory a path walk starts from.
    pub(crate) fn at_dir(&self, dirfd: Option<&File>, path: &Path) -> Result<VinodeRef> {
        if path.is_absolute() {
            return Ok(self.root_ref(0));
        }
        match dirfd {
            Some(file) => {
                if !file.vinode().is_dir() {
                    return Err(Error::NotDir);
                }
                Ok(file.vinode().clone())
            }
            None => Ok(self.cwd.read().clone()),
        }
    }

    pub(crate) fn cred_snapshot(&self) -> Cred {
        self.cred.read().clone()
    }

    /// Set the filesystem uid; returns the previous one.
    pub fn setfsuid(&self, fsuid: u32) -> u32 {
        core::mem::replace(&mut self.cred.write().fsuid, fsuid)
    }

    /// Set the filesystem gid; returns the previous one.
    pub fn setfsgid(&self, fsgid: u32) -> u32 {
        core::mem::replace(&mut self.cred.write().fsgid, fsgid)
    }

    pub fn setgroups(&self, groups: &[u32]) {
        self.cred.write().groups = SmallVec::from_slice(groups);
    }

    pub fn getgroups(&self) -> Vec<u32> {
        self.cred.read().groups.to_vec()
    }

    pub fn setcap(&self, caps: Caps) {
        self.cred.write().caps |= caps;
    }

    pub fn clrcap(&self, caps: Caps) {
        self.cred.write().caps &= !caps;
    }

    /// Toggle the tiered inflation of appending writes.
    pub fn set_overallocate_on_append(&self, on: bool) {
        self.config.overallocate.store(on, Ordering::Relaxed);
    }

    /// Force every data block to `size` bytes (0 restores automatic
    /// sizing). Must be a page multiple no larger than the block cap.
    pub fn set_block_size(&self, size: u64) -> Result<()> {
        if size != 0 && (size % PAGE_SIZE != 0 || size > MAX_BLOCK_SIZE) {
            return Err(Error::Inval);
        }
        self.config.block_size.store(size, Ordering::Relaxed);
        Ok(())
    }

    /// Census of live objects in the pool.
    pub fn stats(&self) -> PoolStats {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::S_IFMT;

    #[test]
    fn fresh_pool_has_four_roots() {
        let pool = Pool::new(4 << 20).unwrap();
        assert_eq!(pool.stats().inodes, ROOT_COUNT as u64);

        let st = pool.stat("/").unwrap();
        assert_eq!(st.mode & S_IFMT, S_IFDIR);
        assert_eq!(st.nlink, 3);

        for i in 0..ROOT_COUNT {
            let root = pool.open_root(i).unwrap();
            pool.close(root);
        }
        assert!(matches!(pool.open_root(ROOT_COUNT), Err(Error::Inval)));
    }

    #[test]
    fn image_survives_reopen() {
        let dirp = std::env::temp_dir().join("pmfs-pool-test");
        std::fs::create_dir_all(&dirp).unwrap();
        let img = dirp.join("fs.img");

        let pool = Pool::create_image(&img, 8 << 20).unwrap();
        pool.mkdir("/persisted", 0o755).unwrap();
        pool.sync().unwrap();
        drop(pool);

        let pool = Pool::open_image(&img).unwrap();
        let st = pool.stat("/persisted").unwrap();
        assert_eq!(st.mode & S_IFMT, S_IFDIR);
        std::fs::remove_file(img).ok();
    }

    #[test]
    fn cred_setters() {
        let pool = Pool::new(4 << 20).unwrap();
        let prev = pool.setfsuid(1000);
        assert_eq!(pool.setfsuid(prev), 1000);
        pool.setgroups(&[5, 6]);
        assert_eq!(pool.getgroups(), vec![5, 6]);
        pool.setcap(Caps::CHOWN);
        assert!(pool.cred_snapshot().caps.contains(Caps::CHOWN));
        pool.clrcap(Caps::CHOWN);
        assert!(!pool.cred_snapshot().caps.contains(Caps::CHOWN));
    }

    #[test]
    fn block_size_knob_validates() {
        let pool = Pool::new(4 << 20).unwrap();
        pool.set_block_size(8192).unwrap();
        assert!(matches!(pool.set_block_size(100), Err(Error::Inval)));
        assert!(matches!(
            pool.set_block_size(MAX_BLOCK_SIZE + PAGE_SIZE),
            Err(Error::Inval)
        ));
        pool.set_block_size(0).unwrap();
    }
}
