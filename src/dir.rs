//! The directory engine, and the directory-shaped operations.
//!
//! Directory entries live in a chain of dirent pages: the first page
//! is inline in the inode, overflow pages are separate 4 KiB
//! allocations. Lookup is a linear scan; insert takes the first free
//! slot or chains a new page; remove clears the slot and frees empty
//! pages at the tail of the chain.
//!
//! Every directory carries real `.` and `..` entries, created with it;
//! link counts follow from that (a fresh directory has two links, its
//! parent gains one for the `..` entry).
//!
//! Callers hold the directory's vinode lock across lookups (shared)
//! and mutations (exclusive); mutations additionally run inside a
//! transaction.

use core::mem::{offset_of, size_of};

use zerocopy::FromBytes;

use crate::cred::Want;
use crate::error::{Error, Result};
use crate::file::File;
use crate::inode::{self, InodeWriteGuard};
use crate::layout::{
    Dir, Dirent, Inode, InodeType, Time, ALLPERMS, DIR_HDR, DIR_VERSION,
    INODE_FILE_DATA_OFFSET, METADATA_BLOCK_SIZE, PAGE_DIRENT_CAP, S_IFDIR, S_ISGID,
};
use crate::obj::{Obj, ObjStore, ObjType, Tx};
use crate::path::{self, Path};
use crate::pool::Pool;

/// Location of one dirent slot: the page (offset of its `Dir` header)
/// and the slot index within it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirentSlot {
    pub page: u64,
    pub idx: u32,
}

fn inline_page(tinode: Obj<Inode>) -> u64 {
    tinode.raw() + INODE_FILE_DATA_OFFSET
}

fn page_hdr<'a>(store: &'a ObjStore, page: u64) -> &'a Dir {
    // SAFETY: dir pages are live while linked from a locked directory
    // inode.
    unsafe { store.as_ref(Obj::<Dir>::from_raw(page)) }
}

fn dirents<'a>(store: &'a ObjStore, page: u64) -> &'a [Dirent] {
    let n = page_hdr(store, page).num_elements as usize;
    let bytes = store.bytes(page + DIR_HDR as u64, (n * size_of::<Dirent>()) as u64);
    <[Dirent]>::ref_from_bytes(bytes).expect("dirent page view")
}

fn dirent_off(slot: DirentSlot) -> u64 {
    slot.page + DIR_HDR as u64 + slot.idx as u64 * size_of::<Dirent>() as u64
}

/// Look `name` up in the directory behind `tinode`. The caller holds
/// the directory's vinode lock.
pub(crate) fn lookup_dirent(
    store: &ObjStore,
    tinode: Obj<Inode>,
    name: &[u8],
) -> Option<(Obj<Inode>, DirentSlot)> {
    let mut page = inline_page(tinode);
    while page != 0 {
        for (idx, de) in dirents(store, page).iter().enumerate() {
            if de.inode != 0 && de.name() == name {
                return Some((
                    Obj::from_raw(de.inode),
                    DirentSlot {
                        page,
                        idx: idx as u32,
                    },
                ));
            }
        }
        page = page_hdr(store, page).next;
    }
    None
}

/// Write a dirent into the first free slot, chaining a new page when
/// every slot is taken. The caller has checked for duplicates and
/// holds the directory write lock; `tx` journals everything touched.
pub(crate) fn add_dirent(
    store: &ObjStore,
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    name: &[u8],
    child: Obj<Inode>,
) -> Result<()> {
    let tinode = guard.tinode();
    let slot = match free_slot(store, tinode) {
        Some(slot) => slot,
        None => {
            let last = last_page(store, tinode);
            let page = tx.alloc(ObjType::Dir, METADATA_BLOCK_SIZE as u64)?;
            // SAFETY: freshly allocated page.
            let hdr = unsafe { store.as_mut(Obj::<Dir>::from_raw(page)) };
            hdr.version = DIR_VERSION;
            hdr.num_elements = PAGE_DIRENT_CAP;
            tx.add_range(last + offset_of!(Dir, next) as u64, 8);
            // SAFETY: live page of a write-locked directory.
            unsafe { store.as_mut(Obj::<Dir>::from_raw(last)) }.next = page;
            let size = guard.inode().size();
            guard.set_size(tx, size + METADATA_BLOCK_SIZE as u64);
            DirentSlot { page, idx: 0 }
        }
    };
    write_dirent(store, Some(tx), slot, name, child);
    Ok(())
}

fn write_dirent(store: &ObjStore, tx: Option<&Tx<'_>>, slot: DirentSlot, name: &[u8], child: Obj<Inode>) {
    let off = dirent_off(slot);
    if let Some(tx) = tx {
        tx.add_range(off, size_of::<Dirent>() as u64);
    }
    // SAFETY: the slot belongs to a write-locked (or freshly created)
    // directory.
    let de = unsafe { store.as_mut(Obj::<Dirent>::from_raw(off)) };
    de.inode = child.raw();
    de.set_name(name);
}

fn free_slot(store: &ObjStore, tinode: Obj<Inode>) -> Option<DirentSlot> {
    let mut page = inline_page(tinode);
    while page != 0 {
        for (idx, de) in dirents(store, page).iter().enumerate() {
            if de.inode == 0 {
                return Some(DirentSlot {
                    page,
                    idx: idx as u32,
                });
            }
        }
        page = page_hdr(store, page).next;
    }
    None
}

fn last_page(store: &ObjStore, tinode: Obj<Inode>) -> u64 {
    let mut page = inline_page(tinode);
    loop {
        let next = page_hdr(store, page).next;
        if next == 0 {
            return page;
        }
        page = next;
    }
}

/// Clear one dirent and trim empty overflow pages off the tail of the
/// chain.
pub(crate) fn remove_dirent(
    store: &ObjStore,
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    slot: DirentSlot,
) {
    let off = dirent_off(slot);
    tx.add_range(off, size_of::<Dirent>() as u64);
    // SAFETY: write-locked directory.
    let de = unsafe { store.as_mut(Obj::<Dirent>::from_raw(off)) };
    debug_assert_ne!(de.inode, 0);
    de.inode = 0;
    de.set_name(b"");

    trim_empty_tail(store, tx, guard);
}

fn page_is_empty(store: &ObjStore, page: u64) -> bool {
    dirents(store, page).iter().all(|de| de.inode == 0)
}

fn trim_empty_tail(store: &ObjStore, tx: &Tx<'_>, guard: &mut InodeWriteGuard<'_>) {
    let tinode = guard.tinode();
    let first = inline_page(tinode);

    // last page (inline included) that still holds an entry
    let mut keep = first;
    let mut page = page_hdr(store, first).next;
    while page != 0 {
        if !page_is_empty(store, page) {
            keep = page;
        }
        page = page_hdr(store, page).next;
    }

    let mut doomed = page_hdr(store, keep).next;
    if doomed == 0 {
        return;
    }
    tx.add_range(keep + offset_of!(Dir, next) as u64, 8);
    // SAFETY: write-locked directory.
    unsafe { store.as_mut(Obj::<Dir>::from_raw(keep)) }.next = 0;

    let mut freed = 0u64;
    while doomed != 0 {
        let next = page_hdr(store, doomed).next;
        tx.free(doomed);
        freed += METADATA_BLOCK_SIZE as u64;
        doomed = next;
    }
    let size = guard.inode().size();
    guard.set_size(tx, size - freed);
}

/// Is the directory empty apart from `.` and `..`?
pub(crate) fn dir_is_empty(store: &ObjStore, tinode: Obj<Inode>) -> bool {
    let mut page = inline_page(tinode);
    while page != 0 {
        for de in dirents(store, page) {
            if de.inode != 0 && de.name() != b"." && de.name() != b".." {
                return false;
            }
        }
        page = page_hdr(store, page).next;
    }
    true
}

/// Free all overflow pages; used when reclaiming a directory inode.
pub(crate) fn free_dir_pages(store: &ObjStore, tx: &Tx<'_>, tinode: Obj<Inode>) {
    let mut page = page_hdr(store, inline_page(tinode)).next;
    while page != 0 {
        let next = page_hdr(store, page).next;
        tx.free(page);
        page = next;
    }
}

/// Write the `.` and `..` entries of a directory created in this
/// transaction. The inode is fresh, so nothing needs journaling.
pub(crate) fn init_dot_entries(store: &ObjStore, child: Obj<Inode>, parent: Obj<Inode>) {
    let page = inline_page(child);
    write_dirent(store, None, DirentSlot { page, idx: 0 }, b".", child);
    write_dirent(store, None, DirentSlot { page, idx: 1 }, b"..", parent);
}

/// One entry as returned by [`Pool::getdents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub typ: InodeType,
    pub name: String,
}

impl Pool {
    pub fn mkdir(&self, pathname: &str, mode: u64) -> Result<()> {
        self.mkdirat(None, pathname, mode)
    }

    pub fn mkdirat(&self, dirfd: Option<&File>, pathname: &str, mode: u64) -> Result<()> {
        log::debug!("mkdir path {:?} mode {:o}", pathname, mode);
        let cred = self.cred_snapshot();
        let path = Path::new(pathname);
        let at = self.at_dir(dirfd, path)?;
        let mut chase = 0;
        let info = path::resolve_parent(self, &cred, at, path, &mut chase)?;
        let name = info.name.clone();
        let parent = scopeguard::guard(info.parent, |p| p.unref(self));
        if name.is_empty() {
            return Err(Error::Exists);
        }

        let mode = mode & ALLPERMS;
        let mut guard = parent.write(&self.store);
        {
            let inode = guard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        if lookup_dirent(&self.store, guard.tinode(), &name).is_some() {
            return Err(Error::Exists);
        }

        let tx = self.store.tx_begin();
        let t = Time::now();

        // a setgid parent hands its group (and the bit) down
        let (gid, mode) = if guard.inode().mode() & S_ISGID != 0 {
            (guard.inode().gid, mode | S_ISGID)
        } else {
            (cred.fsgid, mode)
        };

        let child = inode::inode_alloc(&self.store, &tx, &cred, S_IFDIR | mode, gid, t)?;
        init_dot_entries(&self.store, child, guard.tinode());
        // two links: the parent's entry and the directory's own `.`
        // SAFETY: `child` is fresh; nothing else references it.
        unsafe { self.store.as_mut(child) }.set_nlink(2);

        add_dirent(&self.store, &tx, &mut guard, &name, child)?;
        let nlink = guard.inode().nlink();
        guard.set_nlink(&tx, nlink + 1); // the child's `..`
        guard.set_mtime(&tx, t);
        guard.set_ctime(&tx, t);
        tx.commit();
        Ok(())
    }

    pub fn rmdir(&self, pathname: &str) -> Result<()> {
        self.rmdirat(None, pathname)
    }

    pub(crate) fn rmdirat(&self, dirfd: Option<&File>, pathname: &str) -> Result<()> {
        log::debug!("rmdir path {:?}", pathname);
        let cred = self.cred_snapshot();
        let path = Path::new(pathname);
        let at = self.at_dir(dirfd, path)?;
        let mut chase = 0;
        let info = path::resolve_parent(self, &cred, at, path, &mut chase)?;
        let name = info.name.clone();
        let parent = scopeguard::guard(info.parent, |p| p.unref(self));
        if name.is_empty() {
            return Err(Error::Inval); // removing a root
        }
        if name == b"." {
            return Err(Error::Inval);
        }
        if name == b".." {
            return Err(Error::NotEmpty);
        }

        let mut pguard = parent.write(&self.store);
        {
            let inode = pguard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        let Some((tinode, slot)) = lookup_dirent(&self.store, pguard.tinode(), &name) else {
            return Err(Error::NoEntry);
        };
        let child = scopeguard::guard(self.inode_map.intern(&self.store, tinode), |c| {
            c.unref(self)
        });
        if !child.is_dir() {
            return Err(Error::NotDir);
        }

        let mut cguard = child.write(&self.store);
        if !dir_is_empty(&self.store, cguard.tinode()) {
            return Err(Error::NotEmpty);
        }

        let tx = self.store.tx_begin();
        let t = Time::now();
        remove_dirent(&self.store, &tx, &mut pguard, slot);
        let nlink = pguard.inode().nlink();
        pguard.set_nlink(&tx, nlink - 1); // the child's `..` is gone
        pguard.set_mtime(&tx, t);
        pguard.set_ctime(&tx, t);

        // the parent's entry and the dying `.` both stop counting
        let nlink = cguard.inode().nlink();
        cguard.set_nlink(&tx, nlink - 2);
        cguard.set_ctime(&tx, t);
        inode::vinode_orphan(self, &tx, &child, &mut cguard)?;
        tx.commit();
        drop(cguard);
        drop(pguard);
        Ok(())
    }

    /// Read directory entries starting at the handle's current
    /// position; at most `max` of them. The handle offset counts
    /// entries, not bytes.
    pub fn getdents(&self, file: &File, max: usize) -> Result<Vec<DirEntry>> {
        if file.is_path_handle() {
            return Err(Error::BadFd);
        }
        if !file.vinode().is_dir() {
            return Err(Error::NotDir);
        }

        let mut state = file.lock_state();
        let guard = file.vinode().read(&self.store);
        let mut out = Vec::new();
        let mut index = 0u64;
        let mut page = inline_page(guard.vinode().tinode);
        'pages: while page != 0 {
            for de in dirents(&self.store, page) {
                if de.inode == 0 {
                    continue;
                }
                if index >= state.offset && out.len() < max {
                    // SAFETY: the child inode is live (referenced by
                    // this dirent); the type bits never change.
                    let typ = unsafe { self.store.as_ref(Obj::<Inode>::from_raw(de.inode)) }
                        .typ()
                        .expect("corrupt inode: no type bits");
                    out.push(DirEntry {
                        ino: de.inode,
                        typ,
                        name: String::from_utf8_lossy(de.name()).into_owned(),
                    });
                }
                index += 1;
                if out.len() == max && index > state.offset {
                    break 'pages;
                }
            }
            page = page_hdr(&self.store, page).next;
        }
        state.offset += out.len() as u64;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn dirent_chain_grows_and_shrinks() {
        let pool = Pool::new(8 << 20).unwrap();
        // enough entries to spill out of the 14-slot inline page
        for i in 0..40 {
            pool.mkdir(&format!("/d{}", i), 0o755).unwrap();
        }
        let before = pool.stats();
        assert!(before.dirs > 0, "overflow dirent pages were chained");

        for i in 0..40 {
            pool.rmdir(&format!("/d{}", i)).unwrap();
        }
        let after = pool.stats();
        assert_eq!(after.dirs, 0, "empty tail pages were freed");
        assert_eq!(after.inodes, crate::layout::ROOT_COUNT as u64);
    }

    #[test]
    fn rmdir_refuses_non_empty_and_dots() {
        let pool = Pool::new(8 << 20).unwrap();
        pool.mkdir("/a", 0o755).unwrap();
        pool.mkdir("/a/b", 0o755).unwrap();

        assert!(matches!(pool.rmdir("/a"), Err(Error::NotEmpty)));
        assert!(matches!(pool.rmdir("/a/."), Err(Error::Inval)));
        assert!(matches!(pool.rmdir("/a/b/.."), Err(Error::NotEmpty)));

        pool.rmdir("/a/b").unwrap();
        pool.rmdir("/a").unwrap();
    }
}
