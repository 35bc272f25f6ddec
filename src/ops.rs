//! Name-space and metadata operations: link, unlink, rename, symlink,
//! readlink, chmod, chown, the stat family, and chdir.
//!
//! Every operation follows the same shape: snapshot credentials,
//! resolve names, take the write locks on the vinodes involved
//! (parents before children, each level in ascending vinode address
//! order), then perform the whole on-media mutation inside one
//! transaction. Failures abort the transaction, which rolls the media
//! back and releases anything it enlisted.

use crate::cred::{Caps, Cred, Want};
use crate::dir;
use crate::error::{Error, Result};
use crate::file::File;
use crate::inode::{self, VinodeRef};
use crate::layout::{Time, ALLPERMS, IN_INODE_STORAGE, PAGE_SIZE, S_IFLNK, S_ISGID, S_LONGSYMLINK};
use crate::obj::ObjType;
use crate::path::{self, Path};
use crate::pool::Pool;
use crate::stat::Stat;

impl Pool {
    pub fn stat(&self, pathname: &str) -> Result<Stat> {
        self.fstatat(None, pathname, true)
    }

    pub fn lstat(&self, pathname: &str) -> Result<Stat> {
        self.fstatat(None, pathname, false)
    }

    pub fn fstatat(&self, dirfd: Option<&File>, pathname: &str, follow: bool) -> Result<Stat> {
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(dirfd, pathp)?;
        let vinode = path::namei(self, &cred, at, pathp, follow)?;
        let stat = self.vinode_stat(&vinode);
        vinode.unref(self);
        Ok(stat)
    }

    pub fn fstat(&self, file: &File) -> Stat {
        self.vinode_stat(file.vinode())
    }

    fn vinode_stat(&self, vinode: &VinodeRef) -> Stat {
        let guard = vinode.read(&self.store);
        let inode = guard.inode();
        Stat {
            ino: vinode.tinode.raw(),
            mode: inode.mode(),
            nlink: inode.nlink(),
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size(),
            blksize: PAGE_SIZE,
            blocks: inode.allocated_space() / 512,
            atime: inode.atime(),
            mtime: inode.mtime(),
            ctime: inode.ctime(),
        }
    }

    pub fn chmod(&self, pathname: &str, mode: u64) -> Result<()> {
        self.fchmodat(None, pathname, mode)
    }

    pub fn fchmodat(&self, dirfd: Option<&File>, pathname: &str, mode: u64) -> Result<()> {
        log::debug!("chmod path {:?} mode {:o}", pathname, mode);
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(dirfd, pathp)?;
        let vinode = path::namei(self, &cred, at, pathp, true)?;
        let vinode = scopeguard::guard(vinode, |v| v.unref(self));
        self.vinode_chmod(&cred, &vinode, mode)
    }

    pub fn fchmod(&self, file: &File, mode: u64) -> Result<()> {
        if file.is_path_handle() {
            return Err(Error::BadFd);
        }
        let cred = self.cred_snapshot();
        self.vinode_chmod(&cred, file.vinode(), mode)
    }

    fn vinode_chmod(&self, cred: &Cred, vinode: &VinodeRef, mode: u64) -> Result<()> {
        let mode = mode & ALLPERMS;
        let mut guard = vinode.write(&self.store);
        if guard.inode().uid != cred.fsuid && !cred.caps.contains(Caps::FOWNER) {
            return Err(Error::Perm);
        }

        let tx = self.store.tx_begin();
        let mut flags = (guard.inode().flags_word() & !ALLPERMS) | mode;
        // without membership of the file's group the setgid bit does
        // not survive a chmod
        if guard.inode().gid != cred.fsgid
            && !cred.gid_in_list(guard.inode().gid)
            && !cred.caps.contains(Caps::FSETID)
        {
            flags &= !S_ISGID;
        }
        guard.set_flags_word(&tx, flags);
        guard.set_ctime(&tx, Time::now());
        tx.commit();
        Ok(())
    }

    pub fn chown(&self, pathname: &str, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        self.fchownat(None, pathname, owner, group, true)
    }

    pub fn lchown(&self, pathname: &str, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        self.fchownat(None, pathname, owner, group, false)
    }

    pub fn fchownat(
        &self,
        dirfd: Option<&File>,
        pathname: &str,
        owner: Option<u32>,
        group: Option<u32>,
        follow: bool,
    ) -> Result<()> {
        log::debug!("chown path {:?} owner {:?} group {:?}", pathname, owner, group);
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(dirfd, pathp)?;
        let vinode = path::namei(self, &cred, at, pathp, follow)?;
        let vinode = scopeguard::guard(vinode, |v| v.unref(self));
        self.vinode_chown(&cred, &vinode, owner, group)
    }

    pub fn fchown(&self, file: &File, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        if file.is_path_handle() {
            return Err(Error::BadFd);
        }
        let cred = self.cred_snapshot();
        self.vinode_chown(&cred, file.vinode(), owner, group)
    }

    fn vinode_chown(
        &self,
        cred: &Cred,
        vinode: &VinodeRef,
        owner: Option<u32>,
        group: Option<u32>,
    ) -> Result<()> {
        let mut guard = vinode.write(&self.store);
        let (uid, gid) = (guard.inode().uid, guard.inode().gid);

        if let Some(new_uid) = owner {
            // only CAP_CHOWN may hand a file to another owner
            if new_uid != uid && !cred.caps.contains(Caps::CHOWN) {
                return Err(Error::Perm);
            }
        }
        if let Some(new_gid) = group {
            if new_gid != gid && !cred.caps.contains(Caps::CHOWN) {
                // the owner may switch the file between their own groups
                if uid != cred.fsuid || !cred.in_groups(new_gid) {
                    return Err(Error::Perm);
                }
            }
        }

        let new_uid = owner.unwrap_or(uid);
        let new_gid = group.unwrap_or(gid);
        if new_uid == uid && new_gid == gid {
            return Ok(());
        }

        let tx = self.store.tx_begin();
        guard.add_head(&tx);
        {
            let inode = guard.inode_mut();
            inode.uid = new_uid;
            inode.gid = new_gid;
        }
        guard.set_ctime(&tx, Time::now());
        tx.commit();
        Ok(())
    }

    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.linkat(None, oldpath, None, newpath, false)
    }

    pub fn linkat(
        &self,
        olddir: Option<&File>,
        oldpath: &str,
        newdir: Option<&File>,
        newpath: &str,
        follow: bool,
    ) -> Result<()> {
        log::debug!("link oldpath {:?} newpath {:?}", oldpath, newpath);
        let cred = self.cred_snapshot();

        let oldp = Path::new(oldpath);
        let at = self.at_dir(olddir, oldp)?;
        let src = path::namei(self, &cred, at, oldp, follow)?;
        let src = scopeguard::guard(src, |v| v.unref(self));
        if src.is_dir() {
            return Err(Error::Perm);
        }

        let newp = Path::new(newpath);
        let at = self.at_dir(newdir, newp)?;
        let mut chase = 0;
        let info = path::resolve_parent(self, &cred, at, newp, &mut chase)?;
        let name = info.name.clone();
        let parent = scopeguard::guard(info.parent, |p| p.unref(self));
        if name.is_empty() {
            return Err(Error::Exists);
        }

        let mut pguard = parent.write(&self.store);
        {
            let inode = pguard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        if dir::lookup_dirent(&self.store, pguard.tinode(), &name).is_some() {
            return Err(Error::Exists);
        }

        let mut sguard = src.write(&self.store);
        let tx = self.store.tx_begin();
        let t = Time::now();
        dir::add_dirent(&self.store, &tx, &mut pguard, &name, sguard.tinode())?;
        let nlink = sguard.inode().nlink();
        sguard.set_nlink(&tx, nlink + 1);
        sguard.set_ctime(&tx, t);
        pguard.set_mtime(&tx, t);
        pguard.set_ctime(&tx, t);
        tx.commit();
        drop(sguard);
        drop(pguard);

        src.set_debug_path(Some(&*parent), &name);
        Ok(())
    }

    pub fn unlink(&self, pathname: &str) -> Result<()> {
        self.unlinkat(None, pathname, false)
    }

    /// `remove_dir` mirrors `AT_REMOVEDIR`.
    pub fn unlinkat(&self, dirfd: Option<&File>, pathname: &str, remove_dir: bool) -> Result<()> {
        if remove_dir {
            return self.rmdirat(dirfd, pathname);
        }
        log::debug!("unlink path {:?}", pathname);
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(dirfd, pathp)?;
        let mut chase = 0;
        let info = path::resolve_parent(self, &cred, at, pathp, &mut chase)?;
        let name = info.name.clone();
        let parent = scopeguard::guard(info.parent, |p| p.unref(self));
        if name.is_empty() {
            return Err(Error::IsDir);
        }

        let mut pguard = parent.write(&self.store);
        {
            let inode = pguard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        let Some((tinode, slot)) = dir::lookup_dirent(&self.store, pguard.tinode(), &name) else {
            return Err(Error::NoEntry);
        };
        let child = scopeguard::guard(self.inode_map.intern(&self.store, tinode), |c| {
            c.unref(self)
        });
        if child.is_dir() {
            return Err(Error::IsDir);
        }
        if info.wants_dir {
            return Err(Error::NotDir);
        }

        let mut cguard = child.write(&self.store);
        let tx = self.store.tx_begin();
        let t = Time::now();
        dir::remove_dirent(&self.store, &tx, &mut pguard, slot);
        pguard.set_mtime(&tx, t);
        pguard.set_ctime(&tx, t);
        let nlink = cguard.inode().nlink() - 1;
        cguard.set_nlink(&tx, nlink);
        cguard.set_ctime(&tx, t);
        if nlink == 0 {
            // still open somewhere (at least by us); park it on the
            // orphan list until the last reference goes away
            inode::vinode_orphan(self, &tx, &child, &mut cguard)?;
        }
        tx.commit();
        drop(cguard);
        drop(pguard);
        Ok(())
    }

    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.renameat2(None, oldpath, None, newpath, 0)
    }

    pub fn renameat(
        &self,
        olddir: Option<&File>,
        oldpath: &str,
        newdir: Option<&File>,
        newpath: &str,
    ) -> Result<()> {
        self.renameat2(olddir, oldpath, newdir, newpath, 0)
    }

    pub fn renameat2(
        &self,
        olddir: Option<&File>,
        oldpath: &str,
        newdir: Option<&File>,
        newpath: &str,
        flags: u32,
    ) -> Result<()> {
        log::debug!("rename oldpath {:?} newpath {:?}", oldpath, newpath);
        if flags != 0 {
            return Err(Error::Inval);
        }
        let cred = self.cred_snapshot();

        let oldp = Path::new(oldpath);
        let at = self.at_dir(olddir, oldp)?;
        let mut chase = 0;
        let src = path::resolve_parent(self, &cred, at, oldp, &mut chase)?;
        let src_name = src.name.clone();
        let src_parent = scopeguard::guard(src.parent, |p| p.unref(self));

        let newp = Path::new(newpath);
        let at = self.at_dir(newdir, newp)?;
        let mut chase = 0;
        let dst = path::resolve_parent(self, &cred, at, newp, &mut chase)?;
        let dst_name = dst.name.clone();
        let dst_parent = scopeguard::guard(dst.parent, |p| p.unref(self));

        if src_name.is_empty() || dst_name.is_empty() {
            return Err(Error::Inval); // renaming a root, or onto one
        }

        // both parents write-locked, in ascending address order, then
        // bound to their src/dst roles
        let same_parent = src_parent.same_as(&dst_parent);
        let mut src_guard;
        let mut dst_guard = None;
        if same_parent {
            src_guard = src_parent.write(&self.store);
        } else if src_parent.addr() < dst_parent.addr() {
            src_guard = src_parent.write(&self.store);
            dst_guard = Some(dst_parent.write(&self.store));
        } else {
            let dguard = dst_parent.write(&self.store);
            src_guard = src_parent.write(&self.store);
            dst_guard = Some(dguard);
        }

        {
            let inode = src_guard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        if let Some(dguard) = &dst_guard {
            let inode = dguard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }

        let Some((src_tinode, src_slot)) =
            dir::lookup_dirent(&self.store, src_guard.tinode(), &src_name)
        else {
            return Err(Error::NoEntry);
        };
        let src_vinode = scopeguard::guard(self.inode_map.intern(&self.store, src_tinode), |v| {
            v.unref(self)
        });
        if src_vinode.is_dir() {
            log::debug!("renaming directories is not supported");
            return Err(Error::NotSup);
        }

        let dst_dir_tinode = dst_guard
            .as_ref()
            .map(|g| g.tinode())
            .unwrap_or_else(|| src_guard.tinode());
        let dst_found = dir::lookup_dirent(&self.store, dst_dir_tinode, &dst_name);
        if let Some((tinode, _)) = dst_found {
            if tinode == src_tinode {
                // both names are links to the same inode: done
                return Ok(());
            }
        }
        let dst_vinode = dst_found.map(|(tinode, slot)| {
            (
                scopeguard::guard(self.inode_map.intern(&self.store, tinode), |v| v.unref(self)),
                slot,
            )
        });
        if let Some((v, _)) = &dst_vinode {
            if v.is_dir() {
                return Err(Error::IsDir);
            }
        }

        let tx = self.store.tx_begin();
        let t = Time::now();
        {
            let dst_dir = match dst_guard.as_mut() {
                Some(g) => g,
                None => &mut src_guard,
            };

            // dislodge the target, if any
            if let Some((v, slot)) = &dst_vinode {
                let mut vguard = v.write(&self.store);
                dir::remove_dirent(&self.store, &tx, dst_dir, *slot);
                let nlink = vguard.inode().nlink() - 1;
                vguard.set_nlink(&tx, nlink);
                vguard.set_ctime(&tx, t);
                if nlink == 0 {
                    inode::vinode_orphan(self, &tx, v, &mut vguard)?;
                }
            }

            dir::add_dirent(&self.store, &tx, dst_dir, &dst_name, src_tinode)?;
            dst_dir.set_mtime(&tx, t);
            dst_dir.set_ctime(&tx, t);
        }

        // the slot captured above is still the source's: inserting
        // never reuses an occupied slot
        dir::remove_dirent(&self.store, &tx, &mut src_guard, src_slot);
        src_guard.set_mtime(&tx, t);
        src_guard.set_ctime(&tx, t);
        {
            let mut vguard = src_vinode.write(&self.store);
            vguard.set_ctime(&tx, t);
        }
        tx.commit();

        src_vinode.set_debug_path(Some(&*dst_parent), &dst_name);
        Ok(())
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        self.symlinkat(target, None, linkpath)
    }

    pub fn symlinkat(&self, target: &str, dirfd: Option<&File>, linkpath: &str) -> Result<()> {
        log::debug!("symlink target {:?} linkpath {:?}", target, linkpath);
        if target.is_empty() {
            return Err(Error::NoEntry);
        }
        let cred = self.cred_snapshot();
        let pathp = Path::new(linkpath);
        let at = self.at_dir(dirfd, pathp)?;
        let mut chase = 0;
        let info = path::resolve_parent(self, &cred, at, pathp, &mut chase)?;
        let name = info.name.clone();
        let parent = scopeguard::guard(info.parent, |p| p.unref(self));
        if name.is_empty() {
            return Err(Error::Exists);
        }
        // one block is the most a target may take
        if target.len() as u64 + 1 > PAGE_SIZE {
            return Err(Error::NameTooLong);
        }

        let tx = self.store.tx_begin();
        let mut pguard = inode::tx_write(&tx, &self.store, &parent);
        {
            let inode = pguard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        if dir::lookup_dirent(&self.store, pguard.tinode(), &name).is_some() {
            return Err(Error::Exists);
        }

        let t = Time::now();
        let gid = if pguard.inode().mode() & S_ISGID != 0 {
            pguard.inode().gid
        } else {
            cred.fsgid
        };
        let tinode = inode::inode_alloc(&self.store, &tx, &cred, S_IFLNK | 0o777, gid, t)?;
        // SAFETY: fresh inode, nothing else references it.
        let inode = unsafe { self.store.as_mut(tinode) };
        if target.len() < IN_INODE_STORAGE {
            inode.file_data[..target.len()].copy_from_slice(target.as_bytes());
        } else {
            let block = tx.alloc(ObjType::Data, PAGE_SIZE)?;
            self.store.memcpy_persist(block, target.as_bytes());
            inode.set_long_symlink(block);
            inode.set_flags_word(S_IFLNK | 0o777 | S_LONGSYMLINK);
        }
        inode.set_size(target.len() as u64);
        inode.set_nlink(1);

        dir::add_dirent(&self.store, &tx, &mut pguard, &name, tinode)?;
        pguard.set_mtime(&tx, t);
        pguard.set_ctime(&tx, t);
        pguard.unlock_on_commit(&tx);
        tx.commit();
        Ok(())
    }

    pub fn readlink(&self, pathname: &str) -> Result<String> {
        self.readlinkat(None, pathname)
    }

    pub fn readlinkat(&self, dirfd: Option<&File>, pathname: &str) -> Result<String> {
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(dirfd, pathp)?;
        let vinode = path::namei(self, &cred, at, pathp, false)?;
        let vinode = scopeguard::guard(vinode, |v| v.unref(self));
        if !vinode.is_symlink() {
            return Err(Error::Inval);
        }
        let target = {
            let guard = vinode.read(&self.store);
            guard.symlink_target()
        };
        Ok(String::from_utf8_lossy(&target).into_owned())
    }

    pub fn chdir(&self, pathname: &str) -> Result<()> {
        log::debug!("chdir path {:?}", pathname);
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(None, pathp)?;
        let vinode = path::namei(self, &cred, at, pathp, true)?;
        if !vinode.is_dir() {
            vinode.unref(self);
            return Err(Error::NotDir);
        }
        {
            let guard = vinode.read(&self.store);
            let inode = guard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::EXECUTE) {
                drop(guard);
                vinode.unref(self);
                return Err(Error::Access);
            }
        }
        let old = {
            let mut cwd = self.cwd.write();
            core::mem::replace(&mut *cwd, vinode)
        };
        old.unref(self);
        Ok(())
    }
}

