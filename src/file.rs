//! Open files: the handle type, the open(2) state machine, and the
//! data-path entry points (read/write/lseek/fallocate/ftruncate).
//!
//! A handle owns one vinode reference for its whole lifetime and keeps
//! its own mutable state (current offset, last-block cache) behind a
//! mutex, so operations on a single handle serialise among themselves
//! while different handles to the same file only meet at the vinode
//! rwlock.

use parking_lot::{Mutex, MutexGuard};

use crate::cred::{Cred, Want};
use crate::data;
use crate::dir;
use crate::error::{Error, Result};
use crate::inode::{self, InodeWriteGuard, VinodeRef};
use crate::layout::{Time, ALLPERMS, S_IFREG, S_ISGID};
use crate::path::{self, Path};
use crate::pool::Pool;

bitflags::bitflags! {
    /// open(2)-shaped flags. The numeric values follow the Linux ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const ACCMODE = 0o3;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW = 0o400000;
        const NOATIME = 0o1000000;
        const PATH = 0o10000000;
        /// Contains DIRECTORY, as in the kernel ABI.
        const TMPFILE = 0o20000000 | 0o200000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    fn is_tmpfile(self) -> bool {
        self.contains(OpenFlags::TMPFILE)
    }

    fn accmode(self) -> u32 {
        self.bits() & OpenFlags::ACCMODE.bits()
    }

    fn wants_read(self) -> bool {
        matches!(self.accmode(), 0o0 | 0o2)
    }

    fn wants_write(self) -> bool {
        matches!(self.accmode(), 0o1 | 0o2)
    }
}

bitflags::bitflags! {
    /// Per-handle mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FileFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const NOATIME = 1 << 2;
        const APPEND = 1 << 3;
        const PATH = 1 << 4;
    }
}

pub(crate) struct FileState {
    pub offset: u64,
    /// Last block touched through this handle; a lookup starting
    /// point only.
    pub block_cache: u64,
}

/// An open file. Returned by the open family and consumed by
/// [`Pool::close`]; dropping a handle without closing it leaks its
/// vinode reference, as in the C library.
pub struct File {
    vinode: VinodeRef,
    flags: FileFlags,
    state: Mutex<FileState>,
}

impl File {
    fn new(vinode: VinodeRef, flags: FileFlags) -> Self {
        Self {
            vinode,
            flags,
            state: Mutex::new(FileState {
                offset: 0,
                block_cache: 0,
            }),
        }
    }

    pub(crate) fn new_path_handle(vinode: VinodeRef) -> Self {
        Self::new(vinode, FileFlags::PATH)
    }

    pub(crate) fn vinode(&self) -> &VinodeRef {
        &self.vinode
    }

    pub(crate) fn is_path_handle(&self) -> bool {
        self.flags.contains(FileFlags::PATH)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }
}

/// Seek anchors, SEEK_DATA/SEEK_HOLE included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
    Data,
    Hole,
}

bitflags::bitflags! {
    /// fallocate(2) mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FallocateMode: u32 {
        const KEEP_SIZE = 1;
        const PUNCH_HOLE = 2;
    }
}

fn file_flags(flags: OpenFlags) -> FileFlags {
    if flags.contains(OpenFlags::PATH) {
        return FileFlags::PATH;
    }
    let mut out = FileFlags::empty();
    if flags.wants_read() {
        out |= FileFlags::READ;
    }
    if flags.wants_write() {
        out |= FileFlags::WRITE;
    }
    if flags.contains(OpenFlags::NOATIME) {
        out |= FileFlags::NOATIME;
    }
    if flags.contains(OpenFlags::APPEND) {
        out |= FileFlags::APPEND;
    }
    out
}

impl Pool {
    pub fn open(&self, pathname: &str, flags: OpenFlags, mode: u64) -> Result<File> {
        self.openat(None, pathname, flags, mode)
    }

    /// `creat(2)`: create-or-truncate for writing.
    pub fn create(&self, pathname: &str, mode: u64) -> Result<File> {
        self.open(
            pathname,
            OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC,
            mode,
        )
    }

    pub fn openat(
        &self,
        dirfd: Option<&File>,
        pathname: &str,
        flags: OpenFlags,
        mode: u64,
    ) -> Result<File> {
        log::debug!("open path {:?} flags {:?}", pathname, flags);
        let mode = mode & ALLPERMS;
        let cred = self.cred_snapshot();
        let pathp = Path::new(pathname);
        let at = self.at_dir(dirfd, pathp)?;
        let mut chase = 0;
        let mut info = path::resolve_parent(self, &cred, at, pathp, &mut chase)?;

        // resolve the final component, following symlinks per flags
        let vinode: Option<VinodeRef> = loop {
            if info.name.is_empty() {
                break Some(info.parent.clone());
            }
            let found = {
                let guard = info.parent.read(&self.store);
                dir::lookup_dirent(&self.store, guard.vinode().tinode, &info.name)
            };
            let Some((tinode, _)) = found else {
                break None;
            };
            let child = self.inode_map.intern(&self.store, tinode);
            if child.is_symlink() && !flags.contains(OpenFlags::PATH) {
                // CREAT|EXCL does not follow: open fails on the link
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    break Some(child);
                }
                if flags.contains(OpenFlags::NOFOLLOW) {
                    child.unref(self);
                    info.parent.unref(self);
                    return Err(Error::Loop);
                }
                chase += 1;
                if chase > path::SYMLOOP_MAX {
                    child.unref(self);
                    info.parent.unref(self);
                    return Err(Error::Loop);
                }
                let target = {
                    let guard = child.read(&self.store);
                    guard.symlink_target()
                };
                child.unref(self);
                let parent = info.parent;
                info = path::resolve_parent(
                    self,
                    &cred,
                    parent,
                    Path::from_bytes(&target),
                    &mut chase,
                )?;
                continue;
            }
            break Some(child);
        };

        let result = self.openat_resolved(&cred, flags, mode, &info, vinode.as_ref());
        if let Some(v) = vinode {
            v.unref(self);
        }
        info.parent.unref(self);
        result
    }

    /// The open(2) decision table, after name resolution.
    fn openat_resolved(
        &self,
        cred: &Cred,
        flags: OpenFlags,
        mode: u64,
        info: &path::PathInfo,
        vinode: Option<&VinodeRef>,
    ) -> Result<File> {
        if flags.is_tmpfile() {
            let Some(dir) = vinode else {
                return Err(Error::NoEntry);
            };
            if !dir.is_dir() {
                return Err(Error::NotDir);
            }
            if !flags.wants_write() {
                return Err(Error::Inval);
            }
            return self.open_tmpfile(cred, flags, mode, dir);
        }

        match vinode {
            None => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(Error::NoEntry);
                }
                if info.wants_dir {
                    return Err(Error::IsDir);
                }
                self.open_create(cred, flags, mode, info)
            }
            Some(v) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(Error::Exists);
                }
                self.open_existing(cred, flags, v, info.wants_dir)
            }
        }
    }

    /// Create the file under the parent's write lock, inside one
    /// transaction, then open it.
    fn open_create(
        &self,
        cred: &Cred,
        flags: OpenFlags,
        mode: u64,
        info: &path::PathInfo,
    ) -> Result<File> {
        let tx = self.store.tx_begin();
        let mut pguard = inode::tx_write(&tx, &self.store, &info.parent);
        {
            let inode = pguard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        // the earlier lookup ran before we held the lock
        if let Some((tinode, _)) = dir::lookup_dirent(&self.store, pguard.tinode(), &info.name) {
            drop(tx); // releases the parent lock
            let v = self.inode_map.intern(&self.store, tinode);
            if flags.contains(OpenFlags::EXCL) {
                v.unref(self);
                return Err(Error::Exists);
            }
            let out = self.open_existing(cred, flags, &v, info.wants_dir);
            v.unref(self);
            return out;
        }

        let t = Time::now();
        let (gid, mode) = if pguard.inode().mode() & S_ISGID != 0 {
            (pguard.inode().gid, mode)
        } else {
            (cred.fsgid, mode)
        };
        let child = inode::inode_alloc(&self.store, &tx, cred, S_IFREG | mode, gid, t)?;
        // SAFETY: fresh inode, not yet referenced by anything else.
        unsafe { self.store.as_mut(child) }.set_nlink(1);
        dir::add_dirent(&self.store, &tx, &mut pguard, &info.name, child)?;
        pguard.set_mtime(&tx, t);
        pguard.set_ctime(&tx, t);
        pguard.unlock_on_commit(&tx);
        tx.commit();

        let vinode = self.inode_map.intern(&self.store, child);
        vinode.set_debug_path(Some(&info.parent), &info.name);
        Ok(File::new(vinode, file_flags(flags)))
    }

    /// Open an anonymous file: a fresh inode that starts life on the
    /// orphan list instead of in a directory.
    fn open_tmpfile(
        &self,
        cred: &Cred,
        flags: OpenFlags,
        mode: u64,
        parent: &VinodeRef,
    ) -> Result<File> {
        {
            let guard = parent.read(&self.store);
            let inode = guard.inode();
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), Want::WRITE | Want::EXECUTE) {
                return Err(Error::Access);
            }
        }
        let gid = {
            let guard = parent.read(&self.store);
            if guard.inode().mode() & S_ISGID != 0 {
                guard.inode().gid
            } else {
                cred.fsgid
            }
        };

        let tx = self.store.tx_begin();
        let t = Time::now();
        let child = inode::inode_alloc(&self.store, &tx, cred, S_IFREG | mode, gid, t)?;
        let slot = inode::orphan_new_inode(self, &tx, child)?;
        tx.commit();

        let vinode = self.inode_map.intern(&self.store, child);
        vinode.set_orphan_slot(slot);
        Ok(File::new(vinode, file_flags(flags)))
    }

    fn open_existing(
        &self,
        cred: &Cred,
        flags: OpenFlags,
        vinode: &VinodeRef,
        wants_dir: bool,
    ) -> Result<File> {
        if flags.contains(OpenFlags::PATH) {
            return Ok(File::new(vinode.clone(), FileFlags::PATH));
        }
        if (flags.contains(OpenFlags::DIRECTORY) || wants_dir) && !vinode.is_dir() {
            return Err(Error::NotDir);
        }
        if vinode.is_dir() && flags.wants_write() {
            return Err(Error::IsDir);
        }

        {
            let guard = vinode.read(&self.store);
            let inode = guard.inode();
            let mut want = Want::empty();
            if flags.wants_read() {
                want |= Want::READ;
            }
            if flags.wants_write() {
                want |= Want::WRITE;
            }
            if !cred.can_access(inode.uid, inode.gid, inode.mode(), want) {
                return Err(Error::Access);
            }
        }

        if flags.contains(OpenFlags::TRUNC) && vinode.is_regular() {
            if !flags.wants_write() {
                log::debug!("O_TRUNC without write permissions");
                return Err(Error::Access);
            }
            let tx = self.store.tx_begin();
            let mut guard = inode::tx_write(&tx, &self.store, vinode);
            data::truncate(self, &tx, &mut guard, 0)?;
            guard.unlock_on_commit(&tx);
            tx.commit();
        }

        Ok(File::new(vinode.clone(), file_flags(flags)))
    }

    pub fn close(&self, file: File) {
        log::debug!("close inode {:?} path {}", file.vinode.tinode, file.vinode.debug_path());
        file.vinode.unref(self);
    }

    /// The open-mode flags of a handle, fcntl(F_GETFL)-style.
    pub fn fcntl_getfl(&self, file: &File) -> OpenFlags {
        let mut out = OpenFlags::RDONLY;
        if file.flags.contains(FileFlags::PATH) {
            return OpenFlags::PATH;
        }
        if file.flags.contains(FileFlags::READ | FileFlags::WRITE) {
            out |= OpenFlags::RDWR;
        } else if file.flags.contains(FileFlags::WRITE) {
            out |= OpenFlags::WRONLY;
        }
        if file.flags.contains(FileFlags::APPEND) {
            out |= OpenFlags::APPEND;
        }
        if file.flags.contains(FileFlags::NOATIME) {
            out |= OpenFlags::NOATIME;
        }
        out
    }

    pub fn read(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        let mut state = file.lock_state();
        let mut cache = state.block_cache;
        let n = self.read_internal(file, state.offset, buf, &mut cache)?;
        state.offset += n as u64;
        state.block_cache = cache;
        Ok(n)
    }

    pub fn pread(&self, file: &File, buf: &mut [u8], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Error::Inval);
        }
        let mut cache = {
            let state = file.lock_state();
            state.block_cache
        };
        self.read_internal(file, offset as u64, buf, &mut cache)
    }

    pub fn readv(&self, file: &File, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut state = file.lock_state();
        let mut cache = state.block_cache;
        let mut total = 0usize;
        for buf in bufs {
            let n = self.read_internal(file, state.offset, buf, &mut cache)?;
            state.offset += n as u64;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        state.block_cache = cache;
        Ok(total)
    }

    pub fn preadv(&self, file: &File, bufs: &mut [&mut [u8]], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Error::Inval);
        }
        let mut offset = offset as u64;
        let mut cache = {
            let state = file.lock_state();
            state.block_cache
        };
        let mut total = 0usize;
        for buf in bufs {
            let n = self.read_internal(file, offset, buf, &mut cache)?;
            offset += n as u64;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn read_internal(
        &self,
        file: &File,
        offset: u64,
        buf: &mut [u8],
        cache: &mut u64,
    ) -> Result<usize> {
        if file.flags.contains(FileFlags::PATH) {
            return Err(Error::BadFd);
        }
        if !file.vinode.is_regular() {
            return Err(Error::Inval);
        }
        if !file.flags.contains(FileFlags::READ) {
            return Err(Error::BadFd);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // take the read lock with the block index present, building it
        // under the write lock when needed
        let guard = loop {
            {
                let guard = file.vinode.read(&self.store);
                if guard.inner().index.is_some() {
                    break guard;
                }
            }
            let mut wguard = file.vinode.write(&self.store);
            data::ensure_index(&mut wguard);
        };

        let size = guard.inode().size();
        if offset >= size {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(size - offset) as usize;
        *cache = data::read_range(&guard, &self.store, offset, &mut buf[..count], *cache);

        // relatime: refresh atime only when it trails ctime, mtime, or
        // is older than a day
        let mut update_atime = !file.flags.contains(FileFlags::NOATIME);
        let now = Time::now();
        if update_atime {
            let inode = guard.inode();
            let day_ago = Time {
                sec: now.sec - 86400,
                nsec: now.nsec,
            };
            update_atime = inode.atime() < day_ago
                || inode.atime() < inode.ctime()
                || inode.atime() < inode.mtime();
        }
        drop(guard);

        if update_atime {
            let mut wguard = file.vinode.write(&self.store);
            let tx = self.store.tx_begin();
            wguard.set_atime(&tx, now);
            tx.commit();
        }

        Ok(count)
    }

    pub fn write(&self, file: &File, buf: &[u8]) -> Result<usize> {
        let mut state = file.lock_state();
        let offset = state.offset;
        let written = self.write_internal(file, offset, buf)?;
        state.offset = written.0 + written.1 as u64;
        Ok(written.1)
    }

    pub fn pwrite(&self, file: &File, buf: &[u8], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Error::Inval);
        }
        Ok(self.write_internal(file, offset as u64, buf)?.1)
    }

    pub fn writev(&self, file: &File, bufs: &[&[u8]]) -> Result<usize> {
        let mut state = file.lock_state();
        let mut total = 0usize;
        for buf in bufs {
            let (start, n) = self.write_internal(file, state.offset, buf)?;
            state.offset = start + n as u64;
            total += n;
        }
        Ok(total)
    }

    pub fn pwritev(&self, file: &File, bufs: &[&[u8]], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Error::Inval);
        }
        let mut offset = offset as u64;
        let mut total = 0usize;
        for buf in bufs {
            let (start, n) = self.write_internal(file, offset, buf)?;
            offset = start + n as u64;
            total += n;
        }
        Ok(total)
    }

    /// Returns `(actual start offset, bytes written)`; the start
    /// differs from the argument for append-mode handles.
    fn write_internal(&self, file: &File, offset: u64, buf: &[u8]) -> Result<(u64, usize)> {
        if file.flags.contains(FileFlags::PATH) {
            return Err(Error::BadFd);
        }
        if !file.vinode.is_regular() {
            return Err(Error::Inval);
        }
        if !file.flags.contains(FileFlags::WRITE) {
            return Err(Error::BadFd);
        }
        if buf.is_empty() {
            return Ok((offset, 0));
        }

        let mut guard = file.vinode.write(&self.store);
        let offset = if file.flags.contains(FileFlags::APPEND) {
            guard.inode().size()
        } else {
            offset
        };
        if offset.checked_add(buf.len() as u64).is_none() {
            return Err(Error::Overflow);
        }

        guard.inner_mut().snapshot();
        match self.vinode_write(&mut guard, offset, buf) {
            Ok(()) => Ok((offset, buf.len())),
            Err(err) => {
                guard.inner_mut().restore_on_abort();
                Err(err)
            }
        }
    }

    fn vinode_write(
        &self,
        guard: &mut InodeWriteGuard<'_>,
        offset: u64,
        buf: &[u8],
    ) -> Result<()> {
        let tx = self.store.tx_begin();
        data::ensure_index(guard);
        data::allocate_interval(self, &tx, guard, offset, buf.len() as u64)?;
        data::write_range(&tx, guard, offset, buf);

        let end = offset + buf.len() as u64;
        if end > guard.inode().size() {
            guard.set_size(&tx, end);
        }
        guard.set_mtime(&tx, Time::now());
        tx.commit();
        Ok(())
    }

    pub fn lseek(&self, file: &File, offset: i64, whence: Whence) -> Result<i64> {
        if file.flags.contains(FileFlags::PATH) {
            return Err(Error::BadFd);
        }
        if file.vinode.is_dir() {
            if whence == Whence::End {
                return Err(Error::Inval);
            }
        } else if !file.vinode.is_regular() {
            return Err(Error::Inval);
        }

        let mut state = file.lock_state();
        let ret = match whence {
            Whence::Set => {
                if offset < 0 {
                    return Err(Error::Inval);
                }
                offset
            }
            Whence::Cur => {
                let ret = (state.offset as i64).checked_add(offset);
                match ret {
                    Some(ret) if ret >= 0 => ret,
                    _ if offset < 0 => return Err(Error::Inval),
                    _ => return Err(Error::Overflow),
                }
            }
            Whence::End => {
                let size = file.vinode.read(&self.store).inode().size() as i64;
                let ret = size.checked_add(offset);
                match ret {
                    Some(ret) if ret >= 0 => ret,
                    _ if offset < 0 => return Err(Error::Inval),
                    _ => return Err(Error::Overflow),
                }
            }
            Whence::Data | Whence::Hole => {
                if !file.vinode.is_regular() {
                    return Err(Error::BadFd);
                }
                let guard = loop {
                    {
                        let guard = file.vinode.read(&self.store);
                        if guard.inner().index.is_some() {
                            break guard;
                        }
                    }
                    let mut wguard = file.vinode.write(&self.store);
                    data::ensure_index(&mut wguard);
                };
                let fsize = guard.inode().size() as i64;
                if offset > fsize {
                    return Err(Error::NxIo);
                }
                let offset = offset.max(0);
                let found = if whence == Whence::Data {
                    data::seek_data(&self.store, guard.inner(), offset, fsize)
                } else {
                    data::seek_hole(&self.store, guard.inner(), offset, fsize)
                };
                found.min(fsize)
            }
        };
        state.offset = ret as u64;
        Ok(ret)
    }

    pub fn fallocate(&self, file: &File, mode: FallocateMode, offset: i64, length: i64) -> Result<()> {
        log::debug!("fallocate mode {:?} offset {} length {}", mode, offset, length);
        if file.flags.contains(FileFlags::PATH) {
            return Err(Error::BadFd);
        }
        if offset < 0 || length <= 0 {
            return Err(Error::Inval);
        }
        if mode.contains(FallocateMode::PUNCH_HOLE) && !mode.contains(FallocateMode::KEEP_SIZE) {
            return Err(Error::Inval);
        }
        if !file.flags.contains(FileFlags::WRITE) {
            return Err(Error::BadFd);
        }
        if !file.vinode.is_regular() {
            return Err(Error::BadFd);
        }

        let mut offset = offset as u64;
        let mut length = length as u64;
        let end = offset + length;
        if mode.contains(FallocateMode::PUNCH_HOLE) {
            data::narrow_to_full_pages(&mut offset, &mut length);
        } else {
            data::expand_to_full_pages(&mut offset, &mut length);
        }
        if length == 0 {
            return Ok(());
        }

        let mut guard = file.vinode.write(&self.store);
        guard.inner_mut().snapshot();
        let result = self.fallocate_locked(&mut guard, mode, offset, length, end);
        if result.is_err() {
            guard.inner_mut().restore_on_abort();
        }
        result
    }

    fn fallocate_locked(
        &self,
        guard: &mut InodeWriteGuard<'_>,
        mode: FallocateMode,
        offset: u64,
        length: u64,
        end: u64,
    ) -> Result<()> {
        let tx = self.store.tx_begin();
        data::ensure_index(guard);
        if mode.contains(FallocateMode::PUNCH_HOLE) {
            data::remove_interval(&tx, guard, offset, length);
        } else {
            data::allocate_interval(self, &tx, guard, offset, length)?;
            if !mode.contains(FallocateMode::KEEP_SIZE) && guard.inode().size() < end {
                guard.set_size(&tx, end);
            }
        }
        tx.commit();
        Ok(())
    }

    pub fn ftruncate(&self, file: &File, size: i64) -> Result<()> {
        log::debug!("ftruncate size {}", size);
        if file.flags.contains(FileFlags::PATH) {
            return Err(Error::BadFd);
        }
        if size < 0 {
            return Err(Error::Inval);
        }
        if !file.flags.contains(FileFlags::WRITE) {
            return Err(Error::BadFd);
        }
        if !file.vinode.is_regular() {
            return Err(Error::Inval);
        }

        let mut guard = file.vinode.write(&self.store);
        guard.inner_mut().snapshot();
        let result = (|| {
            let tx = self.store.tx_begin();
            data::truncate(self, &tx, &mut guard, size as u64)?;
            tx.commit();
            Ok(())
        })();
        if result.is_err() {
            guard.inner_mut().restore_on_abort();
        }
        result
    }
}
