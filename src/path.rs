//! Paths, names, and the resolver.
//!
//! `Path` is a thin view over a byte slice: a path may contain
//! anything but NUL; a component additionally contains no `/` and is
//! at most 255 bytes.
//!
//! Resolution walks a path component by component. Entering a
//! directory requires execute permission for the effective
//! credentials; a symlink found mid-path splices its target into the
//! remaining components, with one chase counter bounding the whole
//! resolution. `.` and `..` are ordinary dirents (every directory
//! carries both), which also makes `..` at a root loop back to the
//! root itself.

use std::collections::VecDeque;

use crate::cred::{Cred, Want};
use crate::dir;
use crate::error::{Error, Result};
use crate::inode::VinodeRef;
use crate::layout::MAX_FILE_NAME;
use crate::pool::Pool;

/// Symlink-chase bound per resolution.
pub const SYMLOOP_MAX: u32 = 40;

#[repr(transparent)]
pub struct Path {
    // Invariant: contains no NUL bytes.
    inner: [u8],
}

impl Path {
    pub fn new(path: &str) -> &Self {
        Self::from_bytes(path.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of
        // its `#[repr(transparent)]` attribute.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Does the path name a directory syntactically (trailing slash)?
    pub fn wants_dir(&self) -> bool {
        self.inner.last() == Some(&b'/')
    }

    /// Split into components, skipping empty ones. Errors on a
    /// component longer than the name limit.
    pub fn components(&self) -> Result<VecDeque<Vec<u8>>> {
        let mut out = VecDeque::new();
        for comp in self.inner.split(|b| *b == b'/') {
            if comp.is_empty() {
                continue;
            }
            if comp.len() > MAX_FILE_NAME {
                return Err(Error::NameTooLong);
            }
            out.push_back(comp.to_vec());
        }
        Ok(out)
    }
}

/// The final component of a resolved path, together with its parent
/// directory.
pub(crate) struct PathInfo {
    pub parent: VinodeRef,
    /// Empty when the path names a root itself.
    pub name: Vec<u8>,
    /// The path carried a trailing slash (must resolve to a dir).
    pub wants_dir: bool,
}

/// Check execute (search) permission on a directory vinode.
fn check_search(pool: &Pool, cred: &Cred, dir: &VinodeRef) -> Result<()> {
    let guard = dir.read(&pool.store);
    let inode = guard.inode();
    if cred.can_access(inode.uid, inode.gid, inode.mode(), Want::EXECUTE) {
        Ok(())
    } else {
        Err(Error::Access)
    }
}

/// Resolve everything but the final component.
///
/// `at` is consumed: it either becomes the starting point of the walk
/// or is released. On success the caller owns `PathInfo::parent`; on
/// error every reference taken during the walk has been released.
pub(crate) fn resolve_parent(
    pool: &Pool,
    cred: &Cred,
    at: VinodeRef,
    path: &Path,
    chase: &mut u32,
) -> Result<PathInfo> {
    if path.is_empty() {
        at.unref(pool);
        return Err(Error::NoEntry);
    }

    let mut cur = if path.is_absolute() {
        at.unref(pool);
        pool.root_ref(0)
    } else {
        at
    };
    let wants_dir = path.wants_dir();
    let mut comps = match path.components() {
        Ok(comps) => comps,
        Err(err) => {
            cur.unref(pool);
            return Err(err);
        }
    };

    while comps.len() > 1 {
        if let Err(err) = step(pool, cred, &mut cur, &mut comps, chase) {
            cur.unref(pool);
            return Err(err);
        }
    }

    // the final parent also needs search permission for the last
    // lookup the caller is about to do
    if !cur.is_dir() {
        cur.unref(pool);
        return Err(Error::NotDir);
    }
    if let Err(err) = check_search(pool, cred, &cur) {
        cur.unref(pool);
        return Err(err);
    }

    Ok(PathInfo {
        parent: cur,
        name: comps.pop_front().unwrap_or_default(),
        wants_dir,
    })
}

/// Consume the front component: look it up in `cur` and descend,
/// splicing symlink targets back into `comps`.
fn step(
    pool: &Pool,
    cred: &Cred,
    cur: &mut VinodeRef,
    comps: &mut VecDeque<Vec<u8>>,
    chase: &mut u32,
) -> Result<()> {
    if !cur.is_dir() {
        return Err(Error::NotDir);
    }
    check_search(pool, cred, cur)?;

    let comp = comps.pop_front().expect("component to resolve");
    let child = {
        let guard = cur.read(&pool.store);
        let found = dir::lookup_dirent(&pool.store, guard.vinode().tinode, &comp);
        drop(guard);
        match found {
            Some((tinode, _)) => pool.inode_map.intern(&pool.store, tinode),
            None => return Err(Error::NoEntry),
        }
    };

    if child.is_symlink() {
        *chase += 1;
        if *chase > SYMLOOP_MAX {
            child.unref(pool);
            return Err(Error::Loop);
        }
        let target = {
            let guard = child.read(&pool.store);
            guard.symlink_target()
        };
        child.unref(pool);

        let tpath = Path::from_bytes(&target);
        let tcomps = tpath.components()?;
        for comp in tcomps.into_iter().rev() {
            comps.push_front(comp);
        }
        if tpath.is_absolute() {
            let root = pool.root_ref(0);
            let old = core::mem::replace(cur, root);
            old.unref(pool);
        }
        // an empty target resolves to the link's directory itself
        return Ok(());
    }

    if !child.is_dir() {
        child.unref(pool);
        return Err(Error::NotDir);
    }
    let old = core::mem::replace(cur, child);
    old.unref(pool);
    Ok(())
}

/// Full resolution of a path to a vinode. `follow_last` chases a
/// symlink in the final component; without it the symlink itself is
/// returned.
pub(crate) fn namei(
    pool: &Pool,
    cred: &Cred,
    at: VinodeRef,
    path: &Path,
    follow_last: bool,
) -> Result<VinodeRef> {
    let mut chase = 0u32;
    let mut info = resolve_parent(pool, cred, at, path, &mut chase)?;

    loop {
        if info.name.is_empty() {
            // the path named a root itself
            return Ok(info.parent);
        }

        let found = {
            let guard = info.parent.read(&pool.store);
            dir::lookup_dirent(&pool.store, guard.vinode().tinode, &info.name)
        };
        let Some((tinode, _)) = found else {
            info.parent.unref(pool);
            return Err(Error::NoEntry);
        };
        let child = pool.inode_map.intern(&pool.store, tinode);

        if child.is_symlink() && follow_last {
            chase += 1;
            if chase > SYMLOOP_MAX {
                child.unref(pool);
                info.parent.unref(pool);
                return Err(Error::Loop);
            }
            let target = {
                let guard = child.read(&pool.store);
                guard.symlink_target()
            };
            child.unref(pool);
            let parent = info.parent;
            info = resolve_parent(pool, cred, parent, Path::from_bytes(&target), &mut chase)?;
            continue;
        }

        if info.wants_dir && !child.is_dir() {
            child.unref(pool);
            info.parent.unref(pool);
            return Err(Error::NotDir);
        }
        info.parent.unref(pool);
        return Ok(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skip_empty_and_bound_names() {
        let comps = Path::new("///a//bb/c/").components().unwrap();
        let comps: Vec<&[u8]> = comps.iter().map(|c| c.as_slice()).collect();
        assert_eq!(comps, vec![b"a".as_slice(), b"bb", b"c"]);

        assert!(Path::new("").components().unwrap().is_empty());
        assert!(Path::new("////").components().unwrap().is_empty());

        let long = "x".repeat(MAX_FILE_NAME + 1);
        assert!(matches!(
            Path::new(&long).components(),
            Err(Error::NameTooLong)
        ));
    }

    #[test]
    fn path_predicates() {
        assert!(Path::new("/a").is_absolute());
        assert!(!Path::new("a/b").is_absolute());
        assert!(Path::new("a/b/").wants_dir());
        assert!(Path::new("").is_empty());
    }
}
