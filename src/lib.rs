//! A POSIX-like filesystem living inside a persistent-memory object
//! pool. Five layers, leaves first:
//!   + Objects: the pool arena, typed allocations, and undo-log
//!     transactions with abort/commit callbacks.
//!   + Layout: the on-media structures (super block, inodes, dirent
//!     pages, block descriptors, orphan lists) and their invariants.
//!   + Inodes: the vinode cache binding volatile state (refcounts,
//!     rwlocks, the offset→block index) to persistent inodes.
//!   + Data: sparse block allocation, hole punching, zero-fill reads.
//!   + Names: path resolution, directories, and the POSIX-shaped
//!     operations composed from all of the above.
//!
//! A [`Pool`] is one self-contained filesystem image. Open one (or
//! create one), then call the open/read/write/link/rename/... methods
//! on it; every failing call reports a POSIX-errno-shaped [`Error`]
//! and leaves the filesystem exactly as it was.
//!
//! ```no_run
//! use pmfs::{OpenFlags, Pool};
//!
//! let pool = Pool::new(64 << 20)?;
//! let file = pool.open("/hello", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)?;
//! pool.write(&file, b"hello world")?;
//! pool.close(file);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod cred;
mod data;
mod dir;
mod error;
mod file;
mod index;
mod inode;
mod layout;
mod locks;
mod obj;
mod ops;
mod path;
mod pool;
mod stat;

pub use cred::Caps;
pub use dir::DirEntry;
pub use error::{Error, Result};
pub use file::{FallocateMode, File, OpenFlags, Whence};
pub use layout::{
    InodeType, Time, ACCESSPERMS, ALLPERMS, MAX_FILE_NAME, ROOT_COUNT, S_IFDIR, S_IFLNK, S_IFMT,
    S_IFREG, S_ISGID, S_ISUID, S_ISVTX,
};
pub use obj::PoolStats;
pub use pool::Pool;
pub use stat::Stat;
