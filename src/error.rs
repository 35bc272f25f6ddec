//! Errno-shaped errors.
//!
//! Every public entry point reports failure through [`Error`]; the
//! variants map one-to-one onto the POSIX errno values a libc shim
//! would surface. No partial on-media mutation is ever visible after
//! an error: mutating operations raise their error inside a
//! transaction, which rolls back before the error escapes.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Component of a path, or the final name, does not exist.
    NoEntry,
    /// Name already present while exclusivity was required.
    Exists,
    /// A directory was required but something else was found.
    NotDir,
    /// A non-directory was required but a directory was found.
    IsDir,
    /// Directory not empty (rmdir).
    NotEmpty,
    /// Permission bits forbid the access.
    Access,
    /// Privileged operation without the matching capability.
    Perm,
    /// Bad argument or unsupported flag combination.
    Inval,
    /// Name longer than 255 bytes, or symlink target too long.
    NameTooLong,
    /// Symlink chase exceeded the bound, or NOFOLLOW hit a symlink.
    Loop,
    /// Handle not usable for this operation (e.g. a PATH handle).
    BadFd,
    /// Allocation failed inside a transaction.
    NoSpace,
    /// Known-unsupported operation (e.g. directory rename).
    NotSup,
    /// SEEK_DATA / SEEK_HOLE past end of file.
    NxIo,
    /// Offset arithmetic overflowed.
    Overflow,
    /// Required argument missing (NULL pool/dir in the C surface).
    Fault,
}

impl Error {
    /// The errno value a POSIX shim should report for this error.
    pub fn errno(self) -> i32 {
        match self {
            Error::NoEntry => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::NotDir => libc::ENOTDIR,
            Error::IsDir => libc::EISDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::Access => libc::EACCES,
            Error::Perm => libc::EPERM,
            Error::Inval => libc::EINVAL,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::Loop => libc::ELOOP,
            Error::BadFd => libc::EBADF,
            Error::NoSpace => libc::ENOSPC,
            Error::NotSup => libc::ENOTSUP,
            Error::NxIo => libc::ENXIO,
            Error::Overflow => libc::EOVERFLOW,
            Error::Fault => libc::EFAULT,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NoEntry => "no such file or directory",
            Error::Exists => "file exists",
            Error::NotDir => "not a directory",
            Error::IsDir => "is a directory",
            Error::NotEmpty => "directory not empty",
            Error::Access => "permission denied",
            Error::Perm => "operation not permitted",
            Error::Inval => "invalid argument",
            Error::NameTooLong => "file name too long",
            Error::Loop => "too many levels of symbolic links",
            Error::BadFd => "bad file handle",
            Error::NoSpace => "no space left in pool",
            Error::NotSup => "operation not supported",
            Error::NxIo => "no such device or address",
            Error::Overflow => "value too large",
            Error::Fault => "bad address",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_libc() {
        assert_eq!(Error::NoEntry.errno(), libc::ENOENT);
        assert_eq!(Error::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(Error::NxIo.errno(), libc::ENXIO);
    }
}
