//! Credentials and permission checks.
//!
//! Operations snapshot the pool's credentials once, up front, and use
//! the snapshot for every check they make; a concurrent `setfsuid`
//! cannot change the meaning of an operation midway.

use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    /// Capability bits. The bit positions follow the Linux capability
    /// numbers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u64 {
        /// Override the ownership restrictions of chown.
        const CHOWN = 1 << 0;
        /// Override ownership checks (chmod, truncate of others' files).
        const FOWNER = 1 << 3;
        /// Keep the setgid bit on chmod of a non-matching group.
        const FSETID = 1 << 4;
    }
}

bitflags! {
    /// What an access check is asking for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Want: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// A snapshot of the pool's filesystem credentials.
#[derive(Debug, Clone)]
pub struct Cred {
    pub fsuid: u32,
    pub fsgid: u32,
    pub groups: SmallVec<[u32; 8]>,
    pub caps: Caps,
}

impl Cred {
    pub fn new(fsuid: u32, fsgid: u32) -> Self {
        Self {
            fsuid,
            fsgid,
            groups: SmallVec::new(),
            caps: Caps::empty(),
        }
    }

    /// Is `gid` in the supplementary group set?
    pub fn gid_in_list(&self, gid: u32) -> bool {
        self.groups.contains(&gid)
    }

    /// Is `gid` one of the effective groups (fsgid or supplementary)?
    pub fn in_groups(&self, gid: u32) -> bool {
        self.fsgid == gid || self.gid_in_list(gid)
    }

    /// Classic owner → group → other check against `mode`'s permission
    /// bits, for a file owned by `uid`:`gid`.
    pub fn can_access(&self, uid: u32, gid: u32, mode: u64, want: Want) -> bool {
        let class = if self.fsuid == uid {
            mode >> 6
        } else if self.in_groups(gid) {
            mode >> 3
        } else {
            mode
        };

        let mut needed = 0u64;
        if want.contains(Want::READ) {
            needed |= 0o4;
        }
        if want.contains(Want::WRITE) {
            needed |= 0o2;
        }
        if want.contains(Want::EXECUTE) {
            needed |= 0o1;
        }
        class & needed == needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_class_shadows_other_classes() {
        let cred = Cred::new(1000, 1000);
        // owner bits deny even though "other" bits would allow
        assert!(!cred.can_access(1000, 1000, 0o007, Want::READ));
        assert!(cred.can_access(1000, 1000, 0o700, Want::READ | Want::EXECUTE));
    }

    #[test]
    fn group_membership() {
        let mut cred = Cred::new(1000, 50);
        assert!(cred.can_access(0, 50, 0o070, Want::READ | Want::WRITE | Want::EXECUTE));
        assert!(!cred.can_access(0, 51, 0o070, Want::READ));
        cred.groups.push(51);
        assert!(cred.can_access(0, 51, 0o070, Want::READ));
    }

    #[test]
    fn other_class() {
        let cred = Cred::new(1000, 1000);
        assert!(cred.can_access(0, 0, 0o003, Want::WRITE | Want::EXECUTE));
        assert!(!cred.can_access(0, 0, 0o003, Want::READ));
    }
}
