//! Volatile offset → block-descriptor index of one regular file.
//!
//! A pure cache over the persistent block chain: losing it is
//! harmless, it is rebuilt lazily by walking the chain (after a
//! transaction abort that touched the chain, or on first use). All
//! operations are O(log n) in the number of blocks.

use std::collections::BTreeMap;

use crate::layout::BlockDesc;
use crate::obj::Obj;

#[derive(Debug, Default)]
pub struct BlockIndex {
    map: BTreeMap<u64, Obj<BlockDesc>>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The block with the greatest file offset ≤ `offset`.
    pub fn find_le(&self, offset: u64) -> Option<Obj<BlockDesc>> {
        self.map.range(..=offset).next_back().map(|(_, &b)| b)
    }

    /// The block with the greatest file offset.
    pub fn last(&self) -> Option<Obj<BlockDesc>> {
        self.map.values().next_back().copied()
    }

    pub fn insert(&mut self, offset: u64, block: Obj<BlockDesc>) {
        self.map.insert(offset, block);
    }

    pub fn remove(&mut self, offset: u64) {
        self.map.remove(&offset);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(off: u64) -> Obj<BlockDesc> {
        Obj::from_raw(off)
    }

    #[test]
    fn find_le_semantics() {
        let mut idx = BlockIndex::new();
        assert_eq!(idx.find_le(0), None);

        idx.insert(4096, obj(1));
        idx.insert(16384, obj(2));
        idx.insert(65536, obj(3));

        assert_eq!(idx.find_le(0), None);
        assert_eq!(idx.find_le(4096), Some(obj(1)));
        assert_eq!(idx.find_le(16383), Some(obj(1)));
        assert_eq!(idx.find_le(16384), Some(obj(2)));
        assert_eq!(idx.find_le(u64::MAX), Some(obj(3)));
        assert_eq!(idx.last(), Some(obj(3)));
    }

    #[test]
    fn remove_unlinks_only_that_offset() {
        let mut idx = BlockIndex::new();
        idx.insert(0, obj(1));
        idx.insert(8192, obj(2));
        idx.remove(8192);
        assert_eq!(idx.find_le(u64::MAX), Some(obj(1)));
        idx.remove(0);
        assert!(idx.is_empty());
    }
}
