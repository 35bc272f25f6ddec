//! The regular-file data engine.
//!
//! File bytes live in blocks described by a doubly-linked chain of
//! block descriptors, sorted strictly by file offset with disjoint
//! ranges; holes are simply absent ranges. Descriptors sit in chained
//! descriptor arrays (the first array is inline in the inode); a
//! descriptor slot with size zero is free.
//!
//! A block whose INITIALIZED flag is clear has undefined content and
//! reads as zeros; a writer either zero-fills the uncovered part of
//! the block and sets the flag, or clears the affected range.
//!
//! All allocation happens before any user data is copied, so an abort
//! inside a write never exposes a partial copy; the copies themselves
//! bypass the undo log (see DESIGN.md).
//!
//! Callers hold the vinode lock: exclusive for anything that mutates,
//! shared for reads. The volatile index is rebuilt here when missing.

use core::mem::{offset_of, size_of};

use zerocopy::FromBytes;

use crate::error::Result;
use crate::index::BlockIndex;
use crate::inode::{InodeReadGuard, InodeWriteGuard, VinodeInner};
use crate::layout::{
    BlockArray, BlockDesc, BlockFlags, Inode, BLOCK_ARRAY_HDR, BLOCK_ARRAY_VERSION,
    INODE_FILE_DATA_OFFSET, MAX_BLOCK_SIZE, METADATA_BLOCK_SIZE, PAGE_BLOCK_CAP, PAGE_SIZE,
};
use crate::obj::{Obj, ObjStore, ObjType, Tx};
use crate::pool::Pool;

pub(crate) fn page_roundup(n: u64) -> u64 {
    n.next_multiple_of(PAGE_SIZE)
}

pub(crate) fn page_rounddown(n: u64) -> u64 {
    n - n % PAGE_SIZE
}

/// Round `[offset, offset+length)` outward to whole pages.
pub(crate) fn expand_to_full_pages(offset: &mut u64, length: &mut u64) {
    *length += *offset % PAGE_SIZE;
    *offset -= *offset % PAGE_SIZE;
    *length = page_roundup(*length);
}

/// Shrink `[offset, offset+length)` inward to whole pages.
pub(crate) fn narrow_to_full_pages(offset: &mut u64, length: &mut u64) {
    let end = page_rounddown(*offset + *length);
    *offset = page_roundup(*offset);
    *length = if end > *offset { end - *offset } else { 0 };
}

fn desc<'a>(store: &'a ObjStore, off: u64) -> &'a BlockDesc {
    debug_assert_ne!(off, 0);
    // SAFETY: descriptors live inside block arrays of a locked inode.
    unsafe { store.as_ref(Obj::<BlockDesc>::from_raw(off)) }
}

#[allow(clippy::mut_from_ref)]
fn desc_mut<'a>(store: &'a ObjStore, off: u64) -> &'a mut BlockDesc {
    debug_assert_ne!(off, 0);
    // SAFETY: as `desc`, with the exclusive lock held by the caller.
    unsafe { store.as_mut(Obj::<BlockDesc>::from_raw(off)) }
}

fn inline_array(tinode: Obj<Inode>) -> u64 {
    tinode.raw() + INODE_FILE_DATA_OFFSET
}

fn array_hdr<'a>(store: &'a ObjStore, arr: u64) -> &'a BlockArray {
    // SAFETY: arrays are live while linked from a locked inode.
    unsafe { store.as_ref(Obj::<BlockArray>::from_raw(arr)) }
}

fn array_descs<'a>(store: &'a ObjStore, arr: u64) -> &'a [BlockDesc] {
    let n = array_hdr(store, arr).length as usize;
    let bytes = store.bytes(arr + BLOCK_ARRAY_HDR as u64, (n * size_of::<BlockDesc>()) as u64);
    <[BlockDesc]>::ref_from_bytes(bytes).expect("block array view")
}

/// Rebuild the volatile offset→block index by walking the persistent
/// descriptor chain.
pub(crate) fn rebuild_block_index(guard: &mut InodeWriteGuard<'_>) {
    let store = guard.store();
    let mut index = BlockIndex::new();
    let mut first: u64 = 0;
    let mut first_offset = u64::MAX;

    let mut arr = inline_array(guard.tinode());
    while arr != 0 {
        let base = arr + BLOCK_ARRAY_HDR as u64;
        for (i, d) in array_descs(store, arr).iter().enumerate() {
            if d.size == 0 {
                continue; // free slot
            }
            let off = base + (i * size_of::<BlockDesc>()) as u64;
            index.insert(d.offset, Obj::from_raw(off));
            if d.offset < first_offset {
                first_offset = d.offset;
                first = off;
            }
        }
        arr = array_hdr(store, arr).next;
    }

    let inner = guard.inner_mut();
    inner.index = Some(index);
    inner.first_block = first;
}

pub(crate) fn ensure_index(guard: &mut InodeWriteGuard<'_>) {
    if guard.inner().index.is_none() {
        rebuild_block_index(guard);
    }
}

fn find_le(inner: &VinodeInner, offset: u64) -> u64 {
    inner
        .index
        .as_ref()
        .expect("block index present")
        .find_le(offset)
        .map(Obj::raw)
        .unwrap_or(0)
}

/// `find_le`, starting from a caller-cached descriptor when it still
/// covers the offset.
pub(crate) fn find_closest(store: &ObjStore, inner: &VinodeInner, hint: u64, offset: u64) -> u64 {
    if hint != 0 && desc(store, hint).contains(offset) {
        return hint;
    }
    find_le(inner, offset)
}

/// Take a free descriptor slot, chaining a fresh array page when all
/// slots are taken. The new slot stays `size == 0` until its data is
/// allocated.
fn claim_desc_slot(tx: &Tx<'_>, guard: &mut InodeWriteGuard<'_>) -> Result<u64> {
    let store = guard.store();
    let mut arr = inline_array(guard.tinode());
    loop {
        let base = arr + BLOCK_ARRAY_HDR as u64;
        if let Some(i) = array_descs(store, arr).iter().position(|d| d.size == 0) {
            let off = base + (i * size_of::<BlockDesc>()) as u64;
            tx.add_range(off, size_of::<BlockDesc>() as u64);
            return Ok(off);
        }
        let next = array_hdr(store, arr).next;
        if next == 0 {
            break;
        }
        arr = next;
    }

    // every slot is taken: chain a new array right behind the inline one
    let inline = inline_array(guard.tinode());
    let page = tx.alloc(ObjType::BlockArray, METADATA_BLOCK_SIZE as u64)?;
    // SAFETY: freshly allocated page.
    let hdr = unsafe { store.as_mut(Obj::<BlockArray>::from_raw(page)) };
    hdr.version = BLOCK_ARRAY_VERSION;
    hdr.length = PAGE_BLOCK_CAP;
    let inline_next_off = inline + offset_of!(BlockArray, next) as u64;
    tx.add_range(inline_next_off, 8);
    hdr.next = array_hdr(store, inline).next;
    // SAFETY: inline array of a write-locked inode.
    unsafe { store.as_mut(Obj::<BlockArray>::from_raw(inline)) }.next = page;

    let off = page + BLOCK_ARRAY_HDR as u64;
    tx.add_range(off, size_of::<BlockDesc>() as u64);
    Ok(off)
}

/// Link a fresh descriptor into the chain after `prev` (0 = head) and
/// return it.
fn block_list_insert_after(
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    prev: u64,
) -> Result<u64> {
    let store = guard.store();
    let slot = claim_desc_slot(tx, guard)?;

    if prev == 0 {
        let old_first = guard.inner().first_block;
        {
            let d = desc_mut(store, slot);
            d.prev = 0;
            d.next = old_first;
        }
        if old_first != 0 {
            tx.add_range(old_first + offset_of!(BlockDesc, prev) as u64, 8);
            desc_mut(store, old_first).prev = slot;
        }
        guard.inner_mut().first_block = slot;
    } else {
        let next = desc(store, prev).next;
        {
            let d = desc_mut(store, slot);
            d.prev = prev;
            d.next = next;
        }
        tx.add_range(prev + offset_of!(BlockDesc, next) as u64, 8);
        desc_mut(store, prev).next = slot;
        if next != 0 {
            tx.add_range(next + offset_of!(BlockDesc, prev) as u64, 8);
            desc_mut(store, next).prev = slot;
        }
    }
    Ok(slot)
}

/// Unlink `block` from the chain, free its data, and clear the slot
/// for reuse. Returns the previous block.
fn block_list_remove(tx: &Tx<'_>, guard: &mut InodeWriteGuard<'_>, block: u64) -> u64 {
    let store = guard.store();
    let d = *desc(store, block);

    if d.data != 0 {
        tx.free(d.data);
    }
    let space = guard.inode().allocated_space();
    guard.set_allocated_space(tx, space - d.size as u64);

    if d.prev != 0 {
        tx.add_range(d.prev + offset_of!(BlockDesc, next) as u64, 8);
        desc_mut(store, d.prev).next = d.next;
    } else {
        guard.inner_mut().first_block = d.next;
    }
    if d.next != 0 {
        tx.add_range(d.next + offset_of!(BlockDesc, prev) as u64, 8);
        desc_mut(store, d.next).prev = d.prev;
    }

    tx.add_range(block, size_of::<BlockDesc>() as u64);
    *desc_mut(store, block) = BlockDesc::default();
    d.prev
}

/// The tiered inflation schedule for appending writes.
fn overallocate_size(count: u64) -> u64 {
    if count <= 4096 {
        16 * 1024
    } else if count <= 64 * 1024 {
        256 * 1024
    } else if count <= 1024 * 1024 {
        4 * 1024 * 1024
    } else if count <= 64 * 1024 * 1024 {
        64 * 1024 * 1024
    } else {
        count
    }
}

/// Is `[offset, offset+size)` extending past the last allocated block?
fn is_append(guard: &InodeWriteGuard<'_>, offset: u64, size: u64) -> bool {
    if guard.inode().size() >= offset + size {
        return false;
    }
    match guard.inner().index.as_ref().and_then(BlockIndex::last) {
        None => true,
        Some(last) => desc(guard.store(), last.raw()).end() < offset + size,
    }
}

/// Allocate block data for a claimed descriptor. `count` is in whole
/// pages; with `use_usable_size` the descriptor takes all the usable
/// space the allocator handed back (page-truncated, capped).
fn allocate_block_data(
    pool: &Pool,
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    block: u64,
    count: u64,
    use_usable_size: bool,
) -> Result<()> {
    debug_assert!(count > 0 && count % PAGE_SIZE == 0);
    let store = guard.store();

    let forced = pool.config.block_size();
    let mut size = if forced != 0 {
        debug_assert!(forced <= MAX_BLOCK_SIZE && forced % PAGE_SIZE == 0);
        forced
    } else {
        count.min(MAX_BLOCK_SIZE)
    };

    let data = tx.alloc(ObjType::Data, size)?;
    if use_usable_size {
        let usable = store.usable_size(data);
        debug_assert!(usable >= size);
        size = page_rounddown(usable).min(MAX_BLOCK_SIZE);
    }

    {
        let d = desc_mut(store, block);
        d.data = data;
        d.size = size as u32;
        d.flags = 0;
    }
    let space = guard.inode().allocated_space();
    guard.set_allocated_space(tx, space + size);
    Ok(())
}

/// Make sure `[offset, offset+size)` is covered by blocks, allocating
/// into holes and past the end as needed (§4.7.2 of the format notes
/// in DESIGN.md).
pub(crate) fn allocate_interval(
    pool: &Pool,
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    mut offset: u64,
    mut size: u64,
) -> Result<()> {
    debug_assert!(size > 0);
    debug_assert!(offset + size > offset);

    let over = pool.config.overallocate_on_append() && is_append(guard, offset, size);
    if over {
        size = overallocate_size(size);
    }
    expand_to_full_pages(&mut offset, &mut size);

    let store = guard.store();
    let mut block = find_le(guard.inner(), offset);

    loop {
        if block != 0 && desc(store, block).contains(offset) {
            // not in a hole
            let available = desc(store, block).end() - offset;
            if available >= size {
                return Ok(());
            }
            offset += available;
            size -= available;
        } else if block == 0 && guard.inner().first_block == 0 {
            // no data in the file at all
            block = block_list_insert_after(tx, guard, 0)?;
            desc_mut(store, block).offset = offset;
            allocate_block_data(pool, tx, guard, block, size, over)?;
            let d_off = desc(store, block).offset;
            index_mut(guard).insert(d_off, Obj::from_raw(block));
        } else if block == 0 {
            // in a hole before the first block
            let first_offset = desc(store, guard.inner().first_block).offset;
            let mut count = size;
            if offset + count > first_offset {
                count = first_offset - offset;
            }
            block = block_list_insert_after(tx, guard, 0)?;
            desc_mut(store, block).offset = offset;
            allocate_block_data(pool, tx, guard, block, count, false)?;
            index_mut(guard).insert(offset, Obj::from_raw(block));
        } else if desc(store, block).next == 0 {
            // after the last allocated block
            block = block_list_insert_after(tx, guard, block)?;
            desc_mut(store, block).offset = offset;
            allocate_block_data(pool, tx, guard, block, size, over)?;
            index_mut(guard).insert(offset, Obj::from_raw(block));
        } else {
            // in a hole between two allocated blocks
            let next = desc(store, block).next;
            let hole = desc(store, next).offset - offset;
            let hole = hole.min(size);
            if hole > 0 {
                block = block_list_insert_after(tx, guard, block)?;
                desc_mut(store, block).offset = offset;
                allocate_block_data(pool, tx, guard, block, hole, false)?;
                if desc(store, block).size as u64 > hole {
                    desc_mut(store, block).size = hole as u32;
                }
                index_mut(guard).insert(offset, Obj::from_raw(block));
            } else {
                block = next;
            }
        }
    }
}

fn index_mut<'a>(guard: &'a mut InodeWriteGuard<'_>) -> &'a mut BlockIndex {
    guard.inner_mut().index.as_mut().expect("block index present")
}

/// Punch `[offset, offset+len)` out of the file: fully-covered blocks
/// are deallocated, partially-covered ones have the intersection
/// zero-filled (journaled first, so a failed transaction cannot leave
/// stray zeros behind).
pub(crate) fn remove_interval(tx: &Tx<'_>, guard: &mut InodeWriteGuard<'_>, offset: u64, len: u64) {
    debug_assert!(len > 0);
    let store = guard.store();
    let mut block = find_le(guard.inner(), offset.saturating_add(len - 1));

    while block != 0 && desc(store, block).end() > offset {
        let d = *desc(store, block);
        if d.offset >= offset && d.end() <= offset + len {
            // wholly inside the interval: deallocate
            index_mut(guard).remove(d.offset);
            block = block_list_remove(tx, guard, block);
        } else if d.offset < offset && d.end() > offset + len {
            // the interval is inside this one block
            if d.initialized() {
                let at = d.data + (offset - d.offset);
                tx.add_range(at, len);
                store.memset_persist(at, 0, len);
            }
            break;
        } else if d.end() > offset + len {
            // block sticks out at the right edge
            if d.initialized() {
                let count = offset + len - d.offset;
                tx.add_range(d.data, count);
                store.memset_persist(d.data, 0, count);
            }
            block = d.prev;
        } else {
            // block sticks out at the left edge
            if d.initialized() {
                let at = d.data + (offset - d.offset);
                let count = d.end() - offset;
                tx.add_range(at, count);
                store.memset_persist(at, 0, count);
            }
            block = d.prev;
        }
    }
}

/// Copy bytes out of the file into `buf`, zero-filling holes and
/// uninitialized blocks. The range must not reach past EOF (the
/// caller clips). Returns an updated block hint for the handle cache.
pub(crate) fn read_range(
    guard: &InodeReadGuard<'_>,
    store: &ObjStore,
    mut offset: u64,
    buf: &mut [u8],
    hint: u64,
) -> u64 {
    let inner = guard.inner();
    let below = find_closest(store, inner, hint, offset);
    // first block whose range ends past `offset` (the block covering
    // it, or the one after the hole it sits in)
    let mut block = if below == 0 {
        inner.first_block
    } else if desc(store, below).end() > offset {
        below
    } else {
        desc(store, below).next
    };
    let mut cache = below;
    let mut buf = buf;

    while !buf.is_empty() {
        if block != 0 && desc(store, block).contains(offset) {
            let d = *desc(store, block);
            let start = offset - d.offset;
            let n = (buf.len() as u64).min(d.size as u64 - start) as usize;
            let taken = buf;
            let (chunk, rest) = taken.split_at_mut(n);
            if d.initialized() {
                chunk.copy_from_slice(store.bytes(d.data + start, n as u64));
            } else {
                chunk.fill(0);
            }
            offset += n as u64;
            buf = rest;
            cache = block;
            if offset >= d.end() {
                block = d.next;
            }
            continue;
        }

        // a hole; zeros reach to the next block, or the end of the read
        let mut zeros = buf.len() as u64;
        if block != 0 {
            zeros = zeros.min(desc(store, block).offset - offset);
        }
        let taken = buf;
        let (hole, rest) = taken.split_at_mut(zeros as usize);
        hole.fill(0);
        offset += zeros;
        buf = rest;
    }
    cache
}

/// Copy `buf` into the file at `offset`. Every byte of the range is
/// already covered by allocated blocks.
pub(crate) fn write_range(
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    mut offset: u64,
    mut buf: &[u8],
) {
    let store = guard.store();
    let mut block = find_le(guard.inner(), offset);

    while !buf.is_empty() {
        let d = *desc(store, block);
        debug_assert!(d.contains(offset), "write range not fully allocated");
        let start = offset - d.offset;
        let n = (buf.len() as u64).min(d.size as u64 - start) as usize;

        if !d.initialized() {
            // zero the parts of the block the write does not cover,
            // then mark it initialized; the fresh zeros need no
            // journal, the flag flip does
            if start > 0 {
                store.memset_persist(d.data, 0, start);
            }
            let tail = start + n as u64;
            if tail < d.size as u64 {
                store.memset_persist(d.data + tail, 0, d.size as u64 - tail);
            }
            tx.add_range(block + offset_of!(BlockDesc, flags) as u64, 4);
            desc_mut(store, block).flags |= BlockFlags::INITIALIZED.bits();
        }

        store.memcpy_persist(d.data + start, &buf[..n]);
        offset += n as u64;
        buf = &buf[n..];
        block = d.next;
    }
}

/// Set the file length, removing blocks past the end and allocating
/// the gap when growing.
pub(crate) fn truncate(
    pool: &Pool,
    tx: &Tx<'_>,
    guard: &mut InodeWriteGuard<'_>,
    size: u64,
) -> Result<()> {
    ensure_index(guard);

    let inner = std::sync::Arc::clone(&guard.vinode().inner);
    tx.on_abort(move || {
        // SAFETY: the aborting operation still write-holds the vinode
        // lock; no other reference to the inner data is live while the
        // abort callbacks run.
        unsafe { &mut *inner.data_ptr() }.destroy_data_state();
    });

    remove_interval(tx, guard, size, u64::MAX - size);
    let old_size = guard.inode().size();
    if old_size < size {
        allocate_interval(pool, tx, guard, old_size, size - old_size)?;
    }
    if old_size != size {
        guard.set_size(tx, size);
        guard.set_mtime(tx, crate::layout::Time::now());
    }
    Ok(())
}

/// Smallest offset ≥ `offset` inside an allocated block, or `fsize`.
pub(crate) fn seek_data(store: &ObjStore, inner: &VinodeInner, offset: i64, fsize: i64) -> i64 {
    let block = find_le(inner, offset as u64);
    if block == 0 {
        // before the first block
        if inner.first_block == 0 {
            return fsize; // no data in the whole file
        }
        return desc(store, inner.first_block).offset as i64;
    }
    if desc(store, block).contains(offset as u64) {
        return offset;
    }
    let next = desc(store, block).next;
    if next == 0 {
        return fsize; // no more data in the file
    }
    desc(store, next).offset as i64
}

/// Smallest offset ≥ `offset` not covered by a block; `offset` itself
/// when it already sits in a hole.
pub(crate) fn seek_hole(store: &ObjStore, inner: &VinodeInner, offset: i64, fsize: i64) -> i64 {
    let mut offset = offset;
    let mut block = find_le(inner, offset as u64);

    while block != 0 && offset < fsize {
        let d = desc(store, block);
        let block_end = d.end() as i64;
        let next = d.next;

        if block_end >= offset {
            offset = block_end; // seek to the end of this block
        }
        if next == 0 {
            break; // the rest of the file is a hole
        }
        if offset < desc(store, next).offset as i64 {
            break; // a hole between two blocks
        }
        block = next;
    }
    offset
}

/// Release every data block and overflow descriptor array; used when
/// reclaiming a regular file's inode.
pub(crate) fn free_file_blocks(store: &ObjStore, tx: &Tx<'_>, tinode: Obj<Inode>) {
    let mut arr = inline_array(tinode);
    while arr != 0 {
        for d in array_descs(store, arr) {
            if d.data != 0 {
                tx.free(d.data);
            }
        }
        let next = array_hdr(store, arr).next;
        if arr != inline_array(tinode) {
            tx.free(arr);
        }
        arr = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let mut off = 5000;
        let mut len = 100;
        expand_to_full_pages(&mut off, &mut len);
        assert_eq!((off, len), (4096, 4096));

        let mut off = 5000;
        let mut len = 8192;
        narrow_to_full_pages(&mut off, &mut len);
        assert_eq!((off, len), (8192, 4096));

        let mut off = 4096;
        let mut len = 100;
        narrow_to_full_pages(&mut off, &mut len);
        assert_eq!(len, 0);
    }

    #[test]
    fn overallocation_tiers() {
        assert_eq!(overallocate_size(1), 16 * 1024);
        assert_eq!(overallocate_size(4096), 16 * 1024);
        assert_eq!(overallocate_size(4097), 256 * 1024);
        assert_eq!(overallocate_size(64 * 1024), 256 * 1024);
        assert_eq!(overallocate_size(1024 * 1024), 4 * 1024 * 1024);
        assert_eq!(overallocate_size(2 * 1024 * 1024), 64 * 1024 * 1024);
        assert_eq!(overallocate_size(65 * 1024 * 1024), 65 * 1024 * 1024);
    }
}
