//! First-fit free list with boundary coalescing.
//!
//! Free blocks form a doubly linked list through `next`/`prev`. Allocation
//! takes the first block large enough and splits off the tail when the
//! remainder can hold a header plus one minimal payload. Releasing a block
//! merges it with a free physical neighbour on either side, so adjacent free
//! space never stays fragmented.
//!
//! Only the producer side of a region touches the free list, always under
//! its local lock.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::layout::{ALIGN, HEADER_SIZE, MessageState, NIL, RegionView, payload_size};
use crate::{ChannelError, Result};

fn head(view: &RegionView) -> u32 {
    view.prologue().free_head.load(Ordering::Acquire)
}

fn insert(view: &RegionView, offset: u32) -> Result<()> {
    let block = view.block(offset)?;
    let old_head = head(view);
    block.next.store(old_head, Ordering::Relaxed);
    block.prev.store(NIL, Ordering::Relaxed);
    if old_head != NIL {
        view.block(old_head)?.prev.store(offset, Ordering::Relaxed);
    }
    block.set_state(MessageState::Free);
    view.prologue().free_head.store(offset, Ordering::Release);
    Ok(())
}

fn unlink(view: &RegionView, offset: u32) -> Result<()> {
    let block = view.block(offset)?;
    let next = block.next.load(Ordering::Relaxed);
    let prev = block.prev.load(Ordering::Relaxed);
    if prev == NIL {
        view.prologue().free_head.store(next, Ordering::Release);
    } else {
        view.block(prev)?.next.store(next, Ordering::Relaxed);
    }
    if next != NIL {
        view.block(next)?.prev.store(prev, Ordering::Relaxed);
    }
    block.next.store(NIL, Ordering::Relaxed);
    block.prev.store(NIL, Ordering::Relaxed);
    Ok(())
}

fn set_prev_phys_after(view: &RegionView, offset: u32, prev_phys: u32) -> Result<()> {
    if let Some(next) = view.next_physical(offset)? {
        view.block(next)?.prev_phys.store(prev_phys, Ordering::Relaxed);
    }
    Ok(())
}

/// Free blocks in list order as `(offset, payload capacity)`.
pub fn entries(view: &RegionView) -> Result<Vec<(u32, u32)>> {
    let mut entries = Vec::new();
    let mut offset = head(view);
    while offset != NIL {
        let block = view.block(offset)?;
        entries.push((offset, block.size()));
        if entries.len() > view.size() as usize / HEADER_SIZE as usize {
            return Err(ChannelError::Corrupted { offset });
        }
        offset = block.next.load(Ordering::Relaxed);
    }
    Ok(entries)
}

/// Payload capacity of the largest free block.
pub fn largest(view: &RegionView) -> Result<u32> {
    Ok(entries(view)?
        .into_iter()
        .map(|(_, size)| size)
        .max()
        .unwrap_or(0))
}

/// Take a block able to hold `len` bytes and mark it allocated.
///
/// Fails with [`ChannelError::OutOfSpace`] without touching the list when
/// nothing fits.
pub fn allocate(view: &RegionView, len: u32) -> Result<u32> {
    let out_of_space = |view: &RegionView| -> Result<ChannelError> {
        Ok(ChannelError::OutOfSpace {
            requested: len,
            largest_free: largest(view)?,
        })
    };
    let Some(needed) = payload_size(len) else {
        return Err(out_of_space(view)?);
    };

    let mut offset = head(view);
    while offset != NIL {
        let block = view.block(offset)?;
        let size = block.size();
        if size >= needed {
            unlink(view, offset)?;

            if size - needed >= HEADER_SIZE + ALIGN {
                let remainder = offset + HEADER_SIZE + needed;
                let tail = view.block(remainder)?;
                tail.size
                    .store(size - needed - HEADER_SIZE, Ordering::Relaxed);
                tail.prev_phys.store(offset, Ordering::Relaxed);
                tail.requested.store(0, Ordering::Relaxed);
                set_prev_phys_after(view, remainder, remainder)?;
                block.size.store(needed, Ordering::Release);
                insert(view, remainder)?;
            }

            block.requested.store(len, Ordering::Relaxed);
            block.set_state(MessageState::Alloc);
            debug!(
                "Allocated block {offset:#x} ({} bytes for {len} requested)",
                block.size()
            );
            return Ok(offset);
        }
        offset = block.next.load(Ordering::Relaxed);
    }

    Err(out_of_space(view)?)
}

/// Return the block at `offset` to the list, merging with free neighbours.
pub fn unallocate(view: &RegionView, offset: u32) -> Result<()> {
    let block = view.block(offset)?;
    block.requested.store(0, Ordering::Relaxed);

    if let Some(next) = view.next_physical(offset)? {
        let neighbour = view.block(next)?;
        if neighbour.state() == Some(MessageState::Free) {
            unlink(view, next)?;
            let merged = block.size() + HEADER_SIZE + neighbour.size();
            neighbour.state.store(0, Ordering::Release);
            block.size.store(merged, Ordering::Release);
            set_prev_phys_after(view, offset, offset)?;
        }
    }

    let prev = block.prev_phys.load(Ordering::Relaxed);
    if prev != NIL {
        let neighbour = view.block(prev)?;
        if neighbour.state() == Some(MessageState::Free) {
            let merged = neighbour.size() + HEADER_SIZE + block.size();
            block.state.store(0, Ordering::Release);
            neighbour.size.store(merged, Ordering::Release);
            set_prev_phys_after(view, prev, prev)?;
            debug!("Coalesced block {offset:#x} into {prev:#x}");
            return Ok(());
        }
    }

    insert(view, offset)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::layout::{BlockInfo, FIRST_BLOCK, TestRegion};

    fn formatted(size: u32) -> (TestRegion, RegionView) {
        let mut region = TestRegion::new(size);
        let view = region.view();
        view.format().expect("format");
        (region, view)
    }

    fn assert_tiled(view: &RegionView) {
        let blocks = view.blocks().expect("walk");
        let covered: u32 = blocks.iter().map(BlockInfo::span).sum();
        assert_eq!(crate::layout::PROLOGUE_SIZE + covered, view.size());
        for pair in blocks.windows(2) {
            let prev_phys = view
                .block(pair[1].offset)
                .expect("block")
                .prev_phys
                .load(Ordering::Relaxed);
            assert_eq!(prev_phys, pair[0].offset);
        }
    }

    #[test]
    fn test_split_and_merge_back() {
        let (_region, view) = formatted(4096);
        let a = allocate(&view, 100).expect("allocate");
        let b = allocate(&view, 100).expect("allocate");
        assert_eq!(a, FIRST_BLOCK);
        assert_eq!(b, FIRST_BLOCK + HEADER_SIZE + 104);
        assert_eq!(entries(&view).expect("entries"), vec![(b + HEADER_SIZE + 104, 3736)]);
        assert_tiled(&view);

        unallocate(&view, a).expect("unallocate");
        assert_eq!(entries(&view).expect("entries").len(), 2);
        unallocate(&view, b).expect("unallocate");
        assert_eq!(entries(&view).expect("entries"), vec![(FIRST_BLOCK, 3992)]);
        assert_tiled(&view);
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let (_region, view) = formatted(4096);
        // Leaves 16 bytes, less than a header plus one unit
        let offset = allocate(&view, 3992 - 16).expect("allocate");
        assert_eq!(view.block(offset).expect("block").size(), 3992);
        assert!(entries(&view).expect("entries").is_empty());
        assert_tiled(&view);
    }

    #[test]
    fn test_out_of_space_leaves_list_alone() {
        let (_region, view) = formatted(1024);
        let _a = allocate(&view, 200).expect("allocate");
        let before = view.blocks().expect("walk");
        let free_before = entries(&view).expect("entries");

        let err = allocate(&view, 2000).expect_err("too large");
        assert!(matches!(
            err,
            ChannelError::OutOfSpace {
                requested: 2000,
                largest_free
            } if largest_free == free_before[0].1
        ));
        assert_eq!(view.blocks().expect("walk"), before);
        assert_eq!(entries(&view).expect("entries"), free_before);

        assert!(matches!(
            allocate(&view, u32::MAX),
            Err(ChannelError::OutOfSpace { .. })
        ));
    }

    #[test]
    fn test_merge_with_both_neighbours() {
        let (_region, view) = formatted(4096);
        let a = allocate(&view, 64).expect("allocate");
        let b = allocate(&view, 64).expect("allocate");
        let c = allocate(&view, 64).expect("allocate");
        let _d = allocate(&view, 64).expect("allocate");

        unallocate(&view, a).expect("unallocate");
        unallocate(&view, c).expect("unallocate");
        assert_eq!(entries(&view).expect("entries").len(), 3);

        // b joins a on the left and c on the right
        unallocate(&view, b).expect("unallocate");
        let free = entries(&view).expect("entries");
        assert!(free.contains(&(a, 64 * 3 + HEADER_SIZE * 2)));
        assert_eq!(free.len(), 2);
        assert_eq!(view.block(b).expect("block").state(), None);
        assert_tiled(&view);
    }
}
