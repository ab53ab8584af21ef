//! Byte layout of a channel region.
//!
//! ```text
//! offset  size  content
//! 0x00    4     total size
//! 0x04    4     ready magic (written last by the creator)
//! 0x08    8     receive queue anchor (push end, pop end)
//! 0x10    8     reclaim queue anchor (push end, pop end)
//! 0x18    4     free list head
//! 0x1c    4     reserved
//! 0x20    24    receive queue stub block (Nil)
//! 0x38    24    reclaim queue stub block (Nil)
//! 0x50    ...   Free block spanning the rest of the region
//! ```
//!
//! Every block is a 24 byte [`BlockHeader`] followed by its payload. Blocks
//! tile the area after the prologue with no gaps. All links are byte
//! offsets from the region base so that each process can map the region at
//! its own address; [`NIL`] is the null link.

#![allow(unsafe_code)]

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::{ChannelError, Result};

/// Null link.
pub const NIL: u32 = u32::MAX;

/// Granularity of block sizes and offsets.
pub const ALIGN: u32 = 8;

/// Bytes of fixed bookkeeping before the first block.
pub const PROLOGUE_SIZE: u32 = size_of::<Prologue>() as u32;

/// Bytes of header in front of every payload.
pub const HEADER_SIZE: u32 = size_of::<BlockHeader>() as u32;

/// Stub block of the receive queue.
pub const RECEIVE_STUB: u32 = PROLOGUE_SIZE;

/// Stub block of the reclaim queue.
pub const RECLAIM_STUB: u32 = RECEIVE_STUB + HEADER_SIZE;

/// First allocatable block.
pub const FIRST_BLOCK: u32 = RECLAIM_STUB + HEADER_SIZE;

/// Smallest region that holds one minimal payload.
pub const MIN_REGION_SIZE: u32 = FIRST_BLOCK + HEADER_SIZE + ALIGN;

/// Published by the creator once the layout is in place.
pub const READY_MAGIC: u32 = 0x5445_5448;

/// Round `len` up to the block granularity, with a minimum of one unit.
pub const fn payload_size(len: u32) -> Option<u32> {
    let len = if len == 0 { 1 } else { len };
    match len.checked_add(ALIGN - 1) {
        Some(padded) => Some(padded & !(ALIGN - 1)),
        None => None,
    }
}

/// Check a region size against the layout.
pub fn validate_size(size: u32) -> Result<()> {
    if size < MIN_REGION_SIZE || size % ALIGN != 0 {
        return Err(ChannelError::InvalidSize {
            size,
            min: MIN_REGION_SIZE,
        });
    }
    Ok(())
}

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageState {
    /// On the free list.
    Free = 1,
    /// Handed to a producer, not yet sent.
    Alloc = 2,
    /// On the receive queue.
    Sent = 3,
    /// Handed to a consumer.
    Recv = 4,
    /// On the reclaim queue.
    Pend = 5,
    /// Queue stub; never carries payload.
    Nil = 6,
}

impl MessageState {
    /// Decode a state word.
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Free),
            2 => Some(Self::Alloc),
            3 => Some(Self::Sent),
            4 => Some(Self::Recv),
            5 => Some(Self::Pend),
            6 => Some(Self::Nil),
            _ => None,
        }
    }

    /// Whether the block is owned by a producer, a consumer or a queue.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Alloc | Self::Sent | Self::Recv | Self::Pend)
    }
}

/// Header in front of every block.
#[repr(C)]
#[derive(Debug)]
pub struct BlockHeader {
    /// Payload capacity in bytes, excluding this header.
    pub size: AtomicU32,
    /// [`MessageState`] as a word; zero for absorbed headers.
    pub state: AtomicU32,
    /// Forward link of whichever list holds the block.
    pub next: AtomicU32,
    /// Backward link, free list only.
    pub prev: AtomicU32,
    /// Offset of the block physically in front of this one.
    pub prev_phys: AtomicU32,
    /// Payload length the allocating caller asked for.
    pub requested: AtomicU32,
}

impl BlockHeader {
    /// Current state, `None` for an unknown word.
    pub fn state(&self) -> Option<MessageState> {
        MessageState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Store a new state.
    pub fn set_state(&self, state: MessageState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Move from `from` to `to`, failing if the block is elsewhere.
    pub fn transition(&self, offset: u32, from: MessageState, to: MessageState) -> Result<()> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|found| ChannelError::InvalidState {
                offset,
                state: MessageState::from_u32(found),
            })
    }

    /// Payload capacity.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }
}

/// Two ends of an intrusive queue.
#[repr(C)]
#[derive(Debug)]
pub struct QueueAnchor {
    /// Most recently pushed block; swapped by producers.
    pub push_end: AtomicU32,
    /// Next block to pop; touched only by the queue's consumer.
    pub pop_end: AtomicU32,
}

/// Fixed bookkeeping at the start of a region.
#[repr(C)]
#[derive(Debug)]
pub struct Prologue {
    /// Size of the whole region in bytes.
    pub total_size: AtomicU32,
    /// [`READY_MAGIC`] once the creator has finished.
    pub ready_magic: AtomicU32,
    /// Sent messages waiting for the consumer.
    pub receive: QueueAnchor,
    /// Released messages waiting for the producer.
    pub reclaim: QueueAnchor,
    /// First block of the free list.
    pub free_head: AtomicU32,
    /// Zero.
    pub reserved: AtomicU32,
}

impl Prologue {
    /// Check whether the creator has published the region.
    pub fn is_ready(&self) -> bool {
        self.ready_magic.load(Ordering::Acquire) == READY_MAGIC
    }
}

/// One block as seen by a walk over the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Offset of the block header.
    pub offset: u32,
    /// Payload capacity.
    pub size: u32,
    /// Current state.
    pub state: Option<MessageState>,
}

impl BlockInfo {
    /// Bytes the block occupies including its header.
    pub const fn span(&self) -> u32 {
        HEADER_SIZE + self.size
    }
}

/// Typed access to a mapped region.
///
/// Every accessor bounds-checks the offset it is given, so a corrupted link
/// surfaces as [`ChannelError::Corrupted`] instead of a stray access.
#[derive(Debug, Clone, Copy)]
pub struct RegionView {
    base: NonNull<u8>,
    size: u32,
}

// SAFETY: the view only hands out shared references to atomics and raw
// payload pointers; the region outlives every view (owned by the header).
unsafe impl Send for RegionView {}
// SAFETY: see above.
unsafe impl Sync for RegionView {}

impl RegionView {
    /// Wrap a mapped range.
    ///
    /// # Safety
    ///
    /// `base` must be 8-byte aligned and valid for reads and writes of
    /// `size` bytes for as long as the view or anything derived from it is
    /// used.
    pub const unsafe fn new(base: NonNull<u8>, size: u32) -> Self {
        Self { base, size }
    }

    /// Region base address.
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Region size in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// The fixed bookkeeping words.
    pub fn prologue(&self) -> &Prologue {
        // SAFETY: the region is at least PROLOGUE_SIZE bytes and aligned;
        // all fields are atomics, so shared references are sound across
        // threads and processes.
        unsafe { self.base.cast::<Prologue>().as_ref() }
    }

    /// Header of the block at `offset`.
    pub fn block(&self, offset: u32) -> Result<&BlockHeader> {
        if offset < PROLOGUE_SIZE
            || offset % ALIGN != 0
            || u64::from(offset) + u64::from(HEADER_SIZE) > u64::from(self.size)
        {
            return Err(ChannelError::Corrupted { offset });
        }
        // SAFETY: the header lies within the region and is aligned.
        Ok(unsafe { self.base.add(offset as usize).cast::<BlockHeader>().as_ref() })
    }

    /// Payload start and capacity of the block at `offset`.
    pub fn payload(&self, offset: u32) -> Result<(NonNull<u8>, u32)> {
        let size = self.block(offset)?.size();
        let start = offset + HEADER_SIZE;
        if u64::from(start) + u64::from(size) > u64::from(self.size) {
            return Err(ChannelError::Corrupted { offset });
        }
        // SAFETY: `start` is within the region, checked above.
        Ok((unsafe { self.base.add(start as usize) }, size))
    }

    /// Offset of a block header address, if it lies in this region.
    pub fn offset_of(&self, header: NonNull<BlockHeader>) -> Option<u32> {
        let base = self.base.as_ptr() as usize;
        let addr = header.as_ptr() as usize;
        let offset = u32::try_from(addr.checked_sub(base)?).ok()?;
        if offset < RECEIVE_STUB
            || offset % ALIGN != 0
            || u64::from(offset) + u64::from(HEADER_SIZE) > u64::from(self.size)
        {
            return None;
        }
        Some(offset)
    }

    /// Offset of the block physically after `offset`, if any.
    pub fn next_physical(&self, offset: u32) -> Result<Option<u32>> {
        let size = self.block(offset)?.size();
        let next = u64::from(offset) + u64::from(HEADER_SIZE) + u64::from(size);
        match next.cmp(&u64::from(self.size)) {
            std::cmp::Ordering::Less => Ok(Some(next as u32)),
            std::cmp::Ordering::Equal => Ok(None),
            std::cmp::Ordering::Greater => Err(ChannelError::Corrupted { offset }),
        }
    }

    /// Write a fresh layout: two stubs and one free block.
    ///
    /// Does not publish the region; see [`RegionView::publish`].
    pub fn format(&self) -> Result<()> {
        validate_size(self.size)?;

        let prologue = self.prologue();
        prologue.ready_magic.store(0, Ordering::Relaxed);
        for (anchor, stub) in [
            (&prologue.receive, RECEIVE_STUB),
            (&prologue.reclaim, RECLAIM_STUB),
        ] {
            anchor.push_end.store(stub, Ordering::Relaxed);
            anchor.pop_end.store(stub, Ordering::Relaxed);
        }
        prologue.free_head.store(FIRST_BLOCK, Ordering::Relaxed);
        prologue.reserved.store(0, Ordering::Relaxed);

        let stubs = [(RECEIVE_STUB, NIL), (RECLAIM_STUB, RECEIVE_STUB)];
        for (offset, prev_phys) in stubs {
            let stub = self.block(offset)?;
            stub.size.store(0, Ordering::Relaxed);
            stub.next.store(NIL, Ordering::Relaxed);
            stub.prev.store(NIL, Ordering::Relaxed);
            stub.prev_phys.store(prev_phys, Ordering::Relaxed);
            stub.requested.store(0, Ordering::Relaxed);
            stub.set_state(MessageState::Nil);
        }

        let free = self.block(FIRST_BLOCK)?;
        free.size
            .store(self.size - FIRST_BLOCK - HEADER_SIZE, Ordering::Relaxed);
        free.next.store(NIL, Ordering::Relaxed);
        free.prev.store(NIL, Ordering::Relaxed);
        free.prev_phys.store(RECLAIM_STUB, Ordering::Relaxed);
        free.requested.store(0, Ordering::Relaxed);
        free.set_state(MessageState::Free);
        Ok(())
    }

    /// Write the size word and, last, the ready magic.
    pub fn publish(&self) {
        let prologue = self.prologue();
        prologue.total_size.store(self.size, Ordering::Relaxed);
        prologue.ready_magic.store(READY_MAGIC, Ordering::Release);
    }

    /// Walk every block in memory order.
    pub fn blocks(&self) -> Result<Vec<BlockInfo>> {
        let mut blocks = Vec::new();
        let mut offset = Some(RECEIVE_STUB);
        while let Some(current) = offset {
            let block = self.block(current)?;
            blocks.push(BlockInfo {
                offset: current,
                size: block.size(),
                state: block.state(),
            });
            offset = self.next_physical(current)?;
        }
        Ok(blocks)
    }
}

/// Heap stand-in for a mapped region.
#[cfg(test)]
pub(crate) struct TestRegion {
    words: Vec<u64>,
}

#[cfg(test)]
impl TestRegion {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            words: vec![0; size as usize / 8],
        }
    }

    pub(crate) fn view(&mut self) -> RegionView {
        let size = (self.words.len() * 8) as u32;
        let base =
            NonNull::new(self.words.as_mut_ptr().cast::<u8>()).unwrap_or(NonNull::dangling());
        // SAFETY: the vector is 8-byte aligned and outlives the view in
        // every test that uses it.
        unsafe { RegionView::new(base, size) }
    }
}
