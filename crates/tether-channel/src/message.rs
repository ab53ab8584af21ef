//! Borrowed views of blocks inside a region.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::Result;
use crate::header::Header;
use crate::layout::{BlockHeader, MessageState, RegionView};

/// One message, borrowed from the [`Header`] that handed it out.
///
/// A message obtained from `allocate` is owned by the producer until it is
/// passed to `send`; one obtained from `receive` is owned by the consumer
/// until it is released. The payload must not be touched after `release`.
pub struct Message<'a> {
    block: NonNull<BlockHeader>,
    payload: NonNull<u8>,
    capacity: u32,
    offset: u32,
    _header: PhantomData<&'a Header>,
}

impl Message<'_> {
    pub(crate) fn at(view: &RegionView, offset: u32) -> Result<Self> {
        let block = NonNull::from(view.block(offset)?);
        let (payload, capacity) = view.payload(offset)?;
        Ok(Self {
            block,
            payload,
            capacity,
            offset,
            _header: PhantomData,
        })
    }

    fn header(&self) -> &BlockHeader {
        // SAFETY: the block lies inside a region kept alive by the borrowed
        // header; its fields are atomics.
        unsafe { self.block.as_ref() }
    }

    pub(crate) const fn block_ptr(&self) -> NonNull<BlockHeader> {
        self.block
    }

    /// Payload length requested by the producer.
    pub fn len(&self) -> usize {
        self.header()
            .requested
            .load(Ordering::Acquire)
            .min(self.capacity) as usize
    }

    /// Check whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload capacity of the underlying block.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Block offset within its region.
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Option<MessageState> {
        self.header().state()
    }

    /// The payload.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` never exceeds the block capacity, which lies inside
        // the region; the holder of the message owns the block.
        unsafe { std::slice::from_raw_parts(self.payload.as_ptr(), self.len()) }
    }

    /// The payload, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; `&mut self` makes this the only view.
        unsafe { std::slice::from_raw_parts_mut(self.payload.as_ptr(), self.len()) }
    }
}

impl AsRef<[u8]> for Message<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for Message<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .finish()
    }
}
