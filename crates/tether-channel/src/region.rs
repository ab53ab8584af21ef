//! Byte ranges a header can be laid out in.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::layout::{ALIGN, RegionView, validate_size};
use crate::shm::SharedRegion;
use crate::{ChannelError, Result};

/// Zeroed heap allocation used for in-process channels.
#[derive(Debug)]
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is owned exclusively by this value and accessed
// through the atomics of the region layout.
unsafe impl Send for HeapRegion {}
// SAFETY: see above.
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Allocate `size` zeroed bytes.
    pub fn new(size: u32) -> Result<Self> {
        validate_size(size)?;
        let layout = Layout::from_size_align(size as usize, ALIGN as usize)
            .map_err(|e| ChannelError::InvalidConfig(format!("region layout: {e}")))?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Backing storage of one channel direction.
#[derive(Debug)]
pub enum Region {
    /// Named POSIX shared memory, visible to other processes.
    Shared(SharedRegion),
    /// Private heap memory, visible to this process only.
    Heap(HeapRegion),
}

impl Region {
    /// Base address.
    pub fn base(&self) -> NonNull<u8> {
        match self {
            Self::Shared(region) => region.base(),
            Self::Heap(region) => region.ptr,
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Self::Shared(region) => region.size(),
            Self::Heap(region) => region.layout.size() as u32,
        }
    }

    /// Shared memory name, `None` for heap regions.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Shared(region) => Some(region.name()),
            Self::Heap(_) => None,
        }
    }

    pub(crate) fn view(&self) -> RegionView {
        // SAFETY: both variants are 8-byte aligned and valid for `size`
        // bytes until dropped; the header owning this region outlives every
        // view it hands out.
        unsafe { RegionView::new(self.base(), self.size()) }
    }
}

impl From<SharedRegion> for Region {
    fn from(region: SharedRegion) -> Self {
        Self::Shared(region)
    }
}

impl From<HeapRegion> for Region {
    fn from(region: HeapRegion) -> Self {
        Self::Heap(region)
    }
}
