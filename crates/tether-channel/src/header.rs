//! One direction of a channel.
//!
//! A [`Header`] binds a region laid out per [`crate::layout`] to the
//! counting semaphore that tells the consumer how many messages are queued.
//! The producer side allocates, sends and reclaims; the consumer side
//! receives and releases. Both sides may live in different processes, each
//! with its own `Header` over its own mapping of the same region and its
//! own handle to the same named semaphore.
//!
//! # Lifecycle of a block
//!
//! ```text
//! Free --allocate--> Alloc --send--> Sent --receive--> Recv --release--> Pend
//!   ^                  |                                                  |
//!   +----release-------+                                                  |
//!   +-----------------------reclaimed by the next allocate----------------+
//! ```

use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_sync::{Handle, Semaphore, Timeout, WaitObject};
use tracing::{debug, info, warn};

use crate::free_list;
use crate::layout::{
    BlockInfo, FIRST_BLOCK, HEADER_SIZE, MessageState, RECEIVE_STUB, RECLAIM_STUB, RegionView,
};
use crate::message::Message;
use crate::queue::{self, Pop};
use crate::region::{HeapRegion, Region};
use crate::{ChannelError, Result};

/// Yields a receive spends waiting for an unfinished push before giving up.
const STALL_SPINS: u32 = 100_000;

/// Outcome of a send or flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    /// Every queued message has been signalled to the consumer.
    Delivered,
    /// The semaphore is at its maximum. The messages are queued; `deferred`
    /// notifications will be posted by the next send or flush.
    ChannelFull {
        /// Notifications still owed to the consumer
        deferred: u32,
    },
}

impl SendStatus {
    /// Check whether notifications are still owed.
    pub const fn is_full(self) -> bool {
        matches!(self, Self::ChannelFull { .. })
    }
}

/// Snapshot of a region's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderStats {
    /// Size of the region in bytes
    pub region_size: u32,
    /// Payload bytes on the free list
    pub free_bytes: u32,
    /// Blocks on the free list
    pub free_blocks: u32,
    /// Payload capacity of the largest free block
    pub largest_free: u32,
    /// Blocks allocated, queued, received or awaiting reclaim
    pub in_flight: u32,
    /// Notifications not yet posted
    pub deferred: u32,
}

/// Owner of one channel direction: region, semaphore and block lists.
pub struct Header {
    region: Region,
    view: RegionView,
    semaphore: Semaphore,
    /// Producer side lock; holds the count of deferred notifications.
    producer: Mutex<u32>,
    consumer: Mutex<()>,
}

impl Header {
    /// Semaphore maximum for a region of `size` bytes.
    ///
    /// No region can hold more messages than it has header-sized slots,
    /// and no semaphore counts past [`Semaphore::CAPACITY_LIMIT`]. The
    /// semaphore may clamp further to its pipe's actual capacity.
    pub const fn semaphore_max(size: u32) -> u32 {
        let slots = size / HEADER_SIZE;
        if slots > Semaphore::CAPACITY_LIMIT {
            Semaphore::CAPACITY_LIMIT
        } else {
            slots
        }
    }

    /// Create a private header backed by heap memory and an anonymous
    /// semaphore.
    pub fn in_memory(size: u32) -> Result<Self> {
        let region = HeapRegion::new(size)?;
        let semaphore = Semaphore::new(Self::semaphore_max(size), 0)?;
        Self::format(region.into(), semaphore)
    }

    /// Lay out a fresh region and publish it.
    pub fn format(region: Region, semaphore: Semaphore) -> Result<Self> {
        let view = region.view();
        view.format()?;
        view.publish();
        info!(
            "Formatted region {} ({} bytes, {} bytes usable)",
            region.name().unwrap_or("<heap>"),
            view.size(),
            view.size() - FIRST_BLOCK - HEADER_SIZE
        );
        Ok(Self::assemble(region, view, semaphore))
    }

    /// Attach to a region another header has already published.
    pub fn attach(region: Region, semaphore: Semaphore) -> Result<Self> {
        let view = region.view();
        let name = region.name().unwrap_or("<heap>").to_string();
        let prologue = view.prologue();
        if !prologue.is_ready() {
            return Err(ChannelError::NotInitialized(name));
        }
        let published = prologue.total_size.load(Ordering::Acquire);
        if published != view.size() {
            return Err(ChannelError::InvalidSize {
                size: published,
                min: view.size(),
            });
        }
        info!("Attached to region {name} ({} bytes)", view.size());
        Ok(Self::assemble(region, view, semaphore))
    }

    fn assemble(region: Region, view: RegionView, semaphore: Semaphore) -> Self {
        Self {
            region,
            view,
            semaphore,
            producer: Mutex::new(0),
            consumer: Mutex::new(()),
        }
    }

    /// Reserve a message able to hold `len` bytes.
    ///
    /// Everything released by the consumer is folded back into free space
    /// first. Fails with [`ChannelError::OutOfSpace`] if nothing fits; the
    /// caller decides when to try again.
    pub fn allocate(&self, len: u32) -> Result<Message<'_>> {
        let _producer = self.producer.lock();
        self.drain_reclaim()?;
        let offset = free_list::allocate(&self.view, len)?;
        Message::at(&self.view, offset)
    }

    /// Fold released messages back into free space without allocating.
    ///
    /// Returns the number of blocks reclaimed.
    pub fn reclaim(&self) -> Result<usize> {
        let _producer = self.producer.lock();
        self.drain_reclaim()
    }

    fn drain_reclaim(&self) -> Result<usize> {
        let anchor = &self.view.prologue().reclaim;
        let mut drained = 0;
        // A push still in progress is picked up by a later drain.
        while let Pop::Item(offset) = queue::pop(&self.view, anchor, RECLAIM_STUB)? {
            let block = self.view.block(offset)?;
            match block.state() {
                Some(MessageState::Pend) => free_list::unallocate(&self.view, offset)?,
                state => return Err(ChannelError::InvalidState { offset, state }),
            }
            drained += 1;
        }
        if drained > 0 {
            debug!("Reclaimed {drained} released blocks");
        }
        Ok(drained)
    }

    /// Queue an allocated message for the consumer and signal it.
    ///
    /// The message is linked in before any signal is attempted. If the
    /// semaphore is at its maximum the signal is deferred, not lost, and
    /// [`SendStatus::ChannelFull`] reports how many are owed.
    pub fn send(&self, message: Message<'_>) -> Result<SendStatus> {
        let offset = self
            .view
            .offset_of(message.block_ptr())
            .ok_or(ChannelError::ForeignMessage)?;

        let mut deferred = self.producer.lock();
        self.view
            .block(offset)?
            .transition(offset, MessageState::Alloc, MessageState::Sent)?;
        queue::push(&self.view, &self.view.prologue().receive, offset)?;
        *deferred += 1;
        self.post(&mut deferred)
    }

    /// Post notifications deferred by earlier sends.
    pub fn flush(&self) -> Result<SendStatus> {
        let mut deferred = self.producer.lock();
        self.post(&mut deferred)
    }

    fn post(&self, deferred: &mut u32) -> Result<SendStatus> {
        if *deferred == 0 {
            return Ok(SendStatus::Delivered);
        }
        let posted = self.semaphore.try_unlock(*deferred)?;
        *deferred -= posted;
        if *deferred == 0 {
            Ok(SendStatus::Delivered)
        } else {
            warn!(
                "Semaphore full, deferring {} notifications until the consumer catches up",
                *deferred
            );
            Ok(SendStatus::ChannelFull {
                deferred: *deferred,
            })
        }
    }

    /// Block until a message is queued, then take the oldest one.
    ///
    /// Fails with [`tether_sync::SyncError::TimedOut`] (wrapped) when
    /// nothing arrives within `timeout`.
    pub fn receive(&self, timeout: Timeout) -> Result<Message<'_>> {
        let _consumer = self.consumer.lock();
        self.semaphore.lock(timeout)?;
        self.take()
    }

    /// Take the oldest queued message if there is one.
    pub fn try_receive(&self) -> Result<Option<Message<'_>>> {
        let _consumer = self.consumer.lock();
        if !self.semaphore.try_lock()? {
            return Ok(None);
        }
        self.take().map(Some)
    }

    /// Pop after a count has been claimed.
    fn take(&self) -> Result<Message<'_>> {
        let anchor = &self.view.prologue().receive;
        for _ in 0..STALL_SPINS {
            match queue::pop(&self.view, anchor, RECEIVE_STUB)? {
                Pop::Item(offset) => {
                    self.view
                        .block(offset)?
                        .transition(offset, MessageState::Sent, MessageState::Recv)?;
                    return Message::at(&self.view, offset);
                }
                Pop::Empty | Pop::Busy => std::thread::yield_now(),
            }
        }

        // Hand the count back so the message is not stranded
        if let Err(e) = self.semaphore.try_unlock(1) {
            warn!("Failed to return semaphore count after a stalled receive: {e}");
        }
        Err(ChannelError::QueueStalled)
    }

    /// Give a message back.
    ///
    /// Returns `Ok(false)` without touching anything if the message lies
    /// outside this header's region, so the caller can try the other
    /// direction. Allocated messages go straight back to the free list;
    /// received ones are queued for the producer to reclaim. Any other
    /// state, such as a second release, fails with
    /// [`ChannelError::InvalidState`].
    pub fn release(&self, message: &Message<'_>) -> Result<bool> {
        let Some(offset) = self.view.offset_of(message.block_ptr()) else {
            return Ok(false);
        };
        let block = self.view.block(offset)?;

        match block.state() {
            Some(MessageState::Alloc) => {
                let _producer = self.producer.lock();
                block.transition(offset, MessageState::Alloc, MessageState::Free)?;
                free_list::unallocate(&self.view, offset)?;
                debug!("Returned unsent block {offset:#x}");
            }
            Some(MessageState::Recv) => {
                block.transition(offset, MessageState::Recv, MessageState::Pend)?;
                queue::push(&self.view, &self.view.prologue().reclaim, offset)?;
            }
            // Queue stubs never leave their place
            Some(MessageState::Nil) => {}
            state => return Err(ChannelError::InvalidState { offset, state }),
        }
        Ok(true)
    }

    /// Check whether `message` lies in this header's region.
    pub fn contains(&self, message: &Message<'_>) -> bool {
        self.view.offset_of(message.block_ptr()).is_some()
    }

    /// Walk every block in memory order.
    ///
    /// Consistent with this header's own operations; blocks changed by the
    /// peer process during the walk may show either state.
    pub fn blocks(&self) -> Result<Vec<BlockInfo>> {
        let _producer = self.producer.lock();
        self.view.blocks()
    }

    /// Free blocks in list order as `(offset, payload capacity)`.
    pub fn free_blocks(&self) -> Result<Vec<(u32, u32)>> {
        let _producer = self.producer.lock();
        free_list::entries(&self.view)
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> Result<HeaderStats> {
        let deferred = self.producer.lock();
        let mut stats = HeaderStats {
            region_size: self.view.size(),
            free_bytes: 0,
            free_blocks: 0,
            largest_free: 0,
            in_flight: 0,
            deferred: *deferred,
        };
        for block in self.view.blocks()? {
            match block.state {
                Some(MessageState::Free) => {
                    stats.free_bytes += block.size;
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(block.size);
                }
                Some(state) if state.is_in_flight() => stats.in_flight += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Largest payload a fresh region of this size can hold.
    pub const fn capacity(&self) -> u32 {
        self.view.size() - FIRST_BLOCK - HEADER_SIZE
    }

    /// Region size in bytes.
    pub const fn size(&self) -> u32 {
        self.view.size()
    }

    /// Shared memory name, `None` for in-memory headers.
    pub fn name(&self) -> Option<&str> {
        self.region.name()
    }

    /// Messages signalled but not yet received.
    pub fn queued(&self) -> Result<u32> {
        Ok(self.semaphore.count()?)
    }

    /// Check whether any sent message is still linked in the receive queue.
    ///
    /// Unlike [`queued`](Self::queued) this also sees messages whose
    /// notification was deferred.
    pub fn has_pending(&self) -> Result<bool> {
        let anchor = &self.view.prologue().receive;
        Ok(!queue::is_empty(&self.view, anchor, RECEIVE_STUB)?)
    }

    /// The semaphore consumers block on.
    pub const fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}

impl WaitObject for Header {
    fn handle(&self) -> Handle {
        self.semaphore.handle()
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("name", &self.name())
            .field("size", &self.size())
            .field("semaphore", &self.semaphore)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message_round_trip() {
        let header = Header::in_memory(4096).expect("header");
        assert_eq!(header.capacity(), 3992);

        let mut message = header.allocate(4).expect("allocate");
        assert_eq!(message.len(), 4);
        assert_eq!(message.state(), Some(MessageState::Alloc));
        message.as_mut_slice().copy_from_slice(&1u32.to_ne_bytes());
        assert_eq!(header.send(message).expect("send"), SendStatus::Delivered);
        assert_eq!(header.queued().expect("queued"), 1);
        assert!(header.has_pending().expect("pending"));

        let received = header.receive(Timeout::POLL).expect("receive");
        assert_eq!(received.state(), Some(MessageState::Recv));
        assert!(!header.has_pending().expect("pending"));
        assert_eq!(received.as_slice(), &1u32.to_ne_bytes());
        assert!(header.release(&received).expect("release"));
        assert_eq!(received.state(), Some(MessageState::Pend));

        assert_eq!(header.reclaim().expect("reclaim"), 1);
        assert_eq!(header.free_blocks().expect("free"), vec![(FIRST_BLOCK, 3992)]);
    }

    #[test]
    fn test_release_unsent_message() {
        let header = Header::in_memory(1024).expect("header");
        let message = header.allocate(64).expect("allocate");
        assert!(header.release(&message).expect("release"));
        assert_eq!(header.stats().expect("stats").in_flight, 0);
        assert_eq!(header.free_blocks().expect("free").len(), 1);
    }

    #[test]
    fn test_receive_times_out_when_empty() {
        let header = Header::in_memory(1024).expect("header");
        let err = header
            .receive(Timeout::from_millis(10))
            .expect_err("nothing queued");
        assert!(err.is_timeout());
        assert!(header.try_receive().expect("try_receive").is_none());
    }

    #[test]
    fn test_stats() {
        let header = Header::in_memory(4096).expect("header");
        let a = header.allocate(100).expect("allocate");
        let _b = header.allocate(100).expect("allocate");
        header.send(a).expect("send");

        let stats = header.stats().expect("stats");
        assert_eq!(
            stats,
            HeaderStats {
                region_size: 4096,
                free_bytes: 3736,
                free_blocks: 1,
                largest_free: 3736,
                in_flight: 2,
                deferred: 0,
            }
        );
    }

    #[test]
    fn test_semaphore_max() {
        assert_eq!(Header::semaphore_max(4096), 170);
        assert_eq!(Header::semaphore_max(65536), 2730);
        assert_eq!(Header::semaphore_max(u32::MAX), Semaphore::CAPACITY_LIMIT);
    }

    #[test]
    fn test_semaphore_never_exceeds_its_pipe() {
        let header = Header::in_memory(64 * 1024 * 1024).expect("header");
        let max = header.semaphore.max_count();
        assert!(max <= Header::semaphore_max(64 * 1024 * 1024));
        assert!(matches!(
            header.semaphore.unlock(max + 1),
            Err(tether_sync::SyncError::SemaphoreFull { .. })
        ));
        assert_eq!(header.semaphore.count().expect("count"), 0);
    }
}
