//! Intrusive multi-producer single-consumer queues inside a region.
//!
//! Each queue threads blocks through their `next` words and keeps one
//! permanent stub block so that it is never structurally empty. Pushing is
//! one atomic swap plus a store, so any number of producers (in any
//! process) may push concurrently. Only one consumer may pop at a time.
//!
//! Between the swap and the store a push is visible at the push end but not
//! yet linked. A pop that runs into such a push reports [`Pop::Busy`]; the
//! caller decides whether to retry.

use std::sync::atomic::Ordering;

use crate::Result;
use crate::layout::{NIL, QueueAnchor, RegionView};

/// Outcome of [`pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop {
    /// Oldest block, now detached from the queue.
    Item(u32),
    /// Nothing queued.
    Empty,
    /// A push is half done; try again shortly.
    Busy,
}

/// Append the block at `offset`.
pub fn push(view: &RegionView, anchor: &QueueAnchor, offset: u32) -> Result<()> {
    view.block(offset)?.next.store(NIL, Ordering::Relaxed);
    let prev = anchor.push_end.swap(offset, Ordering::AcqRel);
    view.block(prev)?.next.store(offset, Ordering::Release);
    Ok(())
}

/// Detach the oldest block. The stub is re-linked at the back instead of
/// ever being returned.
pub fn pop(view: &RegionView, anchor: &QueueAnchor, stub: u32) -> Result<Pop> {
    let mut tail = anchor.pop_end.load(Ordering::Relaxed);
    let mut next = view.block(tail)?.next.load(Ordering::Acquire);

    if tail == stub {
        if next == NIL {
            return Ok(if anchor.push_end.load(Ordering::Acquire) == stub {
                Pop::Empty
            } else {
                Pop::Busy
            });
        }
        anchor.pop_end.store(next, Ordering::Relaxed);
        tail = next;
        next = view.block(next)?.next.load(Ordering::Acquire);
    }

    if next != NIL {
        anchor.pop_end.store(next, Ordering::Relaxed);
        return Ok(Pop::Item(tail));
    }

    if anchor.push_end.load(Ordering::Acquire) != tail {
        return Ok(Pop::Busy);
    }

    // `tail` is the last block; queue the stub behind it so it can leave.
    push(view, anchor, stub)?;
    next = view.block(tail)?.next.load(Ordering::Acquire);
    if next != NIL {
        anchor.pop_end.store(next, Ordering::Relaxed);
        return Ok(Pop::Item(tail));
    }
    Ok(Pop::Busy)
}

/// Check whether anything but the stub is queued.
pub fn is_empty(view: &RegionView, anchor: &QueueAnchor, stub: u32) -> Result<bool> {
    let tail = anchor.pop_end.load(Ordering::Relaxed);
    Ok(tail == stub
        && view.block(stub)?.next.load(Ordering::Acquire) == NIL
        && anchor.push_end.load(Ordering::Acquire) == stub)
}
