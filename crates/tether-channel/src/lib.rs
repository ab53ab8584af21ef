//! Shared-memory message channels.
//!
//! A region is a fixed-size byte range, either POSIX shared memory or a
//! private heap allocation, laid out as a small prologue followed by a
//! chain of blocks. Blocks are linked by 32-bit offsets, never pointers,
//! so two processes can map the same region at different addresses.
//!
//! - [`Header`] owns one direction: it allocates blocks from a first-fit
//!   free list, queues sent blocks on a lock-free intrusive queue and
//!   counts them on a [`tether_sync::Semaphore`].
//! - [`Channel`] pairs two headers into a bidirectional connection between
//!   a creating and an opening process.
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_channel::{Channel, ChannelConfig};
//! use tether_sync::Timeout;
//!
//! # fn example() -> tether_channel::Result<()> {
//! let config = ChannelConfig::new("demo").with_region_size(64 * 1024);
//! let channel = Channel::create(&config)?;
//!
//! let mut message = channel.allocate(4)?;
//! message.as_mut_slice().copy_from_slice(&7u32.to_ne_bytes());
//! channel.send(message)?;
//!
//! // The peer process calls `Channel::open(&config)` and receives.
//! # let _ = channel.receive(Timeout::from_millis(100));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

// Configuration
pub mod config;

// Error types
pub mod error;

// Region layout and storage
pub mod layout;
pub mod region;
pub mod shm;

// Block lists
mod free_list;
mod queue;

// Messaging
pub mod channel;
pub mod header;
pub mod message;

pub use channel::Channel;
pub use config::ChannelConfig;
pub use error::ChannelError;
pub use header::{Header, HeaderStats, SendStatus};
pub use layout::{BlockInfo, HEADER_SIZE, MIN_REGION_SIZE, MessageState};
pub use message::Message;
pub use region::{HeapRegion, Region};
pub use shm::SharedRegion;

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
