//! Echo worker and client for tether channels.
//!
//! One end of a [`Channel`](tether_channel::Channel) runs an [`EchoWorker`]
//! on a [`CooperativeThread`](tether_sync::CooperativeThread): every request
//! (a message whose first word is [`REQUEST`]) is released and answered with
//! a [`REPLY`]. The other end drives it with [`run_client`]. Both ends can
//! live in separate processes over a named channel or in one process over
//! [`Channel::pair`](tether_channel::Channel::pair).

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod worker;

pub use client::{ClientReport, run_client};
pub use config::EchoConfig;
pub use error::EchoError;
pub use worker::{EchoCounters, EchoServer, EchoSummary, EchoWorker};

use tether_channel::Message;

/// First word of a request.
pub const REQUEST: u32 = 1;

/// First word of a reply.
pub const REPLY: u32 = 2;

/// Length of every echo message.
pub const WORD: u32 = size_of::<u32>() as u32;

/// Result type for echo operations.
pub type Result<T> = std::result::Result<T, EchoError>;

/// Read the first native-endian word of a message, if it has one.
pub fn read_word(message: &Message<'_>) -> Option<u32> {
    let bytes = message.as_slice().get(..WORD as usize)?;
    let mut word = [0u8; WORD as usize];
    word.copy_from_slice(bytes);
    Some(u32::from_ne_bytes(word))
}

/// Write `value` as the first word of a message.
///
/// Returns `false` if the message is too short.
pub fn write_word(message: &mut Message<'_>, value: u32) -> bool {
    match message.as_mut_slice().get_mut(..WORD as usize) {
        Some(bytes) => {
            bytes.copy_from_slice(&value.to_ne_bytes());
            true
        }
        None => false,
    }
}
