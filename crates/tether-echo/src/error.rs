//! Error types for the echo worker and client

use thiserror::Error;
use tether_channel::ChannelError;
use tether_sync::SyncError;

/// Errors raised by the echo worker, client or configuration.
#[derive(Debug, Error)]
pub enum EchoError {
    /// A message did not carry the expected first word.
    #[error("Incorrect message data: expected {expected}, found {found:?}")]
    UnexpectedPayload {
        /// Word the protocol requires
        expected: u32,
        /// Word found, `None` if the message was shorter than a word
        found: Option<u32>,
    },

    /// The channel's handle reported a hang-up.
    #[error("Problem with the channel's handle")]
    ChannelAbandoned,

    /// Replies stopped arriving.
    #[error("Timed out waiting for replies: received {received} of {expected}")]
    ReplyTimeout {
        /// Replies received so far
        received: u32,
        /// Replies expected in total
        expected: u32,
    },

    /// The echo thread stopped with an error.
    #[error("Echo worker failed: {0}")]
    Worker(String),

    /// A configuration document could not be parsed.
    #[error("Invalid echo configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Thread or wait failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}
