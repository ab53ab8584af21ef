//! Configuration for echo runs

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_channel::ChannelConfig;
use tether_sync::{ThreadConfig, Timeout};

use crate::Result;

/// Default number of requests a client sends
pub const DEFAULT_REQUESTS: u32 = 1000;

/// Default time a client waits for the next reply in milliseconds
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5000;

/// Default time a server keeps answering in seconds
pub const DEFAULT_SERVE_SECS: u64 = 60;

/// Default polling interval of the echo thread in milliseconds
pub const DEFAULT_POLL_MS: u32 = 200;

/// Everything an echo run needs, loadable from JSON.
///
/// ```json
/// {
///   "channel": { "name": "bench", "region_size": 1048576 },
///   "thread": { "wait_timeout": { "millis": 100 } },
///   "requests": 100000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Channel both processes attach to
    pub channel: ChannelConfig,

    /// Echo thread settings
    pub thread: ThreadConfig,

    /// Requests the client sends
    pub requests: u32,

    /// Longest pause between replies before the client gives up
    pub reply_timeout_ms: u64,

    /// How long a server keeps answering
    pub serve_secs: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::new("echo"),
            thread: ThreadConfig::new("echo")
                .with_wait_timeout(Timeout::from_millis(DEFAULT_POLL_MS)),
            requests: DEFAULT_REQUESTS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            serve_secs: DEFAULT_SERVE_SECS,
        }
    }
}

impl EchoConfig {
    /// Parse a JSON document, filling omitted fields with defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Longest pause between replies.
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Serving time as a wait timeout.
    pub fn serve_timeout(&self) -> Timeout {
        let millis = self.serve_secs.saturating_mul(1000);
        Timeout::from_millis(u32::try_from(millis).unwrap_or(u32::MAX))
    }
}
