//! Configuration for named channels

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::validate_size;
use crate::{ChannelError, Result};

/// Default size of each direction's region (64 KiB)
pub const DEFAULT_REGION_SIZE: u32 = 64 * 1024;

/// Default number of attempts an opener makes
pub const DEFAULT_OPEN_RETRIES: u32 = 100;

/// Default pause between open attempts in milliseconds
pub const DEFAULT_OPEN_RETRY_INTERVAL_MS: u64 = 10;

/// Configuration for a [`Channel`](crate::Channel)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel name shared by both processes
    ///
    /// Regions are named `tether-{name}-out` and `tether-{name}-in` from
    /// the creator's point of view.
    pub name: String,

    /// Size of each direction's region in bytes
    ///
    /// Must be a multiple of 8. Ignored when opening, where the size is
    /// read from the existing region.
    pub region_size: u32,

    /// Directory holding the two named semaphore FIFOs
    pub semaphore_dir: PathBuf,

    /// Attempts an opener makes while waiting for the creator
    pub open_retries: u32,

    /// Pause between open attempts in milliseconds
    pub open_retry_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            region_size: DEFAULT_REGION_SIZE,
            semaphore_dir: std::env::temp_dir(),
            open_retries: DEFAULT_OPEN_RETRIES,
            open_retry_interval_ms: DEFAULT_OPEN_RETRY_INTERVAL_MS,
        }
    }
}

impl ChannelConfig {
    /// Create a new configuration with the specified channel name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the region size
    #[must_use]
    pub const fn with_region_size(mut self, size: u32) -> Self {
        self.region_size = size;
        self
    }

    /// Set the semaphore directory
    #[must_use]
    pub fn with_semaphore_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.semaphore_dir = dir.into();
        self
    }

    /// Set the number of open attempts
    #[must_use]
    pub const fn with_open_retries(mut self, retries: u32) -> Self {
        self.open_retries = retries;
        self
    }

    /// Set the pause between open attempts
    #[must_use]
    pub const fn with_open_retry_interval_ms(mut self, interval_ms: u64) -> Self {
        self.open_retry_interval_ms = interval_ms;
        self
    }

    /// Pause between open attempts
    pub const fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_interval_ms)
    }

    /// Shared memory name of one direction, as seen by the creator
    pub fn region_name(&self, outbound: bool) -> String {
        format!("tether-{}-{}", self.name, direction(outbound))
    }

    /// Semaphore FIFO path of one direction, as seen by the creator
    pub fn semaphore_path(&self, outbound: bool) -> PathBuf {
        self.semaphore_dir
            .join(format!("tether-{}-{}.sem", self.name, direction(outbound)))
    }

    /// Check the configuration for values no channel can use
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ChannelError::InvalidConfig(
                "channel name is empty".to_string(),
            ));
        }
        if self.name.contains(['/', '\0']) {
            return Err(ChannelError::InvalidConfig(format!(
                "channel name {:?} contains '/' or NUL",
                self.name
            )));
        }
        validate_size(self.region_size)
    }
}

const fn direction(outbound: bool) -> &'static str {
    if outbound { "out" } else { "in" }
}
