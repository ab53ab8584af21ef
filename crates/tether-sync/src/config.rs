//! Configuration for cooperative worker threads

use serde::{Deserialize, Serialize};

use crate::handle::Timeout;

/// Configuration for a [`CooperativeThread`](crate::CooperativeThread)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// OS thread name, also recorded on the worker's tracing span
    pub name: String,

    /// Base polling interval used when no handle is ready
    ///
    /// Every expiry calls the worker's `iterate` with an invalid handle.
    pub wait_timeout: Timeout,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "tether-worker".to_string(),
            wait_timeout: Timeout::Infinite,
        }
    }
}

impl ThreadConfig {
    /// Create a new configuration with the specified thread name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the thread name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the base polling interval
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Timeout) -> Self {
        self.wait_timeout = timeout;
        self
    }
}
