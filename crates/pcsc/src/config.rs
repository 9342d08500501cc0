//! Configuration options for the PC/SC driver

use std::time::Duration;

use pcsc::ShareMode as PcscShareMode;
use serde::{Deserialize, Serialize};

/// Sharing mode for card connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    /// Exclusive access to the card
    Exclusive,
    /// Shared access to the card (default)
    #[default]
    Shared,
}

impl From<ShareMode> for PcscShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
        }
    }
}

/// Configuration options for the PC/SC driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcscConfig {
    /// Sharing mode used when running selection steps
    pub share_mode: ShareMode,

    /// Interval between two reader list snapshots, in milliseconds
    pub reader_poll_ms: u64,

    /// Upper bound of one blocking card status wait, in milliseconds
    pub card_wait_ms: u64,
}

impl Default for PcscConfig {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            reader_poll_ms: 1000,
            card_wait_ms: 1000,
        }
    }
}

impl PcscConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sharing mode
    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    /// Set the reader polling interval
    pub fn with_reader_poll(mut self, interval: Duration) -> Self {
        self.reader_poll_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the upper bound of one blocking card status wait
    pub fn with_card_wait(mut self, wait: Duration) -> Self {
        self.card_wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Interval between two reader list snapshots
    pub const fn reader_poll(&self) -> Duration {
        Duration::from_millis(self.reader_poll_ms)
    }

    /// Upper bound of one blocking card status wait
    pub const fn card_wait(&self) -> Duration {
        Duration::from_millis(self.card_wait_ms)
    }
}
