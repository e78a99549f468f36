//! Configuration for the batch manager and its dispatchers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::BatchType;

/// Manager-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Messages fetched per sequencer page. Clamped up to 1 at use.
    pub read_page_size: usize,
    /// Floor on how often the sequencer will poll the store.
    pub minimum_poll_delay_ms: u64,
    /// How long the sequencer waits for a new-message tap before polling
    /// anyway. Clamped up to `minimum_poll_delay_ms`.
    pub message_poll_timeout_ms: u64,
    /// First retry delay after a failed flush or page read.
    pub retry_init_delay_ms: u64,
    /// Cap on the exponential retry delay.
    pub retry_max_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            read_page_size: 50,
            minimum_poll_delay_ms: 100,
            message_poll_timeout_ms: 5_000,
            retry_init_delay_ms: 250,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl BatchConfig {
    pub fn minimum_poll_delay(&self) -> Duration {
        Duration::from_millis(self.minimum_poll_delay_ms)
    }

    pub fn message_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.message_poll_timeout_ms.max(self.minimum_poll_delay_ms))
    }

    pub fn retry_init_delay(&self) -> Duration {
        Duration::from_millis(self.retry_init_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// Per-dispatcher batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherOptions {
    /// Flush once the assembled payload reaches this many bytes. Min 1.
    pub batch_max_size: usize,
    /// Flush once the batch holds this many messages. Min 1.
    pub batch_max_count: usize,
    /// Flush a non-empty batch after this long; 0 flushes as soon as a
    /// message arrives.
    pub batch_timeout_ms: u64,
    /// Idle TTL after which a processor disposes of itself.
    pub dispose_timeout_ms: u64,
    pub batch_type: BatchType,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            batch_max_size: 1024 * 1024,
            batch_max_count: 500,
            batch_timeout_ms: 500,
            dispose_timeout_ms: 120_000,
            batch_type: BatchType::Broadcast,
        }
    }
}

impl DispatcherOptions {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }
}
