//! Handshake retry configuration (`handshakes.*`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay between handshake retransmits.
const DEFAULT_TRY_INTERVAL_MS: u64 = 2000;

/// Default number of retransmits before an attempt is abandoned.
const DEFAULT_RETRIES: u32 = 4;

/// Default capacity of the external trigger queue.
const DEFAULT_TRIGGER_BUFFER: usize = 64;

/// Handshake retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakesConfig {
    /// Fixed delay between retries in milliseconds (`try_interval_ms`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub try_interval_ms: Option<u64>,

    /// Retransmits before giving up (`retries`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Queue depth for externally triggered attempts (`trigger_buffer`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_buffer: Option<usize>,
}

impl HandshakesConfig {
    /// Retry interval, using the default if not configured.
    pub fn try_interval(&self) -> Duration {
        Duration::from_millis(self.try_interval_ms.unwrap_or(DEFAULT_TRY_INTERVAL_MS))
    }

    /// Retry limit, using the default if not configured.
    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    /// Trigger queue depth, using the default if not configured.
    pub fn trigger_buffer(&self) -> usize {
        self.trigger_buffer.unwrap_or(DEFAULT_TRIGGER_BUFFER)
    }

    /// Overlay the values set in `other`.
    pub fn merge(&mut self, other: HandshakesConfig) {
        if other.try_interval_ms.is_some() {
            self.try_interval_ms = other.try_interval_ms;
        }
        if other.retries.is_some() {
            self.retries = other.retries;
        }
        if other.trigger_buffer.is_some() {
            self.trigger_buffer = other.trigger_buffer;
        }
    }
}
