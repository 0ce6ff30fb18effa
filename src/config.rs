use std::time::Duration;

use crate::{DEFAULT_ACCEPT_TIMEOUT_SECS, DEFAULT_CONNECT_RETRIES, DEFAULT_RETRY_DELAY_MS};

/// Timing knobs shared by every session spawned from one control listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a freshly registered forwarding waits for its viewer.
    pub accept_timeout: Duration,
    /// Extra backend connect attempts after the first one fails.
    pub connect_retries: u32,
    /// Pause between backend connect attempts.
    pub retry_delay: Duration,
}

impl SessionConfig {
    pub fn new(accept_timeout: Duration, connect_retries: u32, retry_delay: Duration) -> Self {
        Self {
            accept_timeout,
            connect_retries,
            retry_delay,
        }
    }

    /// Total number of connect attempts made against the backend.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_retries.saturating_add(1)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_ACCEPT_TIMEOUT_SECS),
            DEFAULT_CONNECT_RETRIES,
            Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        )
    }
}
