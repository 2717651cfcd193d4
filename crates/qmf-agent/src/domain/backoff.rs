//! Reconnect backoff policy.

use std::time::Duration;

const DELAY_MIN_SECS: u64 = 1;
const DELAY_MAX_SECS: u64 = 128;
const DELAY_FACTOR: u64 = 2;

/// Bounded exponential backoff for broker reconnect attempts.
///
/// Consecutive failures yield waits of 1, 2, 4, ... seconds, capped at
/// 128; any attempt that completes a subscription run resets the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    delay_secs: u64,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        ReconnectBackoff {
            delay_secs: DELAY_MIN_SECS,
        }
    }

    /// The wait to apply now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay_secs;
        self.delay_secs = (self.delay_secs * DELAY_FACTOR).min(DELAY_MAX_SECS);
        Duration::from_secs(current)
    }

    /// A subscription run completed; start over from the minimum.
    pub fn reset(&mut self) {
        self.delay_secs = DELAY_MIN_SECS;
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::new()
    }
}
