//! Reconnection backoff policy
//!
//! Bounded exponential backoff with jitter, used by each worker's
//! reconnection supervisor. Jitter is on by default so that many devices
//! dropping off the same network segment or serial bus do not reconnect in
//! lockstep.

use rand::Rng;
use std::time::Duration;

use crate::core::types::DeviceConfig;

/// Backoff configuration for connection re-establishment.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the second attempt (the first retry)
    pub initial_delay: Duration,
    /// Upper bound for the computed delay
    pub max_delay: Duration,
    /// Exponential multiplier between attempts
    pub multiplier: f64,
    /// Apply ±25% jitter to each delay
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Policy seeded from a device's configured timeout and backoff cap.
    pub fn for_device(device: &DeviceConfig) -> Self {
        Self {
            initial_delay: device.timeout(),
            max_delay: Duration::from_millis(device.reconnect_max_delay_ms),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // Exponential backoff: delay = initial_delay * multiplier^attempt
        let mut delay = self
            .initial_delay
            .mul_f64(self.multiplier.powi(attempt.min(30) as i32));

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }
}
