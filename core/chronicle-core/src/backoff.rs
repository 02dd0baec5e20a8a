//! Linear, capped backoff shared by persistence retries and channel reconnects.

use std::cmp;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::config::{ChannelConfig, PersistenceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self { step, max }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn for_persistence(config: &PersistenceConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_step_ms),
            Duration::from_millis(config.retry_max_ms),
        )
    }

    pub fn for_reconnect(config: &ChannelConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_step_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    /// Delay before retry number `attempt` (1-based): `step * attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.step.saturating_mul(attempt.max(1));
        cmp::min(backoff, self.max)
    }
}

/// Runs `op` up to `attempts` times, sleeping between failures.
///
/// Returns the last error when every attempt fails. Blocking; callers on an
/// async runtime should use it from `spawn_blocking` or a plain thread.
pub fn retry_blocking<T, E, F>(attempts: u32, backoff: Backoff, label: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                let delay = backoff.delay(attempt);
                warn!(
                    error = %err,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "{} failed; retrying",
                    label
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(25));
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert_eq!(backoff.delay(3), Duration::from_secs(25));
        assert_eq!(backoff.delay(0), Duration::from_secs(10));
    }

    #[test]
    fn retry_stops_at_first_success() {
        let mut calls = 0;
        let result: Result<u32, String> = retry_blocking(3, Backoff::immediate(), "op", || {
            calls += 1;
            if calls < 2 {
                Err("locked".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn retry_returns_last_error_after_attempts() {
        let mut calls = 0;
        let result: Result<(), String> = retry_blocking(3, Backoff::immediate(), "op", || {
            calls += 1;
            Err(format!("failure {}", calls))
        });
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
    }
}
