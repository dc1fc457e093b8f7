//! Bounded retry around hardware-touching operations
//!
//! Every call site that can fail because of the audio driver (opening a
//! stream, starting it, opening the output device) goes through one
//! [`DeviceWatchdog`] instead of rolling its own retry loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Retry policy for guarded device operations
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchdogPolicy {
    /// Pause between a failure and the reinit that precedes the next attempt
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

type Reinit = Arc<dyn Fn() + Send + Sync>;

/// Retry wrapper for operations that fail on driver hiccups
#[derive(Clone)]
pub struct DeviceWatchdog {
    policy: WatchdogPolicy,
    reinit: Reinit,
}

impl std::fmt::Debug for DeviceWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWatchdog")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DeviceWatchdog {
    /// Create a watchdog
    ///
    /// `reinit` runs before every retry and may recreate hardware
    /// resources; it must be safe to call repeatedly.
    pub fn new(policy: WatchdogPolicy, reinit: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            policy,
            reinit: Arc::new(reinit),
        }
    }

    /// Watchdog whose retries do not touch any device
    #[must_use]
    pub fn without_reinit(policy: WatchdogPolicy) -> Self {
        Self::new(policy, || {})
    }

    /// The active policy
    #[must_use]
    pub const fn policy(&self) -> WatchdogPolicy {
        self.policy
    }

    /// Run `operation`, retrying on failure
    ///
    /// The attempt counter is local to this call, so every call starts
    /// fresh after a success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] carrying the last failure once
    /// `max_attempts` consecutive attempts have failed.
    pub fn guard<T>(&self, label: &str, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            match operation() {
                Ok(value) => {
                    if attempts > 0 {
                        tracing::info!(label, attempts, "device operation recovered");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        label,
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "device operation failed"
                    );

                    if attempts >= max_attempts {
                        return Err(Error::Device {
                            attempts,
                            message: e.to_string(),
                        });
                    }

                    std::thread::sleep(self.policy.cooldown);
                    (self.reinit)();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> WatchdogPolicy {
        WatchdogPolicy {
            cooldown: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[test]
    fn test_success_passes_through() {
        let watchdog = DeviceWatchdog::without_reinit(fast_policy(3));
        let value = watchdog.guard("open", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_always_failing_calls_reinit_max_minus_one_times() {
        let reinits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&reinits);
        let watchdog = DeviceWatchdog::new(fast_policy(4), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let calls = AtomicU32::new(0);
        let result: Result<()> = watchdog.guard("start", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Audio("device unavailable".to_string()))
        });

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(reinits.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::Device { attempts, message }) => {
                assert_eq!(attempts, 4);
                assert!(message.contains("device unavailable"));
            }
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let reinits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&reinits);
        let watchdog = DeviceWatchdog::new(fast_policy(3), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut failures_left = 2;
        let value = watchdog
            .guard("open", || {
                if failures_left > 0 {
                    failures_left -= 1;
                    Err(Error::Audio("busy".to_string()))
                } else {
                    Ok("stream")
                }
            })
            .unwrap();

        assert_eq!(value, "stream");
        assert_eq!(reinits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let watchdog = DeviceWatchdog::without_reinit(fast_policy(0));
        let calls = AtomicU32::new(0);
        let result: Result<()> = watchdog.guard("open", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Audio("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
