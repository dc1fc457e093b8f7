//! Cooperative cancellation shared by long-running operations
//!
//! A [`CancellationToken`] is a one-way latch: once cancelled it stays
//! cancelled, and the first reason given is the one that sticks. Tokens are
//! cheap to clone; every clone observes the same latch.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Latch {
    reason: Mutex<Option<String>>,
    signal: Condvar,
}

/// One-way cancellation latch with an attached reason
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    latch: Arc<Latch>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token
    ///
    /// Idempotent. The first reason wins so the original cause of a
    /// cancellation is never overwritten by later cleanup paths.
    pub fn cancel(&self, reason: &str) {
        let mut slot = self
            .latch
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            let reason = if reason.is_empty() { "cancelled" } else { reason };
            *slot = Some(reason.to_string());
            tracing::trace!(reason, "cancellation requested");
        }
        drop(slot);
        self.latch.signal.notify_all();
    }

    /// Whether the token has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.latch
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The reason given to the first `cancel` call, if any
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.latch
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until cancelled or until `timeout` elapses
    ///
    /// Returns `true` if the token was cancelled (immediately, when it
    /// already was), `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self
            .latch
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .latch
                .signal
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
        true
    }

    /// Whether two handles share the same latch
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.latch, &other.latch)
    }
}

/// Scoped token that cancels itself with reason `"scope exit"` when dropped
///
/// Drop runs on every exit path (normal return, `?`, panic unwind), so no
/// operation holding a clone of the token can outlive the scope unnoticed.
#[derive(Debug, Default)]
pub struct CancelScope {
    token: CancellationToken,
}

impl CancelScope {
    /// Reason recorded when a scope ends without an earlier cancellation
    pub const EXIT_REASON: &'static str = "scope exit";

    /// Open a new scope with a fresh token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a scope around an existing token
    #[must_use]
    pub const fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// The token governed by this scope
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.token.cancel(Self::EXIT_REASON);
    }
}
