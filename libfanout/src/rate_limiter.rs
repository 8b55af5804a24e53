//! Per-account posting clock
//!
//! Remembers when each account last posted successfully and makes the next
//! post to that account wait out the account's minimum interval. The clock
//! lives in memory and is owned by one post manager.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cancellation::CancelToken;
use crate::error::PostError;

/// Rate limiter keyed by account id
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_posted: Mutex<HashMap<String, Instant>>,
    /// Per-website lower bounds on the wait interval
    floors: HashMap<String, Duration>,
}

impl RateLimiter {
    /// Create a rate limiter with configured per-website floors
    pub fn new(floors: HashMap<String, Duration>) -> Self {
        Self {
            last_posted: Mutex::new(HashMap::new()),
            floors,
        }
    }

    /// Effective interval for a website: the larger of declared and configured
    pub fn interval_for(&self, website: &str, declared: Duration) -> Duration {
        match self.floors.get(website) {
            Some(floor) => declared.max(*floor),
            None => declared,
        }
    }

    /// Time still to wait before `account_id` may post again
    pub fn remaining(&self, account_id: &str, interval: Duration) -> Duration {
        let last = self
            .last_posted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account_id)
            .copied();

        match last {
            Some(last) => interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record a successful post for `account_id`
    pub fn record(&self, account_id: &str) {
        self.last_posted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(account_id.to_string(), Instant::now());
    }

    /// Sleep until `account_id` may post again
    ///
    /// Cancellation is checked before the wait, interrupts the wait, and is
    /// checked again afterwards.
    pub async fn wait(
        &self,
        account_id: &str,
        interval: Duration,
        cancel: &CancelToken,
    ) -> Result<(), PostError> {
        cancel.check()?;

        let remaining = self.remaining(account_id, interval);
        if !remaining.is_zero() {
            debug!(
                account_id,
                wait_ms = remaining.as_millis() as u64,
                "Waiting for posting interval"
            );
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.cancelled() => {}
            }
        }

        cancel.check()
    }
}
