// crates/policy-rollout-core/src/runtime/retry.rs
// ============================================================================
// Module: Policy Rollout Retry Helpers
// Description: Apply retry policy and store-conflict retry loop.
// Purpose: Keep backoff arithmetic and contention handling in one place.
// Dependencies: crate::interfaces, tokio, tracing
// ============================================================================

//! ## Overview
//! Two kinds of retry exist. [`RetryPolicy`] governs transient apply
//! failures and is visible in the event trail. [`retry_on_conflict`] absorbs
//! [`StoreError::Conflict`] contention and is invisible to operators.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use tracing::debug;

use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Apply Retry Policy
// ============================================================================

/// Default maximum apply attempts per target.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default upper bound on retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff policy for transient apply failures.
///
/// # Invariants
/// - `max_attempts >= 1`; the delay never exceeds `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Delay cap.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Returns true when another attempt may follow `attempt` (1-based).
    #[must_use]
    pub const fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Returns the delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

// ============================================================================
// SECTION: Store Conflict Retry
// ============================================================================

/// Attempts made before a conflict surfaces to the caller.
const CONFLICT_RETRY_LIMIT: u32 = 8;
/// First conflict retry delay.
const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(5);
/// Conflict retry delay cap.
const CONFLICT_RETRY_CAP: Duration = Duration::from_millis(250);

/// Runs `op`, retrying [`StoreError::Conflict`] with a short bounded backoff.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or any non-conflict
/// error immediately.
pub async fn retry_on_conflict<T>(
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 1;
    let mut delay = CONFLICT_RETRY_BASE;
    loop {
        match op() {
            Err(err) if err.is_conflict() && attempt < CONFLICT_RETRY_LIMIT => {
                debug!(attempt, error = %err, "retrying store conflict");
                tokio::time::sleep(delay).await;
                attempt += 1;
                delay = delay.saturating_mul(2).min(CONFLICT_RETRY_CAP);
            }
            result => return result,
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;
    use super::retry_on_conflict;
    use crate::interfaces::StoreError;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_after(40), Duration::from_millis(350));
        assert!(policy.allows_retry_after(5));
        assert!(!policy.allows_retry_after(6));
    }

    #[tokio::test]
    async fn conflicts_are_retried_transparently() {
        let mut calls = 0;
        let result = retry_on_conflict(|| {
            calls += 1;
            if calls < 3 { Err(StoreError::Conflict("busy".to_string())) } else { Ok(calls) }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn other_errors_surface_immediately() {
        let mut calls = 0;
        let result: Result<(), StoreError> = retry_on_conflict(|| {
            calls += 1;
            Err(StoreError::Invalid("bad".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
