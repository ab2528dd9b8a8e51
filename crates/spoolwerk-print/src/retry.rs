// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Exponential backoff with jitter for presence re-registration.

use std::time::Duration;

use tracing::{debug, warn};

use spoolwerk_core::config::PresenceSettings;

/// Retry schedule.  `max_attempts == None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl From<&PresenceSettings> for RetryPolicy {
    fn from(settings: &PresenceSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, forever.  Used by tests.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                warn!(attempt, max, "retry limit exhausted");
                return None;
            }
        }
        let delay = compute_delay(attempt, self);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
        Some(delay)
    }
}

/// delay = min(base * 2^attempt + jitter, max_delay), jitter in [0, base).
fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
    let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
    Duration::from_millis(total_ms.min(policy.max_delay.as_millis() as u64))
}

/// Deterministic spread across [0, base) keyed on the attempt number.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_increases_with_attempts() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            max_attempts: None,
        };
        let d0 = policy.next_delay(0).unwrap();
        let d1 = policy.next_delay(1).unwrap();
        let d2 = policy.next_delay(2).unwrap();
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(policy.next_delay(20).unwrap() <= Duration::from_secs(10));
    }

    #[test]
    fn unbounded_by_default() {
        assert!(RetryPolicy::default().next_delay(10_000).is_some());
    }

    #[test]
    fn bounded_policy_gives_up() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_none());
    }

    #[test]
    fn built_from_settings() {
        let settings = PresenceSettings {
            base_delay_ms: 100,
            max_attempts: Some(4),
            ..Default::default()
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, Some(4));
    }
}
