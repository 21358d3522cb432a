//! Request throttling.

use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::num::NonZeroU32;

/// Per-identifier limiter for login attempts.
pub struct LoginRateLimiter {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl LoginRateLimiter {
    /// Allow `attempts_per_minute` attempts per identifier.
    #[must_use]
    pub fn new(attempts_per_minute: u32) -> Self {
        let quota =
            Quota::per_minute(NonZeroU32::new(attempts_per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Record an attempt for `identifier`; `false` once the quota is spent.
    ///
    /// Identifiers are compared case-insensitively.
    #[must_use]
    pub fn check(&self, identifier: &str) -> bool {
        self.limiter
            .check_key(&identifier.trim().to_lowercase())
            .is_ok()
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new(10)
    }
}

impl std::fmt::Debug for LoginRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRateLimiter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_is_per_identifier() {
        let limiter = LoginRateLimiter::new(2);
        assert!(limiter.check("alice"));
        assert!(limiter.check("ALICE"));
        assert!(!limiter.check("alice"));
        assert!(limiter.check("bob"));
    }
}
