//! Connect retry policy with linear, capped back-off.

use std::time::Duration;

/// Controls how many handshakes the link attempts per connect cycle and
/// how long it waits between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBackoff {
    /// Maximum attempts per cycle.  Negative means unlimited.
    pub attempt_limit: i32,
    /// Upper bound on the delay between attempts.
    pub max_cooldown: Duration,
    /// Delay added per failed attempt.
    pub step: Duration,
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self {
            attempt_limit: -1,
            max_cooldown: Duration::from_secs(60),
            step: Duration::from_secs(1),
        }
    }
}

impl ConnectBackoff {
    /// Delay after the given failed attempt (1-indexed):
    /// `min(attempt * step, max_cooldown)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_cooldown)
    }

    /// Whether `attempts` already made exhaust the budget.
    pub fn should_give_up(&self, attempts: u32) -> bool {
        match u32::try_from(self.attempt_limit) {
            Ok(limit) => attempts >= limit,
            Err(_) => false,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.attempt_limit < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let p = ConnectBackoff::default();
        assert_eq!(p.max_cooldown, Duration::from_secs(60));
        assert!(p.is_unlimited());
    }

    #[test]
    fn delay_grows_linearly() {
        let p = ConnectBackoff::default();
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn delay_capped_at_max() {
        let p = ConnectBackoff {
            max_cooldown: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(p.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(500), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn should_give_up_when_limited() {
        let p = ConnectBackoff {
            attempt_limit: 3,
            ..Default::default()
        };
        assert!(!p.should_give_up(2));
        assert!(p.should_give_up(3));
        assert!(p.should_give_up(4));
    }

    #[test]
    fn zero_limit_gives_up_immediately() {
        let p = ConnectBackoff {
            attempt_limit: 0,
            ..Default::default()
        };
        assert!(p.should_give_up(0));
    }

    #[test]
    fn negative_limit_never_gives_up() {
        let p = ConnectBackoff::default();
        assert!(!p.should_give_up(1_000_000));
    }
}
