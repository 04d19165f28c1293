//! Reconnect backoff policy: exponential, capped, with a hard attempt limit.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(initial * factor^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// The wait before retry number `attempt`, or `None` once the attempt
    /// budget is spent and the failure should surface as terminal.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        Some(self.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_2_4_8_16_then_capped_at_30() {
        let policy = ReconnectPolicy::default();
        let secs: Vec<u64> = (0..6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn attempts_past_the_budget_are_terminal() {
        let policy = ReconnectPolicy::default();
        assert!(policy.next_delay(5).is_some());
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn custom_policies_scale_and_cap() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(100),
            factor: 3.0,
            max_delay: Duration::from_secs(1),
            max_attempts: 2,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(300));
        assert_eq!(policy.delay(2), Duration::from_millis(900));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
        assert_eq!(policy.next_delay(3), None);
    }
}
