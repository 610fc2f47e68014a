use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// The wait before reconnect attempt `attempt`, counting from 1, or `None`
    /// once the attempts are used up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor);

        Some(delay.min(self.cap))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ReconnectPolicy;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=5)
            .map(|a| policy.delay(a).unwrap().as_secs())
            .collect();

        assert_eq!(delays, vec![2, 4, 8, 16, 30]);
        assert_eq!(policy.delay(6), None);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = ReconnectPolicy {
            max_attempts: 100,
            ..Default::default()
        };

        assert_eq!(policy.delay(64), Some(Duration::from_secs(30)));
    }
}
