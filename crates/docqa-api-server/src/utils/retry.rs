use std::time::Duration;

/// Bounded exponential backoff shared by the remote embedding and generation
/// clients: base 1 s, doubling, capped at 10 s, three attempts total.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based; attempt 0 is the first
    /// try and waits nothing). A provider-supplied `Retry-After` overrides
    /// the computed delay but is still capped.
    pub fn delay_for_attempt(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Parse a `Retry-After` header value given in whole seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0, None), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1, None), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2, None), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3, None), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(6, None), Duration::from_secs(10));
    }

    #[test]
    fn retry_after_wins_but_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(
            config.delay_for_attempt(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            config.delay_for_attempt(1, Some(Duration::from_secs(120))),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn header_parse() {
        assert_eq!(
            parse_retry_after(Some("3")),
            Some(Duration::from_secs(3))
        );
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
