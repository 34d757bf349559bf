use std::time::Duration;

use rand::Rng;

/// Network behaviour of a [`crate::RemoteExecutionClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Timeout of a whole request, response body included
    pub timeout: Duration,
    /// Additional attempts for reads that failed in transit or with a 5xx
    pub retries: u32,
    /// First step of the Fibonacci backoff between attempts
    pub backoff_increment: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            retries: 0,
            backoff_increment: Duration::from_millis(1000),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff_increment: Duration) -> Self {
        self.retries = retries;
        self.backoff_increment = backoff_increment;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = fibonacci_delay(self.backoff_increment, attempt);
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// `increment`, `increment`, `2 * increment`, `3 * increment`, `5 * increment`, ...
fn fibonacci_delay(increment: Duration, attempt: u32) -> Duration {
    let (mut current, mut previous) = (increment, Duration::ZERO);
    for _ in 0..attempt {
        let next = current.saturating_add(previous);
        previous = current;
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 100)]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 300)]
    #[case(4, 500)]
    #[case(5, 800)]
    fn fibonacci_progression(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(
            fibonacci_delay(Duration::from_millis(100), attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn jitter_stays_below_a_quarter() {
        let config = ClientConfig::default().with_retries(3, Duration::from_millis(400));

        for _ in 0..100 {
            let delay = config.backoff(2);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay < Duration::from_millis(1000));
        }
    }
}
