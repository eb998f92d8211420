//! Client configuration.

use std::time::Duration;

/// Configuration for a shardline client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client role name, used in log output and the persistence id
    pub name: String,
    /// Client-side bound on queue depth; the backpressure window is the
    /// smaller of this and the backend's advertised in-flight window
    pub queue_capacity: usize,
    /// Initial backoff between backend resolution attempts
    pub backoff_base: Duration,
    /// Maximum backoff between resolution attempts (caps exponential growth)
    pub backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "shardline".to_string(),
            queue_capacity: 1000,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Backoff before resolution attempt `attempt`.
    ///
    /// Exponential, capped at `backoff_max`:
    /// attempt 0: no delay
    /// attempt 1: backoff_base
    /// attempt n: min(backoff_base * 2^(n-1), backoff_max)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        std::cmp::min(delay, self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_calculation() {
        let config = ClientConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(400));

        // Attempt 7 = base * 64 (6.4s) capped at 5s
        assert_eq!(config.backoff_for_attempt(7), Duration::from_secs(5));
        assert_eq!(config.backoff_for_attempt(100), Duration::from_secs(5));
    }

    #[test]
    fn builder_overrides() {
        let config = ClientConfig::new("frontend")
            .with_queue_capacity(64)
            .with_backoff(Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(config.name, "frontend");
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(1));
    }
}
