//! Pacing for repeated empty polls.

use std::time::Duration;

/// Exponential delay between polls that return nothing, reset whenever a
/// batch carries events.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(250))
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to use next, without advancing.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Sleep for the current delay, then double it (capped).
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.advance()).await;
    }

    /// Return the current delay and double it, saturating at the cap.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn doubles_up_to_cap_then_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        let start = tokio::time::Instant::now();
        backoff.wait().await;
        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(35));
        backoff.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(10 + 20 + 35));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }

    #[test]
    fn huge_delays_saturate_at_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(u64::MAX / 2 + 1), Duration::MAX);
        assert_eq!(backoff.advance(), Duration::from_secs(u64::MAX / 2 + 1));
        assert_eq!(backoff.current(), Duration::MAX);
        assert_eq!(backoff.advance(), Duration::MAX);
        assert_eq!(backoff.current(), Duration::MAX);
    }
}
