//! Bounded exponential backoff for relay reconnects.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Always return the capped exponential delay.
    None,
    /// Random delay in `[capped_delay / 2, capped_delay]`, so many links
    /// dropped by the same outage spread their reconnects out.
    Equal,
}

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts != 0).then_some(max_attempts),
            jitter: Jitter::Equal,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get the next delay in the sequence, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let capped_ms = u64::try_from(capped_ms).unwrap_or(u64::MAX);

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Equal => {
                let half = capped_ms / 2;
                half + rand::rng().random_range(0..=capped_ms - half)
            }
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays generated since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jitter_is_deterministic() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000), 3)
                .with_jitter(Jitter::None);

        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(400));
        assert!(backoff.next_delay().is_none());
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5), 0)
                .with_jitter(Jitter::None);
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(800), Duration::from_millis(800), 0);
        for _ in 0..20 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn reset_clears_attempts() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0)
                .with_jitter(Jitter::None);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
    }
}
