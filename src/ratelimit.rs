//! A utility that rate limits how often captures may be produced.

use std::time::{Duration, Instant};

/// A fixed-window token bucket.
///
/// The bucket starts full and refills completely at the start of each
/// window; windows are fixed, not sliding. A denied request is simply
/// dropped, never queued or retried.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    capacity: u32,
    window: Duration,
    window_start: Instant,
    tokens: u32,
}

impl RateLimiter {
    /// Creates a bucket holding `capacity` tokens per `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            window_start: Instant::now(),
            tokens: capacity,
        }
    }

    /// Attempts to remove one token.
    ///
    /// Returns the remaining token count on success, or `None` when
    /// the current window's budget is exhausted.
    pub fn try_remove_token(&mut self) -> Option<u32> {
        self.try_remove_token_at(Instant::now())
    }

    fn try_remove_token_at(&mut self, now: Instant) -> Option<u32> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.window && !self.window.is_zero() {
            // Advance past every fully elapsed window so the start
            // stays aligned to the original schedule.
            let windows = (elapsed.as_nanos() / self.window.as_nanos()) as u32;
            self.window_start += self.window * windows;
            self.tokens = self.capacity;
        }

        if self.tokens == 0 {
            return None;
        }
        self.tokens -= 1;
        Some(self.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausts_within_window() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.try_remove_token_at(now), Some(2));
        assert_eq!(limiter.try_remove_token_at(now), Some(1));
        assert_eq!(limiter.try_remove_token_at(now), Some(0));
        assert_eq!(limiter.try_remove_token_at(now), None);
        assert_eq!(limiter.try_remove_token_at(now), None);
    }

    #[test]
    fn test_refills_at_window_rollover() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.try_remove_token_at(now), Some(0));
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(59)),
            None
        );
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(61)),
            Some(0)
        );
    }

    #[test]
    fn test_windows_do_not_slide() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        // Consume late in the first window; the budget still refills at
        // the fixed boundary, not one full window after consumption.
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(59)),
            Some(0)
        );
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(61)),
            Some(0)
        );
    }

    #[test]
    fn test_refill_skips_idle_windows() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.try_remove_token_at(now), Some(1));
        // Several windows pass without any demand.
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(60 * 5 + 1)),
            Some(1)
        );
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(60 * 5 + 2)),
            Some(0)
        );
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(60 * 5 + 3)),
            None
        );
    }

    #[test]
    fn test_zero_capacity_denies_everything() {
        let mut limiter = RateLimiter::new(0, Duration::from_secs(1));
        let now = Instant::now();

        assert_eq!(limiter.try_remove_token_at(now), None);
        assert_eq!(
            limiter.try_remove_token_at(now + Duration::from_secs(5)),
            None
        );
    }
}
