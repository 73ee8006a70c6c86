//! Bounded, blocking "retry until ready" loop

use std::time::Duration;

/// How often and how many times to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// Upper bound on the time spent sleeping between attempts
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }

    /// Call `poll` until it yields a value or the attempts run out.
    ///
    /// The poll receives the 1-based attempt number. `Ok(None)` means "not
    /// yet"; an `Err` aborts immediately. Returns `Ok(None)` once the budget is
    /// exhausted. Sleeps happen between attempts, never after the last one.
    pub fn run<T, E, F>(&self, mut poll: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Result<Option<T>, E>,
    {
        for attempt in 1..=self.attempts {
            if let Some(value) = poll(attempt)? {
                return Ok(Some(value));
            }
            if attempt < self.attempts && !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }
        Ok(None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_returns_first_ready_value() {
        let policy = RetryPolicy::new(Duration::ZERO, 10);
        let mut calls = 0;
        let result: Result<Option<u32>, Infallible> = policy.run(|attempt| {
            calls += 1;
            Ok((attempt == 3).then_some(attempt))
        });
        assert_eq!(result.unwrap(), Some(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhausted_budget() {
        let policy = RetryPolicy::new(Duration::ZERO, 4);
        let mut calls = 0;
        let result: Result<Option<()>, Infallible> = policy.run(|_| {
            calls += 1;
            Ok(None)
        });
        assert_eq!(result.unwrap(), None);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_error_aborts() {
        let policy = RetryPolicy::new(Duration::ZERO, 4);
        let result: Result<Option<()>, &str> = policy.run(|attempt| if attempt == 2 { Err("boom") } else { Ok(None) });
        assert_eq!(result, Err("boom"));
    }

    #[test]
    fn test_budget() {
        assert_eq!(RetryPolicy::default().budget(), Duration::from_secs(29));
        assert_eq!(RetryPolicy::new(Duration::from_secs(1), 0).budget(), Duration::ZERO);
    }

    #[test]
    fn test_sleeps_between_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(20), 3);
        let start = std::time::Instant::now();
        let _: Result<Option<()>, Infallible> = policy.run(|_| Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
