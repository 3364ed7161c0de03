//! Transmit duty cycle budget.
//!
//! Token bucket over airtime in microseconds. The budget refills
//! continuously over the window, so a gateway that has been quiet may send a
//! burst of replies and then has to wait.

use std::time::{Duration, Instant};

/// EU868 g1 sub-band limit.
pub const EU868_DUTY_CYCLE_PERCENT: f32 = 1.0;

/// Averaging window used by the regulations.
pub const DEFAULT_DUTY_CYCLE_WINDOW: Duration = Duration::from_secs(3600);

/// Airtime budget limiter.
#[derive(Debug)]
pub struct DutyCycleLimiter {
    budget_us: u64,
    remaining_us: u64,
    last_refill: Instant,
    window: Duration,
}

impl DutyCycleLimiter {
    /// `duty_cycle_percent` of `window`, starting full.
    pub fn new(duty_cycle_percent: f32, window: Duration) -> Self {
        Self::new_at(duty_cycle_percent, window, Instant::now())
    }

    pub fn new_at(duty_cycle_percent: f32, window: Duration, now: Instant) -> Self {
        let budget_us = (window.as_micros() as f64 * f64::from(duty_cycle_percent) / 100.0) as u64;
        Self {
            budget_us,
            remaining_us: budget_us,
            last_refill: now,
            window,
        }
    }

    /// Charge `airtime` if the budget allows it. The budget is left
    /// untouched when it does not.
    pub fn try_consume_at(&mut self, airtime: Duration, now: Instant) -> bool {
        self.refill(now);
        let airtime_us = airtime.as_micros() as u64;
        if self.remaining_us >= airtime_us {
            self.remaining_us -= airtime_us;
            true
        } else {
            false
        }
    }

    pub fn try_consume(&mut self, airtime: Duration) -> bool {
        self.try_consume_at(airtime, Instant::now())
    }

    /// Remaining airtime at `now`.
    pub fn remaining_at(&mut self, now: Instant) -> Duration {
        self.refill(now);
        Duration::from_micros(self.remaining_us)
    }

    pub fn remaining_percent_at(&mut self, now: Instant) -> f32 {
        self.refill(now);
        if self.budget_us == 0 {
            return 0.0;
        }
        (self.remaining_us as f64 / self.budget_us as f64 * 100.0) as f32
    }

    /// Full budget per window.
    pub fn budget(&self) -> Duration {
        Duration::from_micros(self.budget_us)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let window_us = self.window.as_micros();
        if window_us == 0 {
            self.remaining_us = self.budget_us;
            self.last_refill = now;
            return;
        }

        let refill_us = (u128::from(self.budget_us) * elapsed.as_micros() / window_us) as u64;
        if refill_us > 0 {
            self.remaining_us = (self.remaining_us + refill_us).min(self.budget_us);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_from_percent() {
        let limiter = DutyCycleLimiter::new(1.0, Duration::from_secs(3600));
        assert_eq!(limiter.budget(), Duration::from_secs(36));
    }

    #[test]
    fn test_consume_until_exhausted() {
        let start = Instant::now();
        let mut limiter = DutyCycleLimiter::new_at(1.0, Duration::from_secs(100), start);
        // 1 s budget
        assert!(limiter.try_consume_at(Duration::from_millis(600), start));
        assert!(!limiter.try_consume_at(Duration::from_millis(600), start));
        assert_eq!(limiter.remaining_at(start), Duration::from_millis(400));
    }

    #[test]
    fn test_refill_over_window() {
        let start = Instant::now();
        let mut limiter = DutyCycleLimiter::new_at(1.0, Duration::from_secs(100), start);
        assert!(limiter.try_consume_at(Duration::from_secs(1), start));
        assert_eq!(limiter.remaining_percent_at(start), 0.0);

        let half = start + Duration::from_secs(50);
        assert_eq!(limiter.remaining_at(half), Duration::from_millis(500));

        let later = start + Duration::from_secs(500);
        assert_eq!(limiter.remaining_at(later), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_percent_blocks_everything() {
        let mut limiter = DutyCycleLimiter::new(0.0, DEFAULT_DUTY_CYCLE_WINDOW);
        assert!(!limiter.try_consume(Duration::from_micros(1)));
        assert!(limiter.try_consume(Duration::ZERO));
    }
}
