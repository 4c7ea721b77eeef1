//! Helper functions

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::types::TimestampMs;

pub fn current_timestamp_millis() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Exponential backoff: `initial * 2^attempt`, capped at `max`
pub fn backoff_delay_ms(initial_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    initial_ms.saturating_mul(factor).min(max_ms)
}

/// Source of "now" for the engine loop
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> TimestampMs;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> TimestampMs {
        current_timestamp_millis()
    }
}

/// Manually driven clock for replays and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimestampMs) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: TimestampMs) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward, never backward
    pub fn advance_to(&self, now: TimestampMs) {
        self.now.fetch_max(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay_ms(100, 5_000, 0), 100);
        assert_eq!(backoff_delay_ms(100, 5_000, 3), 800);
        assert_eq!(backoff_delay_ms(100, 5_000, 10), 5_000);
        assert_eq!(backoff_delay_ms(100, 5_000, 200), 5_000);
    }

    #[test]
    fn test_manual_clock_never_rewinds_on_advance_to() {
        let clock = ManualClock::new(1_000);
        clock.advance_to(500);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance_to(2_000);
        assert_eq!(clock.now_millis(), 2_000);
    }
}
