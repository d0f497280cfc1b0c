//! Token-bucket rate budgets and the per-packet shaping decision.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Token bucket for one (pid, direction).
///
/// Capacity equals one second of allowance, so an idle process never banks
/// more than `limit_bytes_per_sec` of burst credit.
#[derive(Debug, Clone)]
pub struct RateBudget {
    limit_bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl RateBudget {
    /// New budget starting with a full bucket.
    pub fn new(limit_bytes_per_sec: u64, now: Instant) -> Self {
        Self {
            limit_bytes_per_sec,
            tokens: limit_bytes_per_sec as f64,
            last_refill: now,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit_bytes_per_sec
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Accrue `elapsed * limit` tokens, clamped to capacity.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = self.limit_bytes_per_sec as f64;
        self.tokens = (self.tokens + elapsed * capacity).clamp(0.0, capacity);
        self.last_refill = now;
    }

    /// Try to spend `bytes` tokens.
    ///
    /// Returns `Ok(())` when the packet may pass now, or `Err(wait)` with the
    /// time until enough tokens will have accrued. A packet larger than the
    /// bucket needs a full bucket and empties it. With a zero limit nothing
    /// ever accrues and the wait is `Duration::MAX`.
    pub fn try_consume(&mut self, bytes: u64, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.limit_bytes_per_sec == 0 {
            return Err(Duration::MAX);
        }

        let needed = bytes.min(self.limit_bytes_per_sec) as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            return Ok(());
        }

        let deficit = needed - self.tokens;
        Err(Duration::from_secs_f64(
            deficit / self.limit_bytes_per_sec as f64,
        ))
    }
}

/// Outcome of shaping a single packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Shaping counters for one direction of a throttle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShapingStats {
    pub packets_passed: u64,
    pub bytes_passed: u64,
    pub packets_delayed: u64,
    pub packets_dropped: u64,
    pub bytes_dropped: u64,
}

/// The decision point a filter routes its packets through.
///
/// Each point owns its own lock so the data path never contends with the
/// engine-wide registry lock.
#[derive(Debug)]
pub struct ShapingPoint {
    budget: Mutex<RateBudget>,
    max_wait: Duration,
    retired: AtomicBool,
    packets_passed: AtomicU64,
    bytes_passed: AtomicU64,
    packets_delayed: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
}

impl ShapingPoint {
    pub fn new(limit_bytes_per_sec: u64, max_wait: Duration) -> Self {
        Self {
            budget: Mutex::new(RateBudget::new(limit_bytes_per_sec, Instant::now())),
            max_wait,
            retired: AtomicBool::new(false),
            packets_passed: AtomicU64::new(0),
            bytes_passed: AtomicU64::new(0),
            packets_delayed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> u64 {
        self.lock_budget().limit()
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Mark the point as detached from its filter. Packets already queued
    /// still drain through [`ShapingPoint::pace`].
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Decide on a packet of `bytes`, sleeping the calling thread while
    /// tokens accrue. Gives up and drops once the total wait would exceed
    /// `max_wait`.
    pub fn pace(&self, bytes: u64) -> Verdict {
        let mut waited = Duration::ZERO;

        loop {
            let wait = match self.lock_budget().try_consume(bytes, Instant::now()) {
                Ok(()) => {
                    self.packets_passed.fetch_add(1, Ordering::Relaxed);
                    self.bytes_passed.fetch_add(bytes, Ordering::Relaxed);
                    if !waited.is_zero() {
                        self.packets_delayed.fetch_add(1, Ordering::Relaxed);
                    }
                    return Verdict::Accept;
                }
                Err(wait) => wait,
            };

            if waited.saturating_add(wait) > self.max_wait {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                self.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
                log::trace!("Dropping {} byte packet after {:?} of pacing", bytes, waited);
                return Verdict::Drop;
            }

            thread::sleep(wait);
            waited += wait;
        }
    }

    pub fn stats(&self) -> ShapingStats {
        ShapingStats {
            packets_passed: self.packets_passed.load(Ordering::Relaxed),
            bytes_passed: self.bytes_passed.load(Ordering::Relaxed),
            packets_delayed: self.packets_delayed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
        }
    }

    fn lock_budget(&self) -> std::sync::MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_starts_full_and_clamps() {
        let start = Instant::now();
        let mut budget = RateBudget::new(1000, start);
        assert_eq!(budget.tokens(), 1000.0);

        budget.refill(start + Duration::from_secs(10));
        assert_eq!(budget.tokens(), 1000.0);
    }

    #[test]
    fn test_consume_and_refill() {
        let start = Instant::now();
        let mut budget = RateBudget::new(1000, start);

        assert!(budget.try_consume(600, start).is_ok());
        assert!((budget.tokens() - 400.0).abs() < 1e-9);

        let wait = budget.try_consume(600, start).unwrap_err();
        assert_eq!(wait, Duration::from_millis(200));

        // Half a second later 500 tokens have accrued on top of 400
        assert!(budget.try_consume(600, start + Duration::from_millis(500)).is_ok());
        assert!((budget.tokens() - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_tokens_never_negative() {
        let start = Instant::now();
        let mut budget = RateBudget::new(100, start);
        for _ in 0..10 {
            let _ = budget.try_consume(70, start);
            assert!(budget.tokens() >= 0.0);
        }
    }

    #[test]
    fn test_oversized_packet_needs_full_bucket() {
        let start = Instant::now();
        let mut budget = RateBudget::new(1000, start);
        assert!(budget.try_consume(1500, start).is_ok());
        assert_eq!(budget.tokens(), 0.0);
        assert_eq!(
            budget.try_consume(1500, start).unwrap_err(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_zero_limit_blocks_everything() {
        let start = Instant::now();
        let mut budget = RateBudget::new(0, start);
        assert_eq!(budget.try_consume(1, start), Err(Duration::MAX));
        assert_eq!(
            budget.try_consume(1, start + Duration::from_secs(60)),
            Err(Duration::MAX)
        );
    }

    #[test]
    fn test_pace_accepts_within_budget() {
        let point = ShapingPoint::new(10_000, Duration::from_millis(50));
        assert_eq!(point.pace(1500), Verdict::Accept);
        assert_eq!(point.stats().packets_passed, 1);
        assert_eq!(point.stats().bytes_passed, 1500);
    }

    #[test]
    fn test_pace_delays_then_accepts() {
        // 100 KB/s: after draining the bucket a 1000 byte packet waits ~10ms
        let point = ShapingPoint::new(100_000, Duration::from_millis(200));
        assert_eq!(point.pace(100_000), Verdict::Accept);

        let started = Instant::now();
        assert_eq!(point.pace(1000), Verdict::Accept);
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(point.stats().packets_delayed, 1);
    }

    #[test]
    fn test_pace_drops_past_bounded_wait() {
        let point = ShapingPoint::new(1000, Duration::from_millis(10));
        assert_eq!(point.pace(1000), Verdict::Accept);
        // Next 1000 bytes need a full second; far beyond the 10ms bound
        assert_eq!(point.pace(1000), Verdict::Drop);

        let stats = point.stats();
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.bytes_dropped, 1000);
    }

    #[test]
    fn test_zero_limit_point_drops_immediately() {
        let point = ShapingPoint::new(0, Duration::from_secs(5));
        let started = Instant::now();
        assert_eq!(point.pace(64), Verdict::Drop);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
