//! Token counter guarding expensive operations (renderer switches).
//!
//! Capacity tokens are available up front. With a refill interval, one token
//! comes back per elapsed interval (up to capacity); without one the capacity
//! is a hard lifetime cap.

#[derive(Debug, Clone)]
pub struct RateLimiter {
    capacity: u32,
    remaining: u32,
    refill_interval_ms: Option<f64>,
    last_refill_ms: f64,
}

impl RateLimiter {
    /// Hard cap for the limiter's lifetime
    pub fn lifetime(capacity: u32) -> Self {
        Self {
            capacity,
            remaining: capacity,
            refill_interval_ms: None,
            last_refill_ms: 0.0,
        }
    }

    /// Token bucket refilling one token every `interval_ms`
    pub fn refilling(capacity: u32, interval_ms: f64, now_ms: f64) -> Self {
        Self {
            capacity,
            remaining: capacity,
            refill_interval_ms: Some(interval_ms.max(1.0)),
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: f64) {
        let Some(interval) = self.refill_interval_ms else {
            return;
        };
        let elapsed = now_ms - self.last_refill_ms;
        if elapsed < interval {
            return;
        }
        let intervals = (elapsed / interval).floor();
        let missing = self.capacity - self.remaining;
        if intervals >= missing as f64 {
            // Full bucket accrues nothing
            self.remaining = self.capacity;
            self.last_refill_ms = now_ms;
        } else {
            let tokens = intervals as u32;
            self.remaining += tokens;
            self.last_refill_ms += tokens as f64 * interval;
        }
    }

    /// Take one token if available
    pub fn try_acquire(&mut self, now_ms: f64) -> bool {
        self.refill(now_ms);
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens consumed so far (without pending refills)
    pub fn used(&self) -> u32 {
        self.capacity - self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_cap() {
        let mut limiter = RateLimiter::lifetime(3);
        assert!(limiter.try_acquire(0.0));
        assert!(limiter.try_acquire(1e9));
        assert!(limiter.try_acquire(2e9));
        assert!(!limiter.try_acquire(3e9));
        assert_eq!(limiter.used(), 3);
    }

    #[test]
    fn test_refill() {
        let mut limiter = RateLimiter::refilling(2, 1000.0, 0.0);
        assert!(limiter.try_acquire(0.0));
        assert!(limiter.try_acquire(10.0));
        assert!(!limiter.try_acquire(999.0));
        assert!(limiter.try_acquire(1000.0));
        assert!(!limiter.try_acquire(1500.0));
        // Long idle refills up to capacity only
        assert!(limiter.try_acquire(10_000.0));
        assert_eq!(limiter.remaining(), 1);
    }

    #[test]
    fn test_refill_after_huge_gap() {
        let mut limiter = RateLimiter::refilling(u32::MAX, 1.0, 0.0);
        assert!(limiter.try_acquire(0.0));
        assert!(limiter.try_acquire(1e15));
        assert_eq!(limiter.remaining(), u32::MAX - 1);

        let mut limiter = RateLimiter::refilling(3, 1.0, 0.0);
        for _ in 0..3 {
            assert!(limiter.try_acquire(0.0));
        }
        assert!(limiter.try_acquire(f64::MAX));
        assert_eq!(limiter.remaining(), 2);
    }

    #[test]
    fn test_zero_capacity_never_allows() {
        let mut limiter = RateLimiter::lifetime(0);
        assert!(!limiter.try_acquire(0.0));
    }
}
