use std::time::Duration;

use parking_lot::Mutex;

/// Token-bucket rate limiter for chunk downloads, in bytes per second.
///
/// The bucket refills continuously and caps at a two-second burst so an
/// idle downloader cannot save up unbounded credit.
pub struct BandwidthThrottle {
    inner: Mutex<Bucket>,
}

struct Bucket {
    bytes_per_second: u64,
    tokens: f64,
    last_refill: f64,
}

impl BandwidthThrottle {
    /// `bytes_per_second == 0` disables throttling.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            inner: Mutex::new(Bucket {
                bytes_per_second,
                tokens: 0.0,
                last_refill: wall_clock(),
            }),
        }
    }

    pub fn set_limit(&self, bytes_per_second: u64) {
        self.inner.lock().bytes_per_second = bytes_per_second;
    }

    /// Account for `bytes` transferred at instant `now`; returns how long
    /// the caller must wait before proceeding.
    pub fn acquire(&self, bytes: usize, now: f64) -> Duration {
        let mut bucket = self.inner.lock();
        if bucket.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let rate = bucket.bytes_per_second as f64;
        let elapsed = (now - bucket.last_refill).max(0.0);
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate * 2.0);

        let needed = bytes as f64;
        if needed <= bucket.tokens {
            bucket.tokens -= needed;
            Duration::ZERO
        } else {
            let wait = (needed - bucket.tokens) / rate;
            bucket.tokens = 0.0;
            Duration::from_secs_f64(wait)
        }
    }

    /// Blocking form used by the download thread.
    pub fn throttle(&self, bytes: usize) {
        let wait = self.acquire(bytes, wall_clock());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

fn wall_clock() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let throttle = BandwidthThrottle::new(0);
        assert_eq!(throttle.acquire(10_000_000, 1.0), Duration::ZERO);
    }

    #[test]
    fn empty_bucket_charges_full_wait() {
        let throttle = BandwidthThrottle::new(1000);
        // First acquire starts with an empty bucket at t=100.
        {
            let mut bucket = throttle.inner.lock();
            bucket.last_refill = 100.0;
            bucket.tokens = 0.0;
        }
        let wait = throttle.acquire(500, 100.0);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn refill_covers_later_transfers() {
        let throttle = BandwidthThrottle::new(1000);
        {
            let mut bucket = throttle.inner.lock();
            bucket.last_refill = 100.0;
            bucket.tokens = 0.0;
        }
        // One second later the bucket holds 1000 tokens.
        assert_eq!(throttle.acquire(800, 101.0), Duration::ZERO);
        // 200 tokens remain; 400 bytes now costs 0.2s.
        let wait = throttle.acquire(400, 101.0);
        assert!((wait.as_secs_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn burst_is_capped_at_two_seconds() {
        let throttle = BandwidthThrottle::new(1000);
        {
            let mut bucket = throttle.inner.lock();
            bucket.last_refill = 0.0;
            bucket.tokens = 0.0;
        }
        // A long idle period still only banks 2000 tokens.
        assert_eq!(throttle.acquire(2000, 1_000.0), Duration::ZERO);
        let wait = throttle.acquire(1000, 1_000.0);
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-9);
    }
}
