use std::net::IpAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

/// Per-source admission filter guarding the dispatch loop. Keyed by IP only
/// (not port), bounded to `capacity` tracked sources with FIFO-ish eviction
/// of the oldest-seen entry once full — simple and sufficient, since the
/// limiter only needs to bound memory, not be perfectly fair to evictees.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    threshold: u32,
    window: Duration,
    capacity: usize,
}

struct Inner {
    sources: AHashMap<IpAddr, Bucket>,
}

struct Bucket {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(threshold: u32, window: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sources: AHashMap::with_capacity(capacity.min(1024)),
            }),
            threshold,
            window,
            capacity,
        }
    }

    /// Returns `true` if a datagram from `remote_ip` should be processed.
    pub fn check(&self, remote_ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.sources.len() >= self.capacity && !inner.sources.contains_key(&remote_ip) {
            evict_oldest(&mut inner.sources);
        }

        let bucket = inner.sources.entry(remote_ip).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count += 1;
        bucket.count <= self.threshold
    }
}

fn evict_oldest(sources: &mut AHashMap<IpAddr, Bucket>) {
    if let Some(&oldest) = sources
        .iter()
        .min_by_key(|(_, b)| b.window_start)
        .map(|(ip, _)| ip)
    {
        sources.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_threshold_then_drops() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1), 1024);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        let admitted = (0..10).filter(|_| limiter.check(ip)).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn distinct_sources_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 1024);
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.6".parse().unwrap();

        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn bounded_memory_evicts_when_full() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60), 2);

        let a: IpAddr = "203.0.113.1".parse().unwrap();
        let b: IpAddr = "203.0.113.2".parse().unwrap();
        let c: IpAddr = "203.0.113.3".parse().unwrap();

        assert!(limiter.check(a));
        assert!(limiter.check(b));
        assert!(limiter.check(c));

        assert_eq!(limiter.inner.lock().sources.len(), 2);
    }
}
