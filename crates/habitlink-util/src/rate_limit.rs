//! Per-client request throttling for the IPC surface

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::ClientId;

/// Token-bucket limiter keyed by caller.
///
/// Each key gets `capacity` tokens; a full refill happens every `window`.
#[derive(Debug)]
pub struct RateLimiter<K = ClientId> {
    capacity: u32,
    window: Duration,
    buckets: HashMap<K, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    refilled_at: Instant,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// Allow `capacity` requests per `window` for every key
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            buckets: HashMap::new(),
        }
    }

    /// Take a token for `key`; `false` means the request should be rejected
    pub fn check(&mut self, key: &K) -> bool {
        self.check_at(key, Instant::now())
    }

    /// Like [`check`](Self::check), with an explicit clock reading
    pub fn check_at(&mut self, key: &K, now: Instant) -> bool {
        let capacity = self.capacity;
        let bucket = self.buckets.entry(key.clone()).or_insert(Bucket {
            tokens: capacity,
            refilled_at: now,
        });

        if now.saturating_duration_since(bucket.refilled_at) >= self.window {
            bucket.tokens = capacity;
            bucket.refilled_at = now;
        }

        match bucket.tokens.checked_sub(1) {
            Some(left) => {
                bucket.tokens = left;
                true
            }
            None => false,
        }
    }

    /// Forget a disconnected caller
    pub fn remove(&mut self, key: &K) {
        self.buckets.remove(key);
    }

    /// Drop buckets that have not been touched within `idle`
    pub fn prune(&mut self, idle: Duration, now: Instant) {
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.refilled_at) < idle);
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_after_capacity_is_spent() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        let client = ClientId::new();
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(&client, t0));
        }
        assert!(!limiter.check_at(&client, t0));
    }

    #[test]
    fn refills_after_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        let client = ClientId::new();
        let t0 = Instant::now();

        assert!(limiter.check_at(&client, t0));
        assert!(!limiter.check_at(&client, t0 + Duration::from_millis(500)));
        assert!(limiter.check_at(&client, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn clients_have_separate_buckets() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        let a = ClientId::new();
        let b = ClientId::new();
        let t0 = Instant::now();

        assert!(limiter.check_at(&a, t0));
        assert!(!limiter.check_at(&a, t0));
        assert!(limiter.check_at(&b, t0));
    }

    #[test]
    fn prune_and_remove_forget_clients() {
        let mut limiter: RateLimiter<&str> = RateLimiter::new(5, Duration::from_secs(1));
        let t0 = Instant::now();

        limiter.check_at(&"a", t0);
        limiter.check_at(&"b", t0 + Duration::from_secs(10));
        assert_eq!(limiter.tracked(), 2);

        limiter.prune(Duration::from_secs(5), t0 + Duration::from_secs(11));
        assert_eq!(limiter.tracked(), 1);

        limiter.remove(&"b");
        assert_eq!(limiter.tracked(), 0);
    }
}
