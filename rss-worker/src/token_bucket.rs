//! Control-channel admission: a classic token bucket refilling at
//! `baseConnections` tokens/sec up to a burst capacity of
//! `totalConnections`, per §4: "`OpenConnection` ... shared pool
//! `baseConnections` with burst up to `totalConnections`."

use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(base_connections: u32, total_connections: u32) -> Self {
        Self {
            capacity: total_connections.max(1) as f64,
            refill_per_sec: base_connections.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: total_connections.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take_one(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block (async) until a token is available or `deadline` elapses.
    /// Returns a fresh opaque token string on success.
    pub async fn acquire(&self, deadline: Duration) -> Option<String> {
        let start = Instant::now();
        loop {
            if self.try_take_one() {
                return Some(Uuid::new_v4().to_string());
            }
            if start.elapsed() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_up_to_burst_capacity_immediately() {
        let bucket = TokenBucket::new(1, 5);
        for _ in 0..5 {
            assert!(bucket.acquire(Duration::from_millis(50)).await.is_some());
        }
    }

    #[tokio::test]
    async fn exhausted_bucket_times_out_without_a_token() {
        let bucket = TokenBucket::new(1, 1);
        assert!(bucket.acquire(Duration::from_millis(50)).await.is_some());
        assert!(bucket.acquire(Duration::from_millis(30)).await.is_none());
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(100, 1);
        assert!(bucket.acquire(Duration::from_millis(50)).await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bucket.acquire(Duration::from_millis(50)).await.is_some());
    }
}
