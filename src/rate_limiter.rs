use std::time::Duration;

use anyhow::anyhow;
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

/// Token-bucket throttle shared by every outbound request in a run.
///
/// `rate` tokens refill per second up to `capacity`. Waiters re-enter the
/// bucket through a fair mutex, so callers are served in arrival order.
/// The lock only covers the refill/debit read-modify-write; the wait for
/// new tokens happens with the lock released.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> RateLimiter {
        RateLimiter {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Limiter allowing `rate` requests per second with a burst of the
    /// same size, matching the repository's requests-per-second setting.
    pub fn per_second(rate: u32) -> RateLimiter {
        let rate = f64::from(rate.max(1));
        RateLimiter::new(rate, rate)
    }

    pub async fn acquire(&self) -> anyhow::Result<()> {
        self.acquire_many(1.0).await
    }

    /// Debit `n` tokens, suspending until the bucket refills enough.
    /// Requests that can never be satisfied fail fast instead of
    /// deadlocking.
    pub async fn acquire_many(&self, n: f64) -> anyhow::Result<()> {
        if n > self.capacity {
            return Err(anyhow!(
                "requested {} tokens but bucket capacity is {}",
                n,
                self.capacity
            ));
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= n {
                    state.tokens -= n;
                    return Ok(());
                }
                (n - state.tokens) / self.rate
            };

            sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(5.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_acquire_waits_one_refill_interval() {
        let limiter = RateLimiter::new(5.0, 5.0);
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }

        let start = Instant::now();
        limiter.acquire().await.unwrap();
        let elapsed = start.elapsed();

        // one token refills in 1/rate = 200ms
        assert!(elapsed >= Duration::from_millis(190), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn oversized_request_fails_fast() {
        let limiter = RateLimiter::new(5.0, 5.0);
        assert!(limiter.acquire_many(6.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_all_complete() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(10.0, 2.0));
        let start = Instant::now();

        let mut handles = vec![];
        for _ in 0..6 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 2 immediately, 4 more at 10/s: roughly 400ms total
        assert!(start.elapsed() >= Duration::from_millis(350));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
