//! Pacing of outbound requests: the shared sliding-window limiter and retry backoff.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// At most `max_requests` acquisitions inside any rolling `window`.
///
/// Callers that exceed capacity wait in arrival order; nobody is rejected.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            max_requests: max_requests.max(1) as usize,
            window,
            issued: Mutex::new(VecDeque::with_capacity(max_requests.max(1) as usize)),
        }
    }

    /// Waits for a slot and records the request time.
    pub async fn acquire(&self) {
        // The lock is held across the wait so waiters are served in order.
        let mut issued = self.issued.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = issued.front() {
                if now.duration_since(oldest) >= self.window {
                    issued.pop_front();
                } else {
                    break;
                }
            }
            if issued.len() < self.max_requests {
                issued.push_back(now);
                return;
            }
            if let Some(&oldest) = issued.front() {
                let ready_at = oldest + self.window;
                debug!("Rate limit reached, waiting {:?}", ready_at.duration_since(now));
                sleep_until(ready_at).await;
            }
        }
    }
}

/// Exponential backoff with full jitter: uniform in `[0, min(max, base * 2^(attempt-1))]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff { base, max }
    }

    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_rate_in_any_rolling_window() {
        let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(1)));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..3 {
                    limiter.acquire().await;
                    stamps.lock().unwrap().push(Instant::now());
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut stamps = stamps.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 24);
        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 3, "{} requests inside one window", in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_burst_is_not_delayed() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);
        limiter.acquire().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(1));
    }

    #[test]
    fn backoff_ceiling_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(400));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(500));
        for attempt in 1..6 {
            assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
        }
    }
}
