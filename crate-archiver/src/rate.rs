use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// fixed-window permit gate: at most `max` acquisitions per `window`
///
/// permits are never released; they age out. `acquire` suspends until the
/// oldest permit inside the window expires.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    taken: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> RateLimiter {
        RateLimiter {
            max,
            window,
            taken: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// global per-account rest gate
    pub fn rest() -> RateLimiter {
        RateLimiter::new(49, Duration::from_secs(1))
    }

    /// per-connection gateway send gate
    pub fn gateway_send() -> RateLimiter {
        RateLimiter::new(120, Duration::from_secs(60))
    }

    pub async fn acquire(&self) {
        loop {
            let wake = {
                let now = Instant::now();
                let mut taken = self.taken.lock().await;
                while taken
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    taken.pop_front();
                }
                if taken.len() < self.max {
                    taken.push_back(now);
                    return;
                }
                *taken.front().expect("queue is full") + self.window
            };
            tokio::time::sleep_until(wake).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn immediate_until_full() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_oldest_permit_to_age_out() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.acquire().await;

        // third permit must wait until the first ages out at t=1s
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_forward() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
