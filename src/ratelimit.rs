//! Sliding-window request throttle.
//!
//! The limiter remembers when each request was admitted. Once the window holds
//! `max_requests` entries, `acquire` sleeps in place until the oldest entry
//! leaves the window (plus a one second margin).
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const WAIT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(400, Duration::from_secs(60))
    }
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            admitted: VecDeque::new(),
        }
    }

    /// Requests admitted within the current window.
    pub fn in_window(&mut self) -> usize {
        self.prune(Instant::now());
        self.admitted.len()
    }

    /// Block until a request may be issued, then record it.
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            self.prune(now);
            if self.admitted.len() < self.max_requests {
                self.admitted.push_back(now);
                return;
            }
            // Non-empty: len >= max_requests >= 1.
            let Some(oldest) = self.admitted.front().copied() else {
                continue;
            };
            let resume_at = oldest + self.window + WAIT_MARGIN;
            info!(
                wait_ms = resume_at.saturating_duration_since(now).as_millis() as u64,
                in_window = self.admitted.len(),
                "rate limit reached; waiting"
            );
            tokio::time::sleep_until(resume_at).await;
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.admitted.front() {
            if now.saturating_duration_since(*front) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_ceiling_without_waiting() {
        let mut limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_oldest_to_leave_window_plus_margin() {
        let mut limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire().await;

        limiter.acquire().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_ceiling_in_any_rolling_window() {
        let window = Duration::from_secs(60);
        let ceiling = 5;
        let mut limiter = SlidingWindowLimiter::new(ceiling, window);
        let mut issued = Vec::new();
        for i in 0..23u64 {
            limiter.acquire().await;
            issued.push(Instant::now());
            // uneven spacing between callers
            tokio::time::advance(Duration::from_millis(700 * (i % 4))).await;
        }

        for (i, first) in issued.iter().enumerate() {
            let within = issued[i..]
                .iter()
                .take_while(|t| t.duration_since(*first) < window)
                .count();
            assert!(within <= ceiling, "window starting at {i} holds {within}");
        }
    }
}
