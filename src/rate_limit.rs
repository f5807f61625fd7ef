// =============================================================================
// Request Pacer — blocking dual-window rate limiting for exchange calls
// =============================================================================
//
// Two coupled limits:
//   - Spacing:  consecutive calls are at least 1/requests_per_second apart.
//   - Window:   at most requests_per_minute calls in any sliding 60 s window.
//
// `acquire()` parks the caller until both constraints clear. Every enforced
// sleep is observable as a SAFETY_RATE_LIMIT diagnostic carrying the slept
// duration. Safe under concurrent callers: the internal lock is held across
// the sleep, which is exactly the serialization the spacing limit demands.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(60);

struct Inner {
    last: Option<Instant>,
    window: VecDeque<Instant>,
}

/// Paces outbound exchange requests.
pub struct RequestPacer {
    min_interval: Duration,
    per_minute: u32,
    inner: Mutex<Inner>,
}

impl RequestPacer {
    pub fn new(requests_per_second: f64, requests_per_minute: u32) -> Self {
        let min_interval = if requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            per_minute: requests_per_minute.max(1),
            inner: Mutex::new(Inner {
                last: None,
                window: VecDeque::new(),
            }),
        }
    }

    /// Block until a request slot is available, then consume it.
    pub async fn acquire(&self) {
        let mut inner = self.inner.lock().await;

        loop {
            let now = Instant::now();

            // Drop window entries older than 60 s.
            while let Some(front) = inner.window.front() {
                if now.duration_since(*front) >= WINDOW {
                    inner.window.pop_front();
                } else {
                    break;
                }
            }

            // Spacing constraint.
            let spacing_wait = inner
                .last
                .map(|last| (last + self.min_interval).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);

            // Sliding-window constraint.
            let window_wait = if inner.window.len() >= self.per_minute as usize {
                inner
                    .window
                    .front()
                    .map(|front| (*front + WINDOW).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO)
            } else {
                Duration::ZERO
            };

            let wait = spacing_wait.max(window_wait);
            if wait.is_zero() {
                inner.last = Some(now);
                inner.window.push_back(now);
                return;
            }

            warn!(
                slept_ms = wait.as_millis() as u64,
                in_window = inner.window.len(),
                "SAFETY_RATE_LIMIT: pacing exchange request"
            );
            // Hold the lock across the sleep: later callers queue behind us,
            // which is the spacing behavior we want.
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("min_interval_ms", &self.min_interval.as_millis())
            .field("per_minute", &self.per_minute)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spacing_between_consecutive_calls() {
        let pacer = RequestPacer::new(10.0, 1_000); // 100 ms spacing
        let start = Instant::now();

        pacer.acquire().await;
        pacer.acquire().await;
        pacer.acquire().await;

        // Two enforced gaps of 100 ms each.
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_blocks_excess_calls() {
        let pacer = RequestPacer::new(1_000.0, 2);
        let start = Instant::now();

        pacer.acquire().await;
        pacer.acquire().await;
        // Third call has to wait for the first to age out of the window.
        pacer.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        use std::sync::Arc;

        let pacer = Arc::new(RequestPacer::new(10.0, 1_000));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let p = pacer.clone();
            handles.push(tokio::spawn(async move { p.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Five acquisitions need four enforced 100 ms gaps.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn first_call_is_immediate() {
        let pacer = RequestPacer::new(1.0, 60);
        let start = std::time::Instant::now();
        pacer.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
