//! Sliding-window rate limiter for outbound provider calls.
//!
//! One window per client instance. Over-limit callers are suspended until the
//! window rolls over rather than rejected; the first request of the new
//! window counts as 1, so the waiter is not double-counted.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::clock::Clock;

/// Window length: one minute.
const WINDOW_SECS: i64 = 60;

/// Default ceiling of requests per window.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 500;

struct RateWindow {
    request_count: u32,
    window_start: DateTime<Utc>,
}

/// Outcome of a non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted and admitted.
    Allowed,
    /// Window is full; wait this long before re-checking.
    WaitFor(StdDuration),
}

pub struct RateLimiter {
    window: Mutex<RateWindow>,
    limit: u32,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limit: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            window: Mutex::new(RateWindow {
                request_count: 0,
                window_start: now,
            }),
            limit,
            clock,
        }
    }

    /// Non-blocking admission check. Mutations are serialized under the
    /// window mutex so concurrent callers cannot lose counts.
    pub fn try_acquire(&self) -> Admission {
        let mut window = self.window.lock().unwrap();
        let now = self.clock.now();
        let window_len = Duration::seconds(WINDOW_SECS);

        if now - window.window_start >= window_len {
            // New window: this request is its first.
            window.window_start = now;
            window.request_count = 1;
            return Admission::Allowed;
        }

        if window.request_count < self.limit {
            window.request_count += 1;
            return Admission::Allowed;
        }

        let reset_at = window.window_start + window_len;
        let wait = (reset_at - now).to_std().unwrap_or(StdDuration::ZERO);
        Admission::WaitFor(wait)
    }

    /// Suspend until admitted.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Admission::Allowed => return,
                Admission::WaitFor(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting for window reset");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
