// ===============================
// src/ratelimit.rs
// ===============================
//
// Per-exchange request budget, fed from two sides:
// - X-RateLimit-* response headers, when the exchange sends them
//   (remaining == 0 blocks until the advertised reset, capped at 60s)
// - a fixed requests-per-interval window configured at startup, for
//   endpoints/exchanges that do not advertise budgets
//
// Unknown budget never blocks. Waits carry a small random jitter so that
// several tasks do not stampede the moment a window reopens.

use chrono::Utc;
use rand::Rng;
use std::sync::{Mutex, PoisonError};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::domain::ExchangeKind;
use crate::metrics::RATE_LIMIT_WAITS;

/// Jitter added to every computed wait (0..=250 ms).
fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=250))
}

#[derive(Debug)]
struct LimiterState {
    advertised_limit: Option<u32>,
    remaining: Option<u32>,
    reset_unix: Option<i64>,
    /// Hold set when the header budget hits zero; every caller arriving
    /// before this instant waits for it, not just the first one.
    not_before: Option<Instant>,
    window_started: Instant,
    used: u32,
}

impl LimiterState {
    /// Decide how long the caller must sleep, and account for its request.
    /// One pass: budget is consumed here so concurrent callers serialize
    /// correctly without re-planning after the sleep.
    fn plan(&mut self, now_unix: i64, now: Instant, interval: Duration, limit: u32) -> Option<Duration> {
        let mut wait = Duration::ZERO;

        // Header-driven budget. An exhausted budget turns into a hold until
        // the advertised reset; after that the budget is treated as
        // refreshed and the next response re-fills the real numbers.
        if self.remaining == Some(0) {
            self.remaining = None;
            if let Some(reset) = self.reset_unix {
                let delta = (reset - now_unix).clamp(0, 60);
                self.not_before = Some(now + Duration::from_secs(delta as u64));
            }
        }
        match self.not_before {
            Some(deadline) if now < deadline => {
                wait = wait.max(deadline - now);
            }
            Some(_) => self.not_before = None,
            None => {}
        }

        // Fixed requests-per-interval window.
        if now.saturating_duration_since(self.window_started) >= interval {
            self.window_started = now;
            self.used = 0;
        }
        if self.used >= limit {
            let rem = interval.saturating_sub(now.saturating_duration_since(self.window_started));
            wait = wait.max(rem);
        }

        if wait > Duration::ZERO {
            // the caller occupies the first slot of the window that opens
            // when its sleep ends
            self.window_started = now + wait;
            self.used = 1;
            Some(wait + jitter())
        } else {
            self.used += 1;
            None
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    exchange: ExchangeKind,
    interval: Duration,
    limit: u32,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(exchange: ExchangeKind, interval: Duration, limit: u32) -> Self {
        Self {
            exchange,
            interval,
            limit: limit.max(1),
            state: Mutex::new(LimiterState {
                advertised_limit: None,
                remaining: None,
                reset_unix: None,
                not_before: None,
                window_started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Gate one outgoing request. Sleeps as long as the current budget
    /// requires, never longer than 60s (+jitter) per pass.
    pub async fn before_request(&self) {
        let wait = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.plan(Utc::now().timestamp(), Instant::now(), self.interval, self.limit)
        };
        if let Some(d) = wait {
            RATE_LIMIT_WAITS.with_label_values(&[self.exchange.as_str()]).inc();
            debug!(exchange = self.exchange.as_str(), wait_ms = d.as_millis() as u64, "rate limit wait");
            sleep(d).await;
        }
    }

    /// Ingest `X-RateLimit-Limit` / `-Remaining` / `-Reset` header values.
    /// Absent headers leave the corresponding state untouched.
    pub fn on_response(&self, limit: Option<u32>, remaining: Option<u32>, reset_unix: Option<i64>) {
        if limit.is_none() && remaining.is_none() && reset_unix.is_none() {
            return;
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if limit.is_some() {
            st.advertised_limit = limit;
        }
        if remaining.is_some() {
            st.remaining = remaining;
        }
        if reset_unix.is_some() {
            st.reset_unix = reset_unix;
        }
        if let (Some(lim), Some(rem)) = (st.advertised_limit, st.remaining) {
            if lim > 0 && rem <= lim / 10 {
                warn!(
                    exchange = self.exchange.as_str(),
                    remaining = rem,
                    limit = lim,
                    "request budget running low"
                );
            }
        }
    }

    /// Current `(limit, remaining, reset)` view, for logs and tests.
    pub fn status(&self) -> (Option<u32>, Option<u32>, Option<i64>) {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (st.advertised_limit, st.remaining, st.reset_unix)
    }
}
