//! Fixed-window rate limiting keyed by caller
//!
//! Each key gets `max` requests per window. The window starts with the first
//! request after the previous one expired; expired windows are purged by
//! [`FixedWindowRateLimiter::purge_expired`], which the server runs once per
//! window length.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Key used when the caller sent no API key
pub const ANONYMOUS_KEY: &str = "anonymous";

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window resets, rounded up
    pub retry_after_secs: u64,
}

impl RateDecision {
    /// Header pairs to attach to the response
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (RATE_LIMIT_LIMIT_HEADER, self.limit.to_string()),
            (RATE_LIMIT_REMAINING_HEADER, self.remaining.to_string()),
            (
                RATE_LIMIT_RESET_HEADER,
                self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        if !self.allowed {
            headers.push((RETRY_AFTER_HEADER, self.retry_after_secs.to_string()));
        }
        headers
    }
}

#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    max: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 1000 requests per minute
    pub fn for_ingestion() -> Self {
        Self::new(1000, Duration::from_secs(60))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Utc::now())
    }

    /// Count one request for `key` at `now`
    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        let window_len = ChronoDuration::from_std(self.window).unwrap_or(ChronoDuration::zero());
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + window_len,
        });
        if now > window.reset_at {
            window.count = 0;
            window.reset_at = now + window_len;
        }
        window.count = window.count.saturating_add(1);

        let until_reset = (window.reset_at - now).num_milliseconds().max(0) as u64;
        RateDecision {
            allowed: window.count <= self.max,
            limit: self.max,
            remaining: self.max.saturating_sub(window.count),
            reset_at: window.reset_at,
            retry_after_secs: until_reset.div_ceil(1000),
        }
    }

    /// Drop windows that ended before `now`; returns how many were removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();
        windows.retain(|_, window| window.reset_at >= now);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
