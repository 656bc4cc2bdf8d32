use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::metrics::{RATE_LIMITED_TOTAL, RATE_LIMIT_ENTRIES};
use crate::state::AppState;

// Shared bucket for requests that carry no forwarding headers
pub const UNKNOWN_CLIENT: &str = "unknown";

// Rate limit entry - tracks requests per IP/key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: i64, // epoch ms when the window ends
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: i64,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, never less than one.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let wait_ms = (self.reset_time - now_ms).max(0) as u64;
        wait_ms.div_ceil(1000).max(1)
    }
}

/// Fixed-window request counter keyed by client identifier.
///
/// The table lives inside the limiter rather than in a global so each
/// server (and each test) owns its own. The read-modify-write of one key
/// happens under the DashMap shard lock held by the entry guard, so the
/// per-window allowance holds under concurrent requests from the same key.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            entries: DashMap::new(),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    // Number of live entries in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, now_ms())
    }

    /// Check `key` as if the current time were `now_ms` (epoch ms).
    pub fn check_at(&self, key: &str, now_ms: i64) -> RateLimitDecision {
        let fresh = RateLimitEntry {
            count: 1,
            reset_time: now_ms + self.window.as_millis() as i64,
        };
        let fresh_decision = RateLimitDecision {
            allowed: true,
            remaining: self.max_requests.saturating_sub(1),
            reset_time: fresh.reset_time,
        };

        let decision = match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                None
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();

                // window expired..? start a new one
                if now_ms > entry.reset_time {
                    *entry = fresh;
                    Some(fresh_decision)
                } else if entry.count >= self.max_requests {
                    // over limit
                    Some(RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: entry.reset_time,
                    })
                } else {
                    entry.count += 1;
                    Some(RateLimitDecision {
                        allowed: true,
                        remaining: self.max_requests - entry.count,
                        reset_time: entry.reset_time,
                    })
                }
            }
        };

        // len() takes every shard lock, so only after the entry guard is gone
        decision.unwrap_or_else(|| {
            RATE_LIMIT_ENTRIES.set(self.entries.len() as f64);
            fresh_decision
        })
    }

    // Drop every entry whose window has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_ms())
    }

    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now_ms <= entry.reset_time);
        let after = self.entries.len();
        RATE_LIMIT_ENTRIES.set(after as f64);
        before.saturating_sub(after)
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Derive the rate limit key from proxy headers.
///
/// First `X-Forwarded-For` element, then `X-Real-IP`, then [`UNKNOWN_CLIENT`].
/// Every client behind a proxy that sets neither header lands in the same
/// bucket.
pub fn client_key(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    forwarded
        .or(real_ip)
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

// Middleware in front of every conversion route
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = client_key(request.headers());
    let decision = state.rate_limiter.check(&key);

    if !decision.allowed {
        RATE_LIMITED_TOTAL.inc();
        debug!(client = %key, reset_time = decision.reset_time, "Rate limit exceeded");
        return Err(ApiError::RateLimited(decision));
    }

    let mut response = next.run(request).await;
    insert_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

pub fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_time));
}

// Sweeper - runs once per window and drops expired entries
pub async fn sweeper(limiter: Arc<RateLimiter>, every: Duration) {
    let mut interval = interval(every);

    info!(interval = ?every, "Rate limit sweeper started");

    loop {
        interval.tick().await;
        let removed = limiter.sweep();
        if removed > 0 {
            debug!(removed, remaining = limiter.len(), "Swept expired rate limit entries");
        }
    }
}
