use std::sync::Arc;

use crate::config::Args;
use crate::formats::DEFAULT_MAX_UPLOAD_BYTES;
use crate::rate_limit::RateLimiter;
use crate::size_search::SearchPolicy;

// app's shared state
pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub max_upload_bytes: usize,
    pub search_policy: SearchPolicy,
}

impl AppState {
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            rate_limiter,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            search_policy: SearchPolicy::default(),
        }
    }

    pub fn from_args(args: &Args) -> Self {
        Self {
            rate_limiter: Arc::new(RateLimiter::new(args.rate_limit, args.rate_window())),
            max_upload_bytes: args.max_upload_bytes,
            search_policy: args.search_policy(),
        }
    }
}
