//! Rate-limited HTTP gateway for image and document conversion.
//!
//! Every route under `/api` goes through the per-client fixed-window
//! [`rate_limit::RateLimiter`]. Image conversions run on the `image` crate,
//! documents on `lopdf` and `zip`. [`size_search`] shrinks an image to a byte
//! target by searching over encoder quality, either in-process
//! (`POST /api/reduce`) or remotely through [`client::RemoteEncoder`].

pub mod client;
pub mod config;
pub mod documents;
pub mod encoder;
pub mod error;
pub mod formats;
pub mod handlers;
pub mod image_codec;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod size_search;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

// Room for the non-file form fields on top of the upload cap
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/convert", post(handlers::convert_handler))
        .route("/convert-file", post(handlers::convert_file_handler))
        .route("/reduce", post(handlers::reduce_handler))
        .layer(DefaultBodyLimit::max(
            state.max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES),
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
