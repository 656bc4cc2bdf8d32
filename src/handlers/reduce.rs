use axum::extract::{Multipart, State};
use axum::http::HeaderValue;
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::attachment;
use super::upload::{read_form, require_file};
use crate::encoder::{Encoder, LocalEncoder};
use crate::error::ApiError;
use crate::formats::{OutputFormat, ValidationError, format_bytes, validate_image_upload};
use crate::image_codec::{PreparedImage, ResizeOptions};
use crate::metrics::{CONVERSION_FAILURES, CONVERSION_LATENCY, REDUCE_ATTEMPTS, REQUEST_TOTAL};
use crate::size_search::{
    SearchError, SearchOutcome, SearchPolicy, TargetSize, reduce_to_target,
};
use crate::state::AppState;

const FAILURE_MESSAGE: &str = "Failed to reduce image";

// POST /api/reduce - shrink an image to a target size in-process
//
// Counts as a single request against the rate limit no matter how many
// encode attempts the search makes.
pub async fn reduce_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    REQUEST_TOTAL.inc();

    let form = read_form(multipart, state.max_upload_bytes).await?;
    let file = require_file(&form)?;
    validate_image_upload(
        &file.name,
        file.content_type.as_deref(),
        file.data.len(),
        state.max_upload_bytes,
    )?;

    let target = TargetSize::parse(
        form.text("targetSize").ok_or(ValidationError::InvalidTarget)?,
        form.text("targetUnit"),
    )?;
    let original_bytes = file.data.len() as u64;
    let target_bytes = target.bytes();
    if target_bytes >= original_bytes {
        return Err(ValidationError::TargetNotSmaller.into());
    }

    let format = OutputFormat::for_reduction(&file.name);
    let start_time = Instant::now();

    let data = file.data.clone();
    let prepared = tokio::task::spawn_blocking(move || PreparedImage::decode(&data, ResizeOptions::default()))
        .await
        .map_err(|e| failed(&file.name, &e))?
        .map_err(|e| failed(&file.name, &e))?;
    let encoder = LocalEncoder::new(prepared, format);

    // the guard lives in this future; if the client goes away it is dropped
    // and the detached search stops before its next encode
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let search = spawn_search(encoder, original_bytes, target_bytes, state.search_policy, cancel);

    let outcome = search
        .await
        .map_err(|e| failed(&file.name, &e))?
        .map_err(|e| match e {
            SearchError::TargetNotSmaller { .. } => ValidationError::TargetNotSmaller.into(),
            SearchError::EmptyTarget => ValidationError::InvalidTarget.into(),
            other => failed(&file.name, &other),
        })?;

    CONVERSION_LATENCY.observe(start_time.elapsed().as_secs_f64());
    REDUCE_ATTEMPTS.observe(outcome.attempts as f64);

    if outcome.within_tolerance {
        info!(
            file = %file.name,
            original = %format_bytes(original_bytes),
            target = %format_bytes(target_bytes),
            result = %format_bytes(outcome.data.len() as u64),
            attempts = outcome.attempts,
            quality = ?outcome.quality,
            "Image reduced"
        );
    } else {
        warn!(
            file = %file.name,
            target = %format_bytes(target_bytes),
            result = %format_bytes(outcome.data.len() as u64),
            attempts = outcome.attempts,
            "Reduced image is outside the target tolerance"
        );
    }

    let quality = outcome.quality;
    let attempts = outcome.attempts;
    let within = outcome.within_tolerance;
    let mut response = attachment(
        outcome.data,
        format.mime_type(),
        &format!("reduced-{}", file.name),
    );
    let headers = response.headers_mut();
    if let Some(q) = quality {
        headers.insert("x-reduce-quality", HeaderValue::from(q as u16));
    }
    headers.insert("x-reduce-attempts", HeaderValue::from(attempts));
    headers.insert(
        "x-reduce-within-tolerance",
        HeaderValue::from_static(if within { "true" } else { "false" }),
    );
    Ok(response)
}

// Run the search on its own task so it outlives the request future and can
// observe `cancel` once that future is gone
fn spawn_search<E>(
    encoder: E,
    original_bytes: u64,
    target_bytes: u64,
    policy: SearchPolicy,
    cancel: CancellationToken,
) -> JoinHandle<Result<SearchOutcome, SearchError>>
where
    E: Encoder + Send + Sync + 'static,
{
    tokio::spawn(async move {
        reduce_to_target(&encoder, original_bytes, target_bytes, &policy, &cancel).await
    })
}

fn failed(file: &str, cause: &dyn std::fmt::Display) -> ApiError {
    CONVERSION_FAILURES.inc();
    error!(file = %file, error = %cause, "Image reduction failed");
    ApiError::ConversionFailed(FAILURE_MESSAGE.to_string())
}
