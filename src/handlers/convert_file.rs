use axum::extract::{Multipart, State};
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use super::attachment;
use super::upload::{read_form, require_file};
use crate::documents::{self, Conversion};
use crate::error::ApiError;
use crate::formats::ValidationError;
use crate::metrics::{CONVERSION_FAILURES, CONVERSION_LATENCY, REQUEST_TOTAL};
use crate::state::AppState;

// POST /api/convert-file - document conversion between a fixed set of pairs
pub async fn convert_file_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    REQUEST_TOTAL.inc();

    let form = read_form(multipart, state.max_upload_bytes).await?;
    let file = require_file(&form)?;
    let (Some(from), Some(to)) = (form.text("from"), form.text("to")) else {
        return Err(ValidationError::MissingConversion.into());
    };

    let conversion = Conversion::plan(from, to)?;

    let start_time = Instant::now();
    let data = file.data.clone();
    let result = tokio::task::spawn_blocking(move || conversion.run(&data)).await;

    let converted = match result {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(failed(from, to, &file.name, &e)),
        Err(e) => return Err(failed(from, to, &file.name, &e)),
    };
    CONVERSION_LATENCY.observe(start_time.elapsed().as_secs_f64());

    let to = to.to_ascii_lowercase();
    info!(
        file = %file.name,
        ?conversion,
        input_bytes = file.data.len(),
        output_bytes = converted.len(),
        "Document converted"
    );

    Ok(attachment(
        converted,
        documents::mime_type(&to),
        &format!("converted.{to}"),
    ))
}

fn failed(from: &str, to: &str, file: &str, cause: &dyn std::fmt::Display) -> ApiError {
    CONVERSION_FAILURES.inc();
    error!(file = %file, from, to, error = %cause, "Document conversion failed");
    ApiError::ConversionFailed(format!(
        "Failed to convert {} to {}. The file may be corrupted or in an unsupported format.",
        from.to_ascii_uppercase(),
        to.to_ascii_uppercase()
    ))
}
