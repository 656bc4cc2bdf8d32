use axum::extract::{Multipart, State};
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use super::attachment;
use super::upload::{read_form, require_file};
use crate::error::ApiError;
use crate::formats::{
    OutputFormat, ValidationError, parse_dimension, parse_hex_color, parse_quality,
    validate_image_upload,
};
use crate::image_codec::{ConvertOptions, ResizeOptions, convert_blocking};
use crate::metrics::{CONVERSION_FAILURES, CONVERSION_LATENCY, REQUEST_TOTAL};
use crate::models::UploadForm;
use crate::state::AppState;

const FAILURE_MESSAGE: &str = "Failed to convert image. Please try again.";

// POST /api/convert - one-shot image conversion
pub async fn convert_handler(
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
    let options = convert_options(&form)?;

    let start_time = Instant::now();
    let converted = convert_blocking(file.data.clone(), options)
        .await
        .map_err(|e| {
            CONVERSION_FAILURES.inc();
            error!(file = %file.name, format = %options.format, error = %e, "Image conversion failed");
            ApiError::ConversionFailed(FAILURE_MESSAGE.to_string())
        })?;
    CONVERSION_LATENCY.observe(start_time.elapsed().as_secs_f64());

    info!(
        file = %file.name,
        format = %options.format,
        input_bytes = file.data.len(),
        output_bytes = converted.len(),
        "Image converted"
    );

    let format = options.format;
    Ok(attachment(
        converted,
        format.mime_type(),
        &format!("converted.{}", format.extension()),
    ))
}

fn convert_options(form: &UploadForm) -> Result<ConvertOptions, ValidationError> {
    let format = form.text("format").ok_or(ValidationError::MissingFormat)?;
    let format = OutputFormat::parse(format).ok_or(ValidationError::UnsupportedOutput)?;

    Ok(ConvertOptions {
        format,
        quality: form.text("quality").map(parse_quality).transpose()?,
        resize: ResizeOptions {
            width: form
                .text("width")
                .map(|v| parse_dimension(v, "width"))
                .transpose()?,
            height: form
                .text("height")
                .map(|v| parse_dimension(v, "height"))
                .transpose()?,
        },
        background: form
            .text("backgroundColor")
            .map(parse_hex_color)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn form(fields: &[(&str, &str)]) -> UploadForm {
        let mut form = UploadForm::default();
        for (k, v) in fields {
            form.fields.insert(k.to_string(), v.to_string());
        }
        form
    }

    #[test]
    fn format_is_required_and_must_be_known() {
        assert_eq!(
            convert_options(&form(&[])).unwrap_err(),
            ValidationError::MissingFormat
        );
        assert_eq!(
            convert_options(&form(&[("format", "gif")])).unwrap_err(),
            ValidationError::UnsupportedOutput
        );
    }

    #[test]
    fn optional_fields_are_parsed() {
        let options = convert_options(&form(&[
            ("format", "jpeg"),
            ("quality", "70"),
            ("width", "800"),
            ("backgroundColor", "#ffffff"),
        ]))
        .unwrap();
        assert_eq!(options.format, OutputFormat::Jpeg);
        assert_eq!(options.quality, Some(70));
        assert_eq!(options.resize.width, Some(800));
        assert_eq!(options.resize.height, None);
        assert_eq!(options.background, Some(Rgb([255, 255, 255])));
    }

    #[test]
    fn blank_optional_fields_are_ignored() {
        let options = convert_options(&form(&[("format", "png"), ("quality", " ")])).unwrap();
        assert_eq!(options.quality, None);
    }
}
