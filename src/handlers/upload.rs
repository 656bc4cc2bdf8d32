use axum::extract::Multipart;
use tracing::debug;

use crate::error::ApiError;
use crate::formats::{ValidationError, check_size};
use crate::models::{UploadForm, UploadedFile};

// Collect the multipart form. The `file` part is size-checked against `max_bytes`.
pub(crate) async fn read_form(mut multipart: Multipart, max_bytes: usize) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();

        if field_name == "file" {
            let name = field.file_name().unwrap_or_default().to_string();
            let content_type = field
                .content_type()
                .map(String::from)
                .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            check_size(data.len(), max_bytes)?;

            debug!(file = %name, size = data.len(), "Received upload");
            form.file = Some(UploadedFile {
                name,
                content_type,
                data,
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            form.fields.insert(field_name, value);
        }
    }

    Ok(form)
}

pub(crate) fn require_file(form: &UploadForm) -> Result<&UploadedFile, ApiError> {
    form.file
        .as_ref()
        .filter(|f| !f.data.is_empty())
        .ok_or(ApiError::Validation(ValidationError::NoFile))
}
