use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::encoder::{EncodeError, Encoder};
use crate::formats::{InputFormat, OutputFormat};
use crate::models::ErrorBody;

/// Encoder backed by a running gateway's `/api/convert`.
///
/// Every attempt re-uploads the source, and every attempt is counted by the
/// server's rate limiter; a 429 aborts the search like any other failure.
pub struct RemoteEncoder {
    client: reqwest::Client,
    endpoint: String,
    file: Bytes,
    file_name: String,
    format: OutputFormat,
}

impl RemoteEncoder {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        file: Bytes,
        file_name: impl Into<String>,
        format: OutputFormat,
    ) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/convert", base_url.trim_end_matches('/')),
            file,
            file_name: file_name.into(),
            format,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn form(&self, quality: Option<u8>) -> Result<Form, EncodeError> {
        let mime = InputFormat::from_file_name(&self.file_name)
            .map(InputFormat::mime_type)
            .unwrap_or("application/octet-stream");
        let part = Part::bytes(self.file.to_vec())
            .file_name(self.file_name.clone())
            .mime_str(mime)?;

        let mut form = Form::new()
            .part("file", part)
            .text("format", self.format.extension());
        if let Some(q) = quality {
            form = form.text("quality", q.to_string());
        }
        Ok(form)
    }
}

impl Encoder for RemoteEncoder {
    fn output_format(&self) -> OutputFormat {
        self.format
    }

    async fn encode(&self, quality: Option<u8>) -> Result<Vec<u8>, EncodeError> {
        let form = self.form(quality)?;
        let res = self.client.post(&self.endpoint).multipart(form).send().await?;

        let status = res.status();
        if !status.is_success() {
            let message = res
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("error").to_string());
            return Err(EncodeError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = res.bytes().await?;
        debug!(quality = ?quality, size = body.len(), "Remote encode finished");
        Ok(body.to_vec())
    }
}
