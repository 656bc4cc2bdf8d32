mod convert;
mod convert_file;
mod health;
mod metrics;
mod reduce;
mod upload;

pub use convert::convert_handler;
pub use convert_file::convert_file_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use reduce::reduce_handler;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

// Download response: raw bytes with type, length and a suggested file name
pub(crate) fn attachment(data: Vec<u8>, content_type: &'static str, file_name: &str) -> Response {
    let len = data.len();
    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(v) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name.replace('"', ""))) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    response
}
