//! HTTP-level tests: the router driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use convert_gateway::rate_limit::RateLimiter;
use convert_gateway::router;
use convert_gateway::state::AppState;

const BOUNDARY: &str = "----convert-gateway-test";

enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

fn multipart(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                        .as_bytes(),
                );
            }
            Part::File {
                name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn post(uri: &str, client: &str, parts: &[Part]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .header("x-forwarded-for", client)
        .body(Body::from(multipart(parts)))
        .unwrap()
}

fn app(max_requests: u32) -> Router {
    let limiter = Arc::new(RateLimiter::new(max_requests, Duration::from_secs(60)));
    router(Arc::new(AppState::new(limiter)))
}

async fn json(response: Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

// Deterministic noise so encoders cannot compress it away
fn noisy_image(width: u32, height: u32) -> DynamicImage {
    let mut seed: u32 = 0x2545_f491;
    let img = RgbImage::from_fn(width, height, |_, _| {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let [a, b, c, _] = seed.to_le_bytes();
        Rgb([a, b, c])
    });
    DynamicImage::ImageRgb8(img)
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn health_reports_healthy() {
    let response = app(10)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "healthy");
}

#[tokio::test]
async fn converts_png_to_jpeg() {
    let png = encode(&noisy_image(64, 48), ImageFormat::Png);
    let request = post(
        "/api/convert",
        "203.0.113.1",
        &[
            Part::Text("format", "jpg"),
            Part::Text("quality", "80"),
            Part::File {
                name: "photo.png",
                content_type: "image/png",
                data: &png,
            },
        ],
    );

    let response = app(10).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["content-type"], "image/jpeg");
    assert_eq!(
        headers["content-disposition"],
        "attachment; filename=\"converted.jpg\""
    );
    assert_eq!(headers["x-ratelimit-remaining"], "9");
    assert!(headers.contains_key("x-ratelimit-reset"));

    let length: usize = headers["content-length"].to_str().unwrap().parse().unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), length);
    assert_eq!(image::guess_format(&body).unwrap(), ImageFormat::Jpeg);
}

#[tokio::test]
async fn convert_resizes_without_enlarging() {
    let png = encode(&noisy_image(200, 100), ImageFormat::Png);
    let request = post(
        "/api/convert",
        "203.0.113.2",
        &[
            Part::Text("format", "png"),
            Part::Text("width", "50"),
            Part::File {
                name: "wide.png",
                content_type: "image/png",
                data: &png,
            },
        ],
    );

    let response = app(10).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let out = image::load_from_memory(&body).unwrap();
    assert_eq!((out.width(), out.height()), (50, 25));
}

#[tokio::test]
async fn convert_validation_errors_are_400() {
    let app = app(100);
    let png = encode(&noisy_image(8, 8), ImageFormat::Png);

    let cases: Vec<(Vec<Part>, &str)> = vec![
        (vec![Part::Text("format", "jpg")], "No file provided"),
        (
            vec![Part::File {
                name: "a.png",
                content_type: "image/png",
                data: &png,
            }],
            "Output format is required",
        ),
        (
            vec![
                Part::Text("format", "gif"),
                Part::File {
                    name: "a.png",
                    content_type: "image/png",
                    data: &png,
                },
            ],
            "Unsupported output format",
        ),
        (
            vec![
                Part::Text("format", "jpg"),
                Part::File {
                    name: "notes.txt",
                    content_type: "text/plain",
                    data: b"hello",
                },
            ],
            "File must be an image",
        ),
        (
            vec![
                Part::Text("format", "jpg"),
                Part::Text("quality", "150"),
                Part::File {
                    name: "a.png",
                    content_type: "image/png",
                    data: &png,
                },
            ],
            "Quality must be a whole number between 1 and 100",
        ),
    ];

    for (parts, message) in cases {
        let response = app
            .clone()
            .oneshot(post("/api/convert", "198.51.100.9", &parts))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{message}");
        assert_eq!(json(response).await["error"], message);
    }
}

#[tokio::test]
async fn undecodable_image_is_a_500_with_generic_message() {
    let request = post(
        "/api/convert",
        "198.51.100.10",
        &[
            Part::Text("format", "png"),
            Part::File {
                name: "broken.jpg",
                content_type: "image/jpeg",
                data: b"not really a jpeg",
            },
        ],
    );
    let response = app(10).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json(response).await["error"],
        "Failed to convert image. Please try again."
    );
}

#[tokio::test]
async fn rate_limit_rejects_after_max_requests_per_client() {
    let app = app(2);

    for expected in ["1", "0"] {
        let response = app
            .clone()
            .oneshot(post("/api/convert", "192.0.2.1", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected);
    }

    let response = app
        .clone()
        .oneshot(post("/api/convert", "192.0.2.1", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body = json(response).await;
    assert_eq!(body["error"], "Rate limit exceeded. Please try again later.");
    assert_eq!(body["remaining"], 0);
    assert!(body["resetTime"].as_i64().unwrap() > 0);
    assert_eq!(body["retryAfter"], retry_after);

    // another client still has its own window
    let response = app
        .clone()
        .oneshot(post("/api/convert", "192.0.2.2", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_metrics_are_not_rate_limited() {
    let app = app(1);
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("convert_rate_limit_entries"));
}

#[tokio::test]
async fn converts_text_to_docx_and_back() {
    let app = app(10);
    let request = post(
        "/api/convert-file",
        "203.0.113.20",
        &[
            Part::Text("from", "txt"),
            Part::Text("to", "docx"),
            Part::File {
                name: "notes.txt",
                content_type: "text/plain",
                data: b"first line\nsecond line",
            },
        ],
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    );
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"converted.docx\""
    );
    let docx = response.into_body().collect().await.unwrap().to_bytes();

    let request = post(
        "/api/convert-file",
        "203.0.113.20",
        &[
            Part::Text("from", "DOCX"),
            Part::Text("to", "TXT"),
            Part::File {
                name: "notes.docx",
                content_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                data: &docx,
            },
        ],
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    let text = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&text[..], b"first line\n\nsecond line\n\n");
}

#[tokio::test]
async fn document_errors() {
    let app = app(10);

    let response = app
        .clone()
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.21",
            &[
                Part::Text("from", "xls"),
                Part::Text("to", "pdf"),
                Part::File {
                    name: "a.xls",
                    content_type: "application/vnd.ms-excel",
                    data: b"x",
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json(response).await["error"],
        "Conversion from XLS to PDF is not yet supported."
    );

    let response = app
        .clone()
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.21",
            &[
                Part::Text("from", "pdf"),
                Part::File {
                    name: "a.pdf",
                    content_type: "application/pdf",
                    data: b"%PDF",
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "Conversion format is required");

    let response = app
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.21",
            &[
                Part::Text("from", "pdf"),
                Part::Text("to", "txt"),
                Part::File {
                    name: "a.pdf",
                    content_type: "application/pdf",
                    data: b"%PDF-1.4 truncated",
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json(response).await["error"],
        "Failed to convert PDF to TXT. The file may be corrupted or in an unsupported format."
    );
}

#[tokio::test]
async fn reduces_jpeg_towards_target() {
    let source = {
        let img = noisy_image(256, 256);
        let mut buf = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 100)
            .encode_image(&img.to_rgb8())
            .unwrap();
        buf
    };
    let target_kb = (source.len() / 3) as f64 / 1024.0;
    let target_kb = format!("{target_kb:.2}");

    let request = post(
        "/api/reduce",
        "203.0.113.30",
        &[
            Part::Text("targetSize", &target_kb),
            Part::Text("targetUnit", "KB"),
            Part::File {
                name: "noise.jpg",
                content_type: "image/jpeg",
                data: &source,
            },
        ],
    );
    let response = app(10).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "image/jpeg");
    assert_eq!(
        headers["content-disposition"],
        "attachment; filename=\"reduced-noise.jpg\""
    );
    let attempts: u32 = headers["x-reduce-attempts"].to_str().unwrap().parse().unwrap();
    assert!((1..=9).contains(&attempts));
    assert!(headers.contains_key("x-reduce-quality"));
    assert!(headers.contains_key("x-reduce-within-tolerance"));
    // one request against the limiter, however many encodes
    assert_eq!(headers["x-ratelimit-remaining"], "9");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!body.is_empty());
    assert!(body.len() < source.len());
}

#[tokio::test]
async fn reduce_rejects_targets_not_smaller_than_the_source() {
    let png = encode(&noisy_image(16, 16), ImageFormat::Png);
    let request = post(
        "/api/reduce",
        "203.0.113.31",
        &[
            Part::Text("targetSize", "5"),
            Part::Text("targetUnit", "MB"),
            Part::File {
                name: "small.png",
                content_type: "image/png",
                data: &png,
            },
        ],
    );
    let response = app(10).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json(response).await["error"],
        "Target size must be smaller than original size"
    );
}

#[tokio::test]
async fn oversize_uploads_are_rejected_with_the_cap_in_the_message() {
    let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
    let mut state = AppState::new(limiter);
    state.max_upload_bytes = 1024 * 1024;
    let app = router(Arc::new(state));

    // over the cap but within the body limit, so the handler sees it
    let data = vec![0u8; 1024 * 1024 + 512 * 1024];
    for uri in ["/api/convert", "/api/reduce", "/api/convert-file"] {
        let request = post(
            uri,
            "203.0.113.40",
            &[
                Part::Text("format", "jpg"),
                Part::File {
                    name: "huge.png",
                    content_type: "image/png",
                    data: &data,
                },
            ],
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(
            json(response).await["error"],
            "File size must be less than 1MB",
            "{uri}"
        );
    }
}

#[tokio::test]
async fn converts_xml_to_json_text_and_word() {
    let app = app(10);
    let xml = b"<order><id>42</id><item>bolt</item><item>nut</item></order>";

    let response = app
        .clone()
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.50",
            &[
                Part::Text("from", "xml"),
                Part::Text("to", "txt"),
                Part::File {
                    name: "order.xml",
                    content_type: "application/xml",
                    data: xml,
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"converted.txt\""
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        parsed,
        serde_json::json!({ "order": { "id": 42, "item": ["bolt", "nut"] } })
    );

    let response = app
        .clone()
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.50",
            &[
                Part::Text("from", "xml"),
                Part::Text("to", "docx"),
                Part::File {
                    name: "order.xml",
                    content_type: "application/xml",
                    data: xml,
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    );

    let response = app
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.50",
            &[
                Part::Text("from", "xml"),
                Part::Text("to", "txt"),
                Part::File {
                    name: "broken.xml",
                    content_type: "application/xml",
                    data: b"<order><id>",
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json(response).await["error"],
        "Failed to convert XML to TXT. The file may be corrupted or in an unsupported format."
    );
}

#[tokio::test]
async fn crafted_workbook_column_is_a_500_not_a_crash() {
    let sheet = r#"<worksheet><sheetData><row r="1"><c r="ZZZZZZ1"><v>1</v></c></row></sheetData></worksheet>"#;
    let xlsx = {
        use std::io::Write;
        let mut buf = Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(&mut buf);
        zip.start_file("xl/worksheets/sheet1.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(sheet.as_bytes()).unwrap();
        zip.finish().unwrap();
        buf.into_inner()
    };

    let response = app(10)
        .oneshot(post(
            "/api/convert-file",
            "203.0.113.60",
            &[
                Part::Text("from", "xlsx"),
                Part::Text("to", "csv"),
                Part::File {
                    name: "evil.xlsx",
                    content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                    data: &xlsx,
                },
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json(response).await["error"],
        "Failed to convert XLSX to CSV. The file may be corrupted or in an unsupported format."
    );
}
