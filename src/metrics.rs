use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("convert_requests_total", "Total number of conversion requests").unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter =
        register_counter!("convert_rate_limited_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref CONVERSION_FAILURES: Counter =
        register_counter!("convert_failures_total", "Conversions that failed inside a codec").unwrap();
    pub static ref CONVERSION_LATENCY: Histogram = register_histogram!(
        "convert_latency_seconds",
        "Time spent inside codecs per request in seconds"
    )
    .unwrap();
    pub static ref REDUCE_ATTEMPTS: Histogram = register_histogram!(
        "convert_reduce_attempts",
        "Encode attempts used by each target-size search",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
    )
    .unwrap();
    pub static ref RATE_LIMIT_ENTRIES: Gauge =
        register_gauge!("convert_rate_limit_entries", "Current number of clients tracked by the rate limiter").unwrap();
}

// Touch every metric so a scrape before the first request still lists them
fn register_all() {
    lazy_static::initialize(&REQUEST_TOTAL);
    lazy_static::initialize(&RATE_LIMITED_TOTAL);
    lazy_static::initialize(&CONVERSION_FAILURES);
    lazy_static::initialize(&CONVERSION_LATENCY);
    lazy_static::initialize(&REDUCE_ATTEMPTS);
    lazy_static::initialize(&RATE_LIMIT_ENTRIES);
}

// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    register_all();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
