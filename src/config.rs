use clap::Parser;
use std::time::Duration;

use crate::formats::DEFAULT_MAX_UPLOAD_BYTES;
use crate::size_search::SearchPolicy;

// CLI argument structure - every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "convert-gateway")]
#[command(about = "Rate-limited image and document conversion server")]
pub struct Args {
    /// Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: String,

    /// Rate limit max requests per window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub rate_limit: u32,

    /// Rate limit window in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub rate_window_ms: u64,

    /// Largest accepted upload in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Accepted deviation from the target size, as a fraction of the target
    #[arg(long, env = "REDUCE_TOLERANCE", default_value_t = 0.1, value_parser = parse_tolerance)]
    pub reduce_tolerance: f64,

    /// Encode attempts before the final unconditional one
    #[arg(long, env = "REDUCE_MAX_ITERATIONS", default_value_t = 8)]
    pub reduce_max_iterations: u32,

    /// Quality bound width below which the search stops
    #[arg(long, env = "REDUCE_MIN_BOUND_WIDTH", default_value_t = 3)]
    pub reduce_min_bound_width: u8,
}

impl Args {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn search_policy(&self) -> SearchPolicy {
        SearchPolicy {
            tolerance: self.reduce_tolerance,
            max_iterations: self.reduce_max_iterations,
            min_bound_width: self.reduce_min_bound_width,
        }
    }
}

// Arguments of the `reduce` client
#[derive(Parser, Debug, Clone)]
#[command(name = "reduce")]
#[command(about = "Shrink an image to a target file size through a running convert-gateway")]
pub struct ReduceArgs {
    /// Image to shrink
    pub input: std::path::PathBuf,

    /// Target size, e.g. 500
    #[arg(short, long)]
    pub target: String,

    /// Unit of --target (KB or MB)
    #[arg(short, long, default_value = "MB")]
    pub unit: String,

    /// Where to write the result (defaults to reduced-<input name>)
    #[arg(short, long)]
    pub output: Option<std::path::PathBuf>,

    /// Base URL of the gateway
    #[arg(long, env = "CONVERT_GATEWAY_URL", default_value = "http://localhost:8080")]
    pub server: String,

    /// Accepted deviation from the target size
    #[arg(long, default_value_t = 0.1, value_parser = parse_tolerance)]
    pub tolerance: f64,

    /// Encode attempts before the final unconditional one
    #[arg(long, default_value_t = 8)]
    pub max_iterations: u32,

    /// Quality bound width below which the search stops
    #[arg(long, default_value_t = 3)]
    pub min_bound_width: u8,
}

impl ReduceArgs {
    pub fn search_policy(&self) -> SearchPolicy {
        SearchPolicy {
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            min_bound_width: self.min_bound_width,
        }
    }
}

// Tolerance is a fraction of the target: finite and not negative
fn parse_tolerance(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("tolerance must be a finite value of at least 0, got `{raw}`"));
    }
    Ok(value)
}
