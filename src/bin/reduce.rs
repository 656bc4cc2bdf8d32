//! Command-line driver for the target-size search against a running gateway.
//!
//! The resulting size is best effort: the search gives up after a bounded
//! number of attempts and keeps the closest result it found.

use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use convert_gateway::client::RemoteEncoder;
use convert_gateway::config::ReduceArgs;
use convert_gateway::formats::{InputFormat, OutputFormat, format_bytes};
use convert_gateway::size_search::{TargetSize, reduce_to_target};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reduce=info,convert_gateway=info".into()),
        )
        .init();

    let args = ReduceArgs::parse();

    let file_name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("input path has no file name")?
        .to_string();
    if InputFormat::from_file_name(&file_name).is_none() {
        return Err(format!("{file_name}: unsupported image format").into());
    }

    let data = Bytes::from(tokio::fs::read(&args.input).await?);
    let original = data.len() as u64;
    let target = TargetSize::parse(&args.target, Some(&args.unit))?;
    let format = OutputFormat::for_reduction(&file_name);

    let encoder = RemoteEncoder::new(reqwest::Client::new(), &args.server, data, file_name.clone(), format);

    // Ctrl-C stops the search before the next upload
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    info!(
        file = %file_name,
        original = %format_bytes(original),
        target = %format_bytes(target.bytes()),
        server = %encoder.endpoint(),
        "Reducing image"
    );

    let outcome = reduce_to_target(&encoder, original, target.bytes(), &args.search_policy(), &cancel).await?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_file_name(format!("reduced-{file_name}")));
    tokio::fs::write(&output, &outcome.data).await?;

    if outcome.within_tolerance {
        info!(
            output = %output.display(),
            size = %format_bytes(outcome.data.len() as u64),
            attempts = outcome.attempts,
            quality = ?outcome.quality,
            "Done"
        );
    } else {
        warn!(
            output = %output.display(),
            size = %format_bytes(outcome.data.len() as u64),
            target = %format_bytes(target.bytes()),
            attempts = outcome.attempts,
            "Closest size found is outside the tolerance; the target is approximate"
        );
    }
    Ok(())
}
