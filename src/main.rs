use clap::Parser;
use std::sync::Arc;
use tracing::info;

use convert_gateway::config::Args;
use convert_gateway::rate_limit::sweeper;
use convert_gateway::router;
use convert_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convert_gateway=info,tower_http=info".into()),
        )
        .init();

    // parse cli arguments
    let args = Args::parse();
    let state = Arc::new(AppState::from_args(&args));

    // expired rate limit entries are dropped once per window
    tokio::spawn(sweeper(Arc::clone(&state.rate_limiter), args.rate_window()));

    let app = router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Gateway running");
    info!(
        max_requests = args.rate_limit,
        window_ms = args.rate_window_ms,
        "Rate limit configured"
    );
    info!(
        max_upload_bytes = args.max_upload_bytes,
        tolerance = args.reduce_tolerance,
        max_iterations = args.reduce_max_iterations,
        "Conversion limits"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
