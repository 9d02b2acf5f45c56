mod color;
mod config;
mod dither;
mod http;
mod message;
mod pipeline;
mod worker;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first so we can honor logging.filter directive.
    let shared = config::ConfigManager::load(None).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared).await?;
    let filter_directive = cfg_snapshot
        .logging
        .as_ref()
        .and_then(|l| l.filter.clone())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,dither_server=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();
    let jobs = cfg_snapshot.max_concurrent_jobs();
    tracing::info!(max_concurrent_jobs = jobs, env = ?cfg_snapshot.env, "starting dither worker");
    let state = http::AppState {
        cfg: shared,
        worker: std::sync::Arc::new(worker::DitherWorker::new(jobs)),
    };
    let app = http::router(state);
    http::serve(app, cfg_snapshot.bind_address()).await?;
    Ok(())
}
