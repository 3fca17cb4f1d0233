mod api;
mod config;
mod downloader;
mod error;
mod sanitize;

use std::collections::HashSet;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{
    api::AppState,
    config::Config,
    downloader::{Downloader, cleanup_stale_download_jobs},
    error::StartupError,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "music_webhook=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(err) = run().await {
        error!("Server error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.downloader.scratch_root)
        .await
        .map_err(StartupError::ScratchDir)?;

    let downloader = Downloader::new(config.downloader.clone());
    cleanup_stale_download_jobs(
        downloader.scratch_root(),
        downloader.stale_job_age(),
        &HashSet::new(),
    )
    .await;

    info!(
        "yt-dlp={} timeout={}s max_bytes={} scratch={:?} concurrencia={}",
        config.downloader.program,
        config.downloader.timeout.as_secs(),
        config.downloader.max_file_bytes,
        config.downloader.scratch_root,
        config.max_concurrent_downloads
    );

    let state = AppState::new(downloader, config.max_concurrent_downloads);
    let app = api::router(state, config.allowed_origins);

    let addr = config.bind_addr;
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("Backend listo en http://{addr}");

    axum::serve(listener, app).await.map_err(StartupError::Serve)
}
