//! Bridge server binary.
//!
//! Loads config (path from `SWITCHBOARD_CONFIG`, default
//! `switchboard.toml`), opens the call log, and serves until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use switchboard::provider::RestCallControl;
use switchboard::records::CallLogStore;
use switchboard::{AppState, BridgeConfig, router};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("SWITCHBOARD_LOG_DIR").unwrap_or_else(|_| "logs".to_owned());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "switchboard.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let config_path = std::env::var("SWITCHBOARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("switchboard.toml"));
    let config = if config_path.is_file() {
        BridgeConfig::load(&config_path)?
    } else {
        tracing::warn!("no config at {}; using defaults", config_path.display());
        BridgeConfig::default()
    };

    let db_path = std::env::var("SWITCHBOARD_DB").unwrap_or_else(|_| "switchboard.db".to_owned());
    let records = CallLogStore::open(Path::new(&db_path))?;
    let provider = Arc::new(RestCallControl::new(&config.provider));

    let bind_addr = config.server.bind_addr.clone();
    let state = AppState::new(config, records, provider);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("switchboard listening on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
