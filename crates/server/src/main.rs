use std::sync::Arc;

use anyhow::Context;
use docsync_server::{
    config::{LogFormat, ServerConfig, StorageBackend},
    metrics,
    persistence::{DocStore, MemoryDocStore, SqliteDocStore},
    run, AppState,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config);

    let store: Arc<dyn DocStore> = match &config.storage {
        StorageBackend::Sqlite(path) => Arc::new(
            SqliteDocStore::open(path)
                .with_context(|| format!("failed to open document store `{}`", path.display()))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryDocStore::new()),
    };

    let listen_addr = config.listen_addr;
    let storage = format!("{:?}", config.storage);
    let state = AppState::new(store, config);
    metrics::set_global_metrics(Arc::clone(&state.metrics));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind docsync listener on {listen_addr}"))?;

    info!(listen_addr = %listen_addr, storage = %storage, "starting docsync server");

    run(listener, state, shutdown_signal()).await
}

fn init_tracing(config: &ServerConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
