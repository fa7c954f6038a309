use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kontext_studio::{
    config::{AppConfig, StoreKind},
    orchestrator::Orchestrator,
    replicate::ReplicateClient,
    routes::{self, AppState},
    store::{FileImageStore, ImageRepository, MemoryImageStore, StaticFiles},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let filter = EnvFilter::new(format!(
        "kontext_studio={level},tower_http={level}",
        level = config.log_level
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let provider = Arc::new(ReplicateClient::new(&config.replicate, config.classifier.clone())?);
    let store: Arc<dyn ImageRepository> = match config.store {
        StoreKind::File => {
            info!(data_dir = %config.data_dir.display(), "using file image store");
            Arc::new(FileImageStore::new(config.data_dir.clone()))
        }
        StoreKind::Memory => {
            warn!("using in-memory image store, records are lost on restart");
            Arc::new(MemoryImageStore::new())
        }
    };
    let static_files = StaticFiles::new(config.static_dir.clone());
    tokio::fs::create_dir_all(static_files.images_dir())
        .await
        .context("Failed to create static images directory")?;

    if config.access_tokens.is_open() {
        warn!("ACCESS_TOKENS is empty, every caller is admitted as anonymous");
    }

    let orchestrator = Orchestrator::new(provider, store, static_files)
        .with_retry_policy(config.retry)
        .with_cost(config.cost.clone());
    let router = routes::router(AppState::new(orchestrator, config.access_tokens.clone()));

    let bind_address = config.bind_address();
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(
        file_output = ?config.replicate.file_output,
        max_attempts = config.retry.max_attempts,
        "Kontext Studio server started at http://{}",
        bind_address
    );

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
