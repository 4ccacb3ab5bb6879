use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use social_pipeline::db::{self, Schema};
use social_pipeline::event_bus::subscribe;
use social_pipeline::media::{LocalObjectStorage, PgMediaStore};
use social_pipeline::models::PostDeleted;
use social_pipeline::{
    Config, EventBus, IggyEventBus, MediaConfig, MediaService, build_media_router, metrics, utils,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env(3003, "media-service") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    utils::init_tracing(&config);

    info!("Starting media service v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    let media = MediaConfig::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        storage_dir = %media.storage_dir,
        max_file_size = media.max_file_size,
        "Configuration loaded"
    );

    metrics::try_init_metrics(config.metrics_addr());

    let pool = db::connect_pool(
        &config.database_url,
        config.database_max_connections,
        config.operation_timeout,
    )
    .await
    .map_err(|e| {
        error!("{e:#}");
        exitcode::UNAVAILABLE
    })?;
    db::migrate(&pool, Schema::Media).await.map_err(|e| {
        error!("{e:#}");
        exitcode::SOFTWARE
    })?;

    let storage = LocalObjectStorage::new(&media.storage_dir, &media.public_base_url)
        .await
        .map_err(|e| {
            error!("{e}");
            exitcode::CANTCREAT
        })?;

    let bus = Arc::new(IggyEventBus::new(&config).map_err(|e| {
        error!("Invalid event bus settings: {e}");
        exitcode::CONFIG
    })?);

    let service = MediaService::new(
        Arc::new(PgMediaStore::new(pool)),
        Arc::new(storage),
        bus.clone(),
        media.max_file_size,
    );

    subscribe::<PostDeleted, _>(bus.as_ref(), Arc::new(service.lifecycle()))
        .await
        .map_err(|e| {
            error!("Failed to subscribe media lifecycle handler: {e}");
            exitcode::UNAVAILABLE
        })?;
    info!("Media lifecycle handler subscribed to post.deleted");

    let app = build_media_router(service, &config);

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Media service listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, stopping event consumers...");
    bus.shutdown().await;

    info!("Media service shutdown complete");
    Ok(())
}
