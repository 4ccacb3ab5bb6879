use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use social_pipeline::cache::RedisCache;
use social_pipeline::db::{self, Schema};
use social_pipeline::posts::PgPostStore;
use social_pipeline::{
    Config, EventBus, IggyEventBus, PostService, build_post_router, metrics, utils,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env(3002, "post-service") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    utils::init_tracing(&config);

    info!("Starting post service v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
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
    db::migrate(&pool, Schema::Posts).await.map_err(|e| {
        error!("{e:#}");
        exitcode::SOFTWARE
    })?;

    let cache = RedisCache::connect(&config.redis_url).await.map_err(|e| {
        error!("Failed to connect to Redis: {e}");
        exitcode::UNAVAILABLE
    })?;

    let bus = Arc::new(IggyEventBus::new(&config).map_err(|e| {
        error!("Invalid event bus settings: {e}");
        exitcode::CONFIG
    })?);
    // Publishing reconnects on demand
    if let Err(e) = bus.ensure_connected().await {
        error!("Event bus unavailable at startup: {e}");
    }

    let service = PostService::new(
        Arc::new(PgPostStore::new(pool)),
        Arc::new(cache),
        bus.clone(),
        config.cache_ttl,
    );
    let app = build_post_router(service, &config);

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Post service listening on http://{addr}");

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

    info!("HTTP server stopped, closing event bus...");
    bus.shutdown().await;

    info!("Post service shutdown complete");
    Ok(())
}
