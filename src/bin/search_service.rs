use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use social_pipeline::cache::RedisCache;
use social_pipeline::db::{self, Schema};
use social_pipeline::event_bus::subscribe;
use social_pipeline::models::{PostCreated, PostDeleted};
use social_pipeline::search::PgSearchIndex;
use social_pipeline::{
    Config, EventBus, IggyEventBus, SearchService, build_search_router, metrics, utils,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env(3004, "search-service") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    utils::init_tracing(&config);

    info!("Starting search service v{}", env!("CARGO_PKG_VERSION"));

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
    db::migrate(&pool, Schema::Search).await.map_err(|e| {
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

    let service = SearchService::new(
        Arc::new(PgSearchIndex::new(pool)),
        Arc::new(cache),
        bus.clone(),
        config.cache_ttl,
    );

    let projector = Arc::new(service.projector());
    subscribe::<PostCreated, _>(bus.as_ref(), projector.clone())
        .await
        .map_err(|e| {
            error!("Failed to subscribe to post.created: {e}");
            exitcode::UNAVAILABLE
        })?;
    subscribe::<PostDeleted, _>(bus.as_ref(), projector)
        .await
        .map_err(|e| {
            error!("Failed to subscribe to post.deleted: {e}");
            exitcode::UNAVAILABLE
        })?;
    info!("Search projector subscribed to post events");

    let app = build_search_router(service, &config);

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Search service listening on http://{addr}");

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

    info!("Search service shutdown complete");
    Ok(())
}
