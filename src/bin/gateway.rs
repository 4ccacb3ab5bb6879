use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tracing::{error, info};

use social_pipeline::rate_limiter::{FixedWindowLimiter, RedisRateLimitStore};
use social_pipeline::{Config, GatewayConfig, GatewayState, build_gateway_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env(3000, "gateway") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    utils::init_tracing(&config);

    info!("Starting gateway v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    let gateway = GatewayConfig::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        post = %gateway.post_service_url,
        media = %gateway.media_service_url,
        search = %gateway.search_service_url,
        identity = %gateway.identity_service_url,
        "Configuration loaded"
    );

    metrics::try_init_metrics(config.metrics_addr());

    let limiter = if gateway.rate_limiting_enabled() {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(|e| {
            error!("Invalid Redis URL: {e}");
            exitcode::CONFIG
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {e}");
            exitcode::UNAVAILABLE
        })?;
        Some(FixedWindowLimiter::new(
            Arc::new(RedisRateLimitStore::new(conn)),
            gateway.rate_limit_max_requests,
            gateway.rate_limit_window,
        ))
    } else {
        None
    };

    let state = GatewayState::new(&config, &gateway).map_err(|e| {
        error!("Failed to build proxy: {e}");
        exitcode::SOFTWARE
    })?;
    let app = build_gateway_router(state, &config, &gateway, limiter);

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");

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

    info!("Gateway shutdown complete");
    Ok(())
}
