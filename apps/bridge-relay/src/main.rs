mod cli;
mod config;
mod handlers;
mod pairing;
mod ws;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use bridge_core::{Coordinator, InMemoryLedger, SessionRegistry};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{
        api_status, await_request, cancel_request, device_status, health_check, pair_device,
        request_status, submit_request, unpair_device,
    },
    ws::device_ws_handler,
};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as a simulated device
    if let Some(Commands::Device {
        url,
        device,
        secret,
        mode,
    }) = cli.command
    {
        if let Err(e) = cli::run_device_client(url, device, secret, mode).await {
            error!("Device client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as relay server
    let config = Config::from_env();
    info!("Starting ShadowBridge relay on port {}", config.port);
    info!("Sweep interval: {} ms", config.sweep_interval_ms);

    let registry = Arc::new(SessionRegistry::new());
    let ledger = InMemoryLedger::new(registry.clone(), config.bridge_config());
    let coordinator = Coordinator::new(ledger, registry, config.bridge_config());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(api_status))
        .route("/devices/pair", post(pair_device))
        .route("/devices/:device_id/unpair", post(unpair_device))
        .route("/devices/:device_id", get(device_status))
        .route("/requests", post(submit_request))
        .route("/requests/:request_id", get(request_status))
        .route("/requests/:request_id/cancel", post(cancel_request))
        .route("/requests/:request_id/await", get(await_request))
        .route("/ws/device/:device_id", get(device_ws_handler))
        .with_state(coordinator)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("ShadowBridge relay listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
