// Main entry point - Dependency injection and server setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::application::controller::SessionController;
use crate::application::cycle_executor::TestCycleExecutor;
use crate::application::health_monitor::SharedHealth;
use crate::application::instrument::Instrument;
use crate::application::link::InstrumentLink;
use crate::application::poller::DevicePoller;
use crate::application::session_state::SharedSession;
use crate::infrastructure::config::{load_app_config, DeviceKind};
use crate::infrastructure::cycle_catalog::load_catalog;
use crate::infrastructure::simulated_load::SimulatedLoad;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    abort_cycle, cycle_info, cycle_status, export_cycle_data, get_config, get_data, get_status,
    health_check, heartbeat, list_cycles, reconnect, reset_counters, run_cycle, start_test,
    stop_test,
};
use crate::presentation::status_stream::stream_status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadctl=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = load_app_config()?;
    let catalog = Arc::new(load_catalog(&config.cycles.catalog_path));

    // Open the instrument (infrastructure layer)
    let device: Box<dyn Instrument> = match config.device.kind {
        DeviceKind::Simulated => Box::new(SimulatedLoad::new(config.device.simulated.clone())),
    };
    let link = Arc::new(InstrumentLink::new(device, config.device.call_timeout()));
    match link.lock().await.connect().await {
        Ok(()) => tracing::info!("Connected to {:?} load", config.device.kind),
        Err(e) => tracing::warn!("Could not connect to load, polling will retry: {}", e),
    }

    // Create services (application layer)
    let session = SharedSession::new();
    let health = SharedHealth::new(config.polling.health_policy());
    let executor = Arc::new(TestCycleExecutor::new(
        link.clone(),
        catalog,
        config.cycles.executor_settings(),
    ));
    let controller = Arc::new(SessionController::new(
        link.clone(),
        session.clone(),
        health.clone(),
        executor,
        config.monitor.controller_settings(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = DevicePoller::new(link, session, health, config.polling.poller_settings());
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    // Create application state
    let state = Arc::new(AppState {
        controller: controller.clone(),
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/status/stream", get(stream_status))
        .route("/api/start", post(start_test))
        .route("/api/stop", post(stop_test))
        .route("/api/data", get(get_data))
        .route("/api/reset", post(reset_counters))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/reconnect", post(reconnect))
        .route("/api/config", get(get_config))
        .route("/api/cycles", get(list_cycles))
        .route("/api/cycles/status", get(cycle_status))
        .route("/api/cycles/abort", post(abort_cycle))
        .route("/api/cycles/export", post(export_cycle_data))
        .route("/api/cycles/:name", get(cycle_info))
        .route("/api/cycles/:name/run", post(run_cycle))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config.server.bind.parse()?;
    tracing::info!("Starting loadctl on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Could not listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    // Leave the load off on the way out
    controller.shutdown().await;
    let _ = shutdown_tx.send(true);
    poller_task.await?;

    Ok(())
}
