//! Courier delivery server

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use courier_common::{Channel, Job};
use courier_config::AppConfig;
use courier_dispatch::{
    Dispatcher, HttpSender, SendError, SendReceipt, Sender, SenderRegistry,
};
use courier_store::{JobStore, MemoryJobStore};
use serde::Serialize;
use tracing::info;

/// Log-only sender for local development; every send succeeds.
struct DevSender;

#[async_trait::async_trait]
impl Sender for DevSender {
    async fn send(&self, job: &Job) -> Result<SendReceipt, SendError> {
        info!(job_id = %job.id, channel = %job.channel(), "DEV: message delivered");
        Ok(SendReceipt {
            provider_id: None,
            sent_at: chrono::Utc::now(),
        })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    dispatcher_running: bool,
    store_healthy: bool,
}

fn build_senders(config: &AppConfig) -> anyhow::Result<SenderRegistry> {
    let mut senders = SenderRegistry::new();
    for channel in Channel::all() {
        let sender: Arc<dyn Sender> = if config.dev_mode {
            Arc::new(DevSender)
        } else {
            let cfg = config.channels.for_channel(channel);
            Arc::new(HttpSender::new(
                cfg.endpoint.clone(),
                Duration::from_millis(cfg.send_timeout_ms),
            )?)
        };
        senders.register(channel, sender);
    }
    Ok(senders)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_common::logging::init_logging("courierd");

    info!("Starting Courier delivery server");

    let config = AppConfig::load()?;
    info!(
        poll_interval_ms = config.dispatcher.poll_interval_ms,
        claim_batch_size = config.dispatcher.claim_batch_size,
        dev_mode = config.dev_mode,
        "Dispatcher configuration loaded"
    );

    let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(
        "courier",
        config.dispatcher.visibility_timeout_ms,
    ));
    let senders = build_senders(&config)?;

    let dispatcher = Dispatcher::new(&config, store.clone(), senders);
    dispatcher.start().await;

    let health_dispatcher = dispatcher.clone();
    let health_store = store.clone();
    let metrics_dispatcher = dispatcher.clone();
    let app = Router::new()
        .route(
            "/q/health",
            get(move || {
                let d = health_dispatcher.clone();
                let s = health_store.clone();
                async move {
                    let running = d.is_running().await;
                    Json(HealthResponse {
                        status: if running { "UP".to_string() } else { "DOWN".to_string() },
                        dispatcher_running: running,
                        store_healthy: s.is_healthy(),
                    })
                }
            }),
        )
        .route("/q/health/live", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route("/q/health/ready", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route(
            "/q/metrics",
            get(move || {
                let d = metrics_dispatcher.clone();
                async move { Json(d.metrics().report()) }
            }),
        );

    info!(host = %config.http.host, port = config.http.port, "HTTP server starting");

    let listener =
        tokio::net::TcpListener::bind((config.http.host.as_str(), config.http.port)).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(dispatcher, store))
        .await?;

    info!("Courier server stopped");
    Ok(())
}

async fn shutdown_signal(dispatcher: Arc<Dispatcher>, store: Arc<MemoryJobStore>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("Shutdown signal received");
    dispatcher.stop().await;
    store.stop().await;
}
