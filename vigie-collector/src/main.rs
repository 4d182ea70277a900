/**
 * VIGIE COLLECTOR - Point d'entrée du collecteur
 *
 * RÔLE : Bootstrap : config, restauration de l'état disque, prober, snapshots,
 * listener MQTT optionnel et API HTTP.
 *
 * ARRÊT : Ctrl+C / SIGTERM -> drain HTTP, arrêt des tâches de fond, snapshot final.
 */

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigie_collector::aggregator::{Aggregator, SharedAggregator};
use vigie_collector::config::load_config;
use vigie_collector::health::HealthTracker;
use vigie_collector::http::{build_router, shutdown_signal, AppState};
use vigie_collector::mqtt::spawn_mqtt_listener;
use vigie_collector::persist::StateFiles;
use vigie_collector::prober::{PingProbe, Prober};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigie_collector=info")),
        )
        .init();

    let cfg = load_config().await;
    if let Err(e) = cfg.validate() {
        error!(error = %e, "[collector] invalid configuration");
        return Err(e.into());
    }

    let aggregator: SharedAggregator = Arc::new(
        Aggregator::new(cfg.retention_policy(), cfg.classifier_config())
            .with_timeline(cfg.timeline_config())
            .with_state_files(StateFiles::new(cfg.data_dir.clone())),
    );
    let (hosts, samples) = aggregator
        .restore()
        .await
        .context("failed to restore collector state")?;
    info!(hosts, samples, data_dir = %cfg.data_dir.display(), "[collector] state restored");

    let health = HealthTracker::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if cfg.prober.enabled {
        let prober = Prober::new(
            aggregator.clone(),
            PingProbe,
            Duration::from_secs(cfg.prober.interval_secs),
            Duration::from_secs(cfg.prober.timeout_secs),
        )
        .with_health_tracker(health.clone());
        tasks.push(prober.spawn(shutdown_rx.clone()));
    } else {
        info!("[collector] prober disabled");
    }

    tasks.push(Aggregator::spawn_snapshot_task(
        aggregator.clone(),
        Duration::from_secs(cfg.persist.snapshot_interval_secs),
        shutdown_rx.clone(),
    ));

    if let Some(mqtt) = cfg.mqtt.clone() {
        tasks.push(spawn_mqtt_listener(mqtt, aggregator.clone(), health.clone(), shutdown_rx.clone()));
    }

    let api_key = cfg.effective_api_key();
    if api_key.is_none() {
        warn!("[collector] no API key configured, HTTP API is open");
    }
    let app = build_router(AppState {
        aggregator: aggregator.clone(),
        health,
        api_key,
    });

    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!(addr = %cfg.listen, "[collector] listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "[collector] background task ended abnormally");
        }
    }

    match aggregator.persist_samples().await {
        Ok(count) => info!(count, "[collector] final samples snapshot written"),
        Err(e) => error!(error = %e, "[collector] final samples snapshot failed"),
    }
    Ok(())
}
