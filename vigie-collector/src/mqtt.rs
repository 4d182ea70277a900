use crate::aggregator::SharedAggregator;
use crate::config::MqttConf;
use crate::error::CollectorError;
use crate::health::HealthTracker;
use crate::models::{HeartbeatMetrics, HostId, Sample};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Même charge utile que `POST /api/heartbeat`
#[derive(Debug, Deserialize)]
pub struct HeartbeatIn {
    pub host_id: String,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

impl HeartbeatIn {
    pub fn metrics(&self) -> HeartbeatMetrics {
        HeartbeatMetrics {
            cpu_percent: self.cpu_percent,
            mem_percent: self.mem_percent,
            net_rx_bytes: self.net_rx_bytes,
            net_tx_bytes: self.net_tx_bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid heartbeat JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Rejected(#[from] CollectorError),
}

/// Décode et enregistre un heartbeat reçu sur le bus
pub fn ingest_heartbeat(aggregator: &SharedAggregator, payload: &[u8]) -> Result<Sample, IngestError> {
    let hb: HeartbeatIn = serde_json::from_slice(payload)?;
    let host_id = HostId::from(hb.host_id.as_str());
    Ok(aggregator.record_heartbeat(&host_id, hb.metrics())?)
}

/// Ce que le listener doit faire d'un événement du bus
#[derive(Debug, PartialEq, Eq)]
pub enum Action<'a> {
    /// Nouvelle session (clean session) : l'abonnement est à refaire
    Subscribe,
    Ingest(&'a [u8]),
    Ignore,
}

pub fn route_event<'a>(event: &'a Event, topic: &str) -> Action<'a> {
    match event {
        Event::Incoming(Incoming::ConnAck(_)) => Action::Subscribe,
        Event::Incoming(Incoming::Publish(p)) if p.topic == topic => Action::Ingest(&p.payload),
        _ => Action::Ignore,
    }
}

pub fn spawn_mqtt_listener(
    cfg: MqttConf,
    aggregator: SharedAggregator,
    health: HealthTracker,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut opts = MqttOptions::new("vigie-collector", &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        health.mark_mqtt_connecting();
        info!(host = %cfg.host, port = cfg.port, topic = %cfg.topic, "[mqtt] listening for heartbeats");

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(event) => match route_event(&event, &cfg.topic) {
                        Action::Subscribe => {
                            // try_ : la file de requêtes n'est vidée que par poll()
                            if let Err(e) = client.try_subscribe(&cfg.topic, QoS::AtLeastOnce) {
                                warn!(error = ?e, topic = %cfg.topic, "[mqtt] subscribe failed");
                            }
                            health.mark_mqtt_connected();
                        }
                        Action::Ingest(payload) => match ingest_heartbeat(&aggregator, payload) {
                            Ok(sample) => debug!(host_id = %sample.host_id, "[mqtt] heartbeat recorded"),
                            Err(e) => warn!(error = %e, "[mqtt] heartbeat rejected"),
                        },
                        Action::Ignore => {}
                    },
                    Err(e) => {
                        warn!(error = ?e, "[mqtt] connection error, retrying");
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
                _ = shutdown.changed() => {
                    let _ = client.disconnect().await;
                    health.mark_mqtt_disconnected();
                    info!("[mqtt] listener stopped");
                    break;
                }
            }
        }
    })
}
