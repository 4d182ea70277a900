/**
 * PROBER - Sondes de joignabilité périodiques, indépendantes des heartbeats
 *
 * FONCTIONNEMENT :
 * - Un cycle toutes les `interval` : une tâche tokio par hôte ayant une adresse
 * - Chaque sonde est abandonnée à son timeout (le futur est droppé, le process
 *   ping est tué via kill_on_drop) : aucun backlog de sondes bloquées
 * - Un timeout ou une erreur de sonde = résultat "injoignable", jamais une erreur remontée
 * - Pas de retry dans le cycle : le cycle suivant fait office de retry
 */

use crate::aggregator::SharedAggregator;
use crate::health::HealthTracker;
use crate::models::ProbeResult;
use futures::future::BoxFuture;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe address: {0}")]
    InvalidAddress(String),
    #[error("failed to run ping: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Vérification de joignabilité d'une adresse.
/// Le futur retourné doit être annulable par simple drop.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, address: &str, timeout: Duration) -> BoxFuture<'static, Result<ProbeResult, ProbeError>>;
}

/// Sonde ICMP via la commande `ping` du système (un seul paquet)
#[derive(Debug, Clone, Default)]
pub struct PingProbe;

impl Probe for PingProbe {
    fn probe(&self, address: &str, timeout: Duration) -> BoxFuture<'static, Result<ProbeResult, ProbeError>> {
        let address = address.to_string();
        Box::pin(async move {
            if address.is_empty() || address.starts_with('-') || address.chars().any(char::is_whitespace) {
                return Err(ProbeError::InvalidAddress(address));
            }
            let output = ping_command(&address, timeout)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;
            if !output.status.success() {
                return Ok(ProbeResult::unreachable());
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(ProbeResult::reachable(parse_latency_ms(&stdout)))
        })
    }
}

fn ping_command(address: &str, timeout: Duration) -> Command {
    let mut cmd = Command::new("ping");
    if cfg!(windows) {
        let ms = timeout.as_millis().max(1).to_string();
        cmd.args(["-n", "1", "-w", ms.as_str(), address]);
    } else {
        let secs = timeout.as_secs().max(1).to_string();
        cmd.args(["-c", "1", "-W", secs.as_str(), address]);
    }
    cmd
}

/// Extrait la latence de la sortie de ping : `time=12.3 ms`, `time<1ms`
pub fn parse_latency_ms(output: &str) -> Option<f64> {
    let lower = output.to_ascii_lowercase();
    let idx = lower.find("time=").or_else(|| lower.find("time<"))?;
    let number: String = lower[idx + 5..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().ok()
}

/// Bilan d'un cycle de sondes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub reachable: usize,
    pub elapsed: Duration,
}

pub struct Prober<P: Probe> {
    aggregator: SharedAggregator,
    probe: Arc<P>,
    interval: Duration,
    timeout: Duration,
    health: Option<HealthTracker>,
}

impl<P: Probe> Prober<P> {
    pub fn new(aggregator: SharedAggregator, probe: P, interval: Duration, timeout: Duration) -> Self {
        Self {
            aggregator,
            probe: Arc::new(probe),
            interval,
            timeout,
            health: None,
        }
    }

    pub fn with_health_tracker(mut self, health: HealthTracker) -> Self {
        self.health = Some(health);
        self
    }

    /// Sonde tous les hôtes en parallèle. Durée bornée par le timeout d'une seule sonde.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut tasks = JoinSet::new();

        for (host_id, address) in self.aggregator.probe_targets() {
            let probe = self.probe.clone();
            let aggregator = self.aggregator.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, probe.probe(&address, timeout)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        debug!(host_id = %host_id, address = %address, error = %e, "[prober] probe failed");
                        ProbeResult::unreachable()
                    }
                    Err(_) => {
                        debug!(host_id = %host_id, address = %address, "[prober] probe timed out");
                        ProbeResult::unreachable()
                    }
                };
                // enregistré dès la fin de la sonde : horodatage = fin de sonde
                if let Err(e) = aggregator.record_probe(&host_id, result) {
                    warn!(host_id = %host_id, error = %e, "[prober] failed to record probe result");
                }
                result.ok
            });
        }

        let mut probed = 0;
        let mut reachable = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ok) => {
                    probed += 1;
                    if ok {
                        reachable += 1;
                    }
                }
                Err(e) => warn!(error = %e, "[prober] probe task panicked"),
            }
        }

        let report = CycleReport {
            probed,
            reachable,
            elapsed: started.elapsed(),
        };
        if let Some(health) = &self.health {
            health.record_probe_cycle(&report);
        }
        report
    }

    /// Boucle principale, jusqu'au signal d'arrêt
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "[prober] starting reachability prober"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(
                        probed = report.probed,
                        reachable = report.reachable,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "[prober] cycle complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("[prober] stopping");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
