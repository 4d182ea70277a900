/**
 * AGRÉGATEUR (STATUS REGISTRY) - Cœur du collecteur Vigie
 *
 * RÔLE : Possède l'ensemble des hôtes enregistrés, reçoit heartbeats et
 * résultats de sonde, pilote le classifieur et répond aux lectures
 * (état courant, liste de la flotte, timeline 24h).
 *
 * FONCTIONNEMENT :
 * - Instance unique construite au démarrage, partagée via Arc (handlers HTTP, MQTT, prober)
 * - Horodatage côté serveur à la réception : l'horloge des agents n'est jamais crue
 * - Santé jamais stockée : recalculée à chaque lecture depuis les derniers échantillons
 * - Les hôtes sont permanents : pas de désenregistrement
 */

use crate::classifier::{self, ClassifierConfig};
use crate::error::{CollectorError, CollectorResult};
use crate::history::{HistoryStore, RetentionPolicy};
use crate::models::{Health, HeartbeatMetrics, Host, HostId, ProbeResult, Sample, SampleKind};
use crate::persist::StateFiles;
use crate::timeline::{self, ResourcePoint, TimelineConfig, TimelineSlot};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_RESOURCE_POINTS: usize = 1440;

/// Réponse de `current_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostStatus {
    pub host_id: HostId,
    pub name: String,
    pub address: Option<String>,
    pub health: Health,
    /// Verdict du chemin sonde, `None` = joignabilité inconnue
    pub ping: Option<Health>,
    pub heartbeat: Health,
    pub last_heartbeat_age_secs: Option<i64>,
    pub last_heartbeat: Option<Sample>,
    pub last_probe: Option<Sample>,
}

/// Ligne de `list_hosts`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSummary {
    pub host_id: HostId,
    pub name: String,
    pub health: Health,
    pub last_heartbeat_age_secs: Option<i64>,
    pub last_probe: Option<ProbeResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub ok: usize,
    pub warn: usize,
    pub down: usize,
}

/// Vue flotte : pire état des hôtes (OK pour une flotte vide) + détail par hôte
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStatus {
    pub overall: Health,
    pub counts: HealthCounts,
    pub hosts: Vec<HostSummary>,
}

pub struct Aggregator {
    hosts: RwLock<HashMap<HostId, Host>>,
    store: HistoryStore,
    classifier: ClassifierConfig,
    timeline: TimelineConfig,
    files: Option<StateFiles>,
    /// Sérialise les écritures de la table des hôtes (mémoire + disque)
    host_writes: Mutex<()>,
}

pub type SharedAggregator = Arc<Aggregator>;

impl Aggregator {
    pub fn new(retention: RetentionPolicy, classifier: ClassifierConfig) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            store: HistoryStore::new(retention),
            classifier,
            timeline: TimelineConfig::default(),
            files: None,
            host_writes: Mutex::new(()),
        }
    }

    pub fn with_timeline(mut self, timeline: TimelineConfig) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_state_files(mut self, files: StateFiles) -> Self {
        self.files = Some(files);
        self
    }

    /// Recharge hôtes et échantillons depuis les fichiers d'état
    pub async fn restore(&self) -> CollectorResult<(usize, usize)> {
        let Some(files) = &self.files else {
            return Ok((0, 0));
        };
        let hosts = files.load_hosts().await?;
        let samples = files.load_samples().await?;
        Ok(self.load(hosts, samples, OffsetDateTime::now_utc()))
    }

    /// Charge un état existant puis réapplique la rétention par rapport à `now`
    pub fn load(&self, hosts: Vec<Host>, samples: Vec<Sample>, now: OffsetDateTime) -> (usize, usize) {
        {
            let mut map = self.hosts.write();
            for host in hosts {
                self.store.open(&host.id);
                map.insert(host.id.clone(), host);
            }
        }

        let mut loaded = 0usize;
        for sample in samples {
            let host_id = sample.host_id.clone();
            match self.store.append(&host_id, sample) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(host_id = %host_id, error = %e, "[aggregator] skipping persisted sample"),
            }
        }
        let pruned = self.store.prune(now);
        let retained = self.store.total_samples();
        let hosts = self.host_count();
        info!(hosts, samples = retained, loaded, pruned, "[aggregator] restored state");
        (hosts, retained)
    }

    pub async fn register_host(&self, name: &str, address: Option<String>) -> CollectorResult<Host> {
        self.register_host_at(name, address, OffsetDateTime::now_utc()).await
    }

    /// Crée un hôte avec un identifiant aléatoire. Pas d'idempotence : deux appels = deux hôtes.
    /// Si la table des hôtes ne peut pas être écrite, rien n'est enregistré.
    pub async fn register_host_at(
        &self,
        name: &str,
        address: Option<String>,
        at: OffsetDateTime,
    ) -> CollectorResult<Host> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CollectorError::InvalidRequest("host name must not be empty".into()));
        }
        let address = address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());

        let _guard = self.host_writes.lock().await;
        let mut id = HostId::generate();
        while self.store.contains(&id) {
            id = HostId::generate();
        }
        let host = Host {
            id,
            name: name.to_string(),
            address,
            registered_at: at,
        };

        if let Some(files) = &self.files {
            let mut table = self.hosts_snapshot();
            table.push(host.clone());
            files.save_hosts(&table).await?;
        }

        self.store.open(&host.id);
        self.hosts.write().insert(host.id.clone(), host.clone());
        info!(host_id = %host.id, name = %host.name, "[aggregator] registered host");
        Ok(host)
    }

    /// Met à jour l'adresse sondée d'un hôte. Retourne `true` si elle a changé.
    pub async fn observe_address(&self, host_id: &HostId, address: &str) -> CollectorResult<bool> {
        // chemin courant : adresse inchangée, aucun verrou d'écriture
        if self.host(host_id)?.address.as_deref() == Some(address) {
            return Ok(false);
        }

        let _guard = self.host_writes.lock().await;
        let previous = {
            let mut hosts = self.hosts.write();
            let host = hosts
                .get_mut(host_id)
                .ok_or_else(|| CollectorError::NotFound(host_id.clone()))?;
            if host.address.as_deref() == Some(address) {
                return Ok(false);
            }
            host.address.replace(address.to_string())
        };

        if let Some(files) = &self.files {
            if let Err(e) = files.save_hosts(&self.hosts_snapshot()).await {
                if let Some(host) = self.hosts.write().get_mut(host_id) {
                    host.address = previous;
                }
                return Err(e.into());
            }
        }
        info!(host_id = %host_id, address, "[aggregator] host address changed");
        Ok(true)
    }

    pub fn record_heartbeat(&self, host_id: &HostId, metrics: HeartbeatMetrics) -> CollectorResult<Sample> {
        self.record_heartbeat_at(host_id, metrics, OffsetDateTime::now_utc())
    }

    pub fn record_heartbeat_at(
        &self,
        host_id: &HostId,
        metrics: HeartbeatMetrics,
        at: OffsetDateTime,
    ) -> CollectorResult<Sample> {
        metrics.validate().map_err(CollectorError::InvalidSample)?;
        self.store.append(host_id, Sample::heartbeat(host_id.clone(), at, metrics))
    }

    /// Appelé par le prober, horodaté à la fin de la sonde
    pub fn record_probe(&self, host_id: &HostId, result: ProbeResult) -> CollectorResult<Sample> {
        self.record_probe_at(host_id, result, OffsetDateTime::now_utc())
    }

    pub fn record_probe_at(
        &self,
        host_id: &HostId,
        result: ProbeResult,
        at: OffsetDateTime,
    ) -> CollectorResult<Sample> {
        result.validate().map_err(CollectorError::InvalidSample)?;
        self.store.append(host_id, Sample::probe(host_id.clone(), at, result))
    }

    pub fn host(&self, host_id: &HostId) -> CollectorResult<Host> {
        self.hosts
            .read()
            .get(host_id)
            .cloned()
            .ok_or_else(|| CollectorError::NotFound(host_id.clone()))
    }

    pub fn current_status(&self, host_id: &HostId) -> CollectorResult<HostStatus> {
        self.current_status_at(host_id, OffsetDateTime::now_utc())
    }

    pub fn current_status_at(&self, host_id: &HostId, now: OffsetDateTime) -> CollectorResult<HostStatus> {
        let host = self.host(host_id)?;
        let latest = self.store.latest(host_id)?;
        let verdict = classifier::assess(latest.heartbeat.as_ref(), latest.probe.as_ref(), now, &self.classifier);

        Ok(HostStatus {
            host_id: host.id,
            name: host.name,
            address: host.address,
            health: verdict.health,
            ping: verdict.ping,
            heartbeat: verdict.heartbeat,
            last_heartbeat_age_secs: age_secs(latest.heartbeat.as_ref(), now),
            last_heartbeat: latest.heartbeat,
            last_probe: latest.probe,
        })
    }

    pub fn list_hosts(&self) -> FleetStatus {
        self.list_hosts_at(OffsetDateTime::now_utc())
    }

    /// Ne lit que le dernier heartbeat et la dernière sonde de chaque hôte
    pub fn list_hosts_at(&self, now: OffsetDateTime) -> FleetStatus {
        let mut counts = HealthCounts::default();
        let mut overall = Health::Ok;
        let mut summaries = Vec::new();

        for host in self.hosts_snapshot().into_iter().rev() {
            let latest = match self.store.latest(&host.id) {
                Ok(latest) => latest,
                Err(e) => {
                    error!(host_id = %host.id, error = %e, "[aggregator] host without history window");
                    continue;
                }
            };
            let health = classifier::classify(latest.heartbeat.as_ref(), latest.probe.as_ref(), now, &self.classifier);
            match health {
                Health::Ok => counts.ok += 1,
                Health::Warn => counts.warn += 1,
                Health::Down => counts.down += 1,
            }
            overall = overall.worst(health);
            summaries.push(HostSummary {
                host_id: host.id,
                name: host.name,
                health,
                last_heartbeat_age_secs: age_secs(latest.heartbeat.as_ref(), now),
                last_probe: latest.probe.as_ref().and_then(|s| s.probe_result().copied()),
            });
        }

        FleetStatus {
            overall,
            counts,
            hosts: summaries,
        }
    }

    pub fn timeline(&self, host_id: &HostId, duration: Duration) -> CollectorResult<Vec<TimelineSlot>> {
        self.timeline_at(host_id, duration, OffsetDateTime::now_utc())
    }

    /// Santé par créneau sur `duration` (bornée à la fenêtre de rétention)
    pub fn timeline_at(
        &self,
        host_id: &HostId,
        duration: Duration,
        now: OffsetDateTime,
    ) -> CollectorResult<Vec<TimelineSlot>> {
        let host = self.host(host_id)?;
        let duration = self.bounded_duration(duration)?;
        let start = now - duration;
        let lookback = self.classifier.heartbeat_timeout.max(self.classifier.probe_stale_after);
        let samples = self.store.window(host_id, start - lookback)?;
        Ok(timeline::build_timeline(
            &samples,
            host.registered_at,
            start,
            now,
            self.timeline.bucket,
            &self.classifier,
        ))
    }

    pub fn resource_series(
        &self,
        host_id: &HostId,
        duration: Duration,
        points: Option<usize>,
    ) -> CollectorResult<Vec<ResourcePoint>> {
        self.resource_series_at(host_id, duration, points, OffsetDateTime::now_utc())
    }

    pub fn resource_series_at(
        &self,
        host_id: &HostId,
        duration: Duration,
        points: Option<usize>,
        now: OffsetDateTime,
    ) -> CollectorResult<Vec<ResourcePoint>> {
        self.host(host_id)?;
        let duration = self.bounded_duration(duration)?;
        let points = points.unwrap_or(self.timeline.resource_points);
        if points == 0 || points > MAX_RESOURCE_POINTS {
            return Err(CollectorError::InvalidRequest(format!(
                "points must be between 1 and {MAX_RESOURCE_POINTS}"
            )));
        }
        let start = now - duration;
        let samples = self.store.window(host_id, start)?;
        Ok(timeline::build_resource_series(&samples, start, now, points))
    }

    pub fn recent(
        &self,
        host_id: &HostId,
        kind: Option<SampleKind>,
        limit: Option<usize>,
    ) -> CollectorResult<Vec<Sample>> {
        self.store.recent(host_id, kind, limit)
    }

    pub fn window(&self, host_id: &HostId, since: OffsetDateTime) -> CollectorResult<Vec<Sample>> {
        self.store.window(host_id, since)
    }

    /// Hôtes ayant une adresse sondable
    pub fn probe_targets(&self) -> Vec<(HostId, String)> {
        self.hosts
            .read()
            .values()
            .filter_map(|h| h.address.clone().map(|a| (h.id.clone(), a)))
            .collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn sample_count(&self) -> usize {
        self.store.total_samples()
    }

    /// Écrit la table des échantillons. Sans fichiers d'état : no-op.
    pub async fn persist_samples(&self) -> CollectorResult<usize> {
        let Some(files) = &self.files else {
            return Ok(0);
        };
        let samples = self.store.export();
        files.save_samples(&samples).await?;
        Ok(samples.len())
    }

    /// Snapshot périodique des échantillons + éviction des fenêtres inactives
    pub fn spawn_snapshot_task(
        aggregator: SharedAggregator,
        every: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        info!(every_secs = every.as_secs(), "[aggregator] starting snapshot task");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pruned = aggregator.store.prune(OffsetDateTime::now_utc());
                        match aggregator.persist_samples().await {
                            Ok(count) => debug!(count, pruned, "[aggregator] samples snapshot written"),
                            Err(e) => error!(error = %e, "[aggregator] failed to write samples snapshot"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn bounded_duration(&self, duration: Duration) -> CollectorResult<Duration> {
        if duration <= Duration::ZERO {
            return Err(CollectorError::InvalidRequest("duration must be positive".into()));
        }
        Ok(duration.min(self.store.policy().max_age))
    }

    /// Hôtes triés par date d'enregistrement puis identifiant
    fn hosts_snapshot(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.read().values().cloned().collect();
        hosts.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));
        hosts
    }
}

fn age_secs(sample: Option<&Sample>, now: OffsetDateTime) -> Option<i64> {
    sample.map(|s| (now - s.timestamp).whole_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

    fn metrics(cpu: f32, mem: f32) -> HeartbeatMetrics {
        HeartbeatMetrics { cpu_percent: cpu, mem_percent: mem, net_rx_bytes: 100, net_tx_bytes: 200 }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(RetentionPolicy::default(), ClassifierConfig::default())
    }

    #[tokio::test]
    async fn test_register_and_heartbeat_scenario() {
        let agg = aggregator();
        let host = agg.register_host_at("web-01", None, T0).await.unwrap();
        agg.record_heartbeat_at(&host.id, metrics(50.0, 40.0), T0).unwrap();

        let status = agg.current_status_at(&host.id, T0 + Duration::seconds(10)).unwrap();
        assert_eq!(status.name, "web-01");
        assert_eq!(status.health, Health::Ok);
        assert_eq!(status.ping, None);
        assert_eq!(status.last_heartbeat_age_secs, Some(10));

        let later = agg.current_status_at(&host.id, T0 + Duration::seconds(200)).unwrap();
        assert_eq!(later.health, Health::Down);
    }

    #[tokio::test]
    async fn test_host_without_any_data_is_down() {
        let agg = aggregator();
        let host = agg.register_host_at("silent", None, T0).await.unwrap();
        let status = agg.current_status_at(&host.id, T0).unwrap();
        assert_eq!(status.health, Health::Down);
        assert!(status.last_heartbeat.is_none());
        assert!(status.last_probe.is_none());
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found_everywhere() {
        let agg = aggregator();
        let ghost = HostId::from("nope");
        assert!(matches!(agg.record_heartbeat(&ghost, metrics(1.0, 1.0)), Err(CollectorError::NotFound(_))));
        assert!(matches!(agg.record_probe(&ghost, ProbeResult::unreachable()), Err(CollectorError::NotFound(_))));
        assert!(matches!(agg.current_status(&ghost), Err(CollectorError::NotFound(_))));
        assert!(matches!(agg.timeline(&ghost, Duration::hours(24)), Err(CollectorError::NotFound(_))));
        assert!(matches!(agg.observe_address(&ghost, "10.0.0.1").await, Err(CollectorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_sample_is_rejected_and_not_stored() {
        let agg = aggregator();
        let host = agg.register_host_at("web-01", None, T0).await.unwrap();
        let err = agg.record_heartbeat_at(&host.id, metrics(-5.0, 40.0), T0).unwrap_err();
        assert!(matches!(err, CollectorError::InvalidSample(_)));
        assert!(agg.recent(&host.id, None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_is_not_idempotent() {
        let agg = aggregator();
        let a = agg.register_host("web-01", None).await.unwrap();
        let b = agg.register_host("web-01", None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(agg.host_count(), 2);
        assert!(matches!(agg.register_host("  ", None).await, Err(CollectorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_failed_probe_and_slow_probe() {
        let agg = aggregator();
        let host = agg.register_host_at("web-01", Some("10.0.0.1".into()), T0).await.unwrap();
        agg.record_heartbeat_at(&host.id, metrics(50.0, 40.0), T0).unwrap();

        agg.record_probe_at(&host.id, ProbeResult::reachable(Some(900.0)), T0 + Duration::seconds(5)).unwrap();
        let status = agg.current_status_at(&host.id, T0 + Duration::seconds(10)).unwrap();
        assert_eq!(status.health, Health::Warn);

        agg.record_probe_at(&host.id, ProbeResult::unreachable(), T0 + Duration::seconds(20)).unwrap();
        let status = agg.current_status_at(&host.id, T0 + Duration::seconds(25)).unwrap();
        assert_eq!(status.health, Health::Down);
        assert_eq!(status.ping, Some(Health::Down));
        assert_eq!(status.heartbeat, Health::Ok);
    }

    #[tokio::test]
    async fn test_list_hosts_overall_and_idempotence() {
        let agg = aggregator();
        assert_eq!(agg.list_hosts_at(T0).overall, Health::Ok);

        let up = agg.register_host_at("up", None, T0).await.unwrap();
        let slow = agg.register_host_at("slow", None, T0 + Duration::seconds(1)).await.unwrap();
        let _down = agg.register_host_at("down", None, T0 + Duration::seconds(2)).await.unwrap();
        let now = T0 + Duration::seconds(30);
        agg.record_heartbeat_at(&up.id, metrics(1.0, 1.0), now).unwrap();
        agg.record_heartbeat_at(&slow.id, metrics(1.0, 1.0), now).unwrap();
        agg.record_probe_at(&slow.id, ProbeResult::reachable(Some(1000.0)), now).unwrap();

        let fleet = agg.list_hosts_at(now);
        assert_eq!(fleet.overall, Health::Down);
        assert_eq!(fleet.counts, HealthCounts { ok: 1, warn: 1, down: 1 });
        let names: Vec<&str> = fleet.hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["down", "slow", "up"]);
        assert_eq!(fleet.hosts[1].last_probe, Some(ProbeResult::reachable(Some(1000.0))));

        assert_eq!(agg.list_hosts_at(now), fleet);
        assert_eq!(agg.current_status_at(&up.id, now).unwrap(), agg.current_status_at(&up.id, now).unwrap());
    }

    #[tokio::test]
    async fn test_timeline_is_bounded_by_retention() {
        let agg = aggregator();
        let host = agg.register_host_at("web-01", None, T0).await.unwrap();
        let now = T0 + Duration::hours(48);
        let slots = agg.timeline_at(&host.id, Duration::hours(72), now).unwrap();
        assert_eq!(slots.len(), 288);
        assert_eq!(slots[0].start, now - Duration::hours(24));
        assert!(matches!(
            agg.timeline_at(&host.id, Duration::ZERO, now),
            Err(CollectorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_timeline_reflects_heartbeats() {
        let agg = aggregator();
        let host = agg.register_host_at("web-01", None, T0).await.unwrap();
        for m in 0..30 {
            agg.record_heartbeat_at(&host.id, metrics(10.0, 10.0), T0 + Duration::minutes(m)).unwrap();
        }
        let now = T0 + Duration::hours(1);
        let slots = agg.timeline_at(&host.id, Duration::hours(1), now).unwrap();
        assert_eq!(slots.len(), 12);
        assert!(slots[..6].iter().all(|s| s.health == Some(Health::Ok)));
        assert!(slots[6..].iter().all(|s| s.health == Some(Health::Down)));
    }

    #[tokio::test]
    async fn test_resource_series_validation() {
        let agg = aggregator();
        let host = agg.register_host_at("web-01", None, T0).await.unwrap();
        agg.record_heartbeat_at(&host.id, metrics(30.0, 60.0), T0 + Duration::minutes(1)).unwrap();
        let now = T0 + Duration::hours(1);
        let series = agg.resource_series_at(&host.id, Duration::hours(1), Some(6), now).unwrap();
        assert_eq!(series.len(), 6);
        assert_eq!(series[0].cpu_percent, Some(30.0));
        assert!(matches!(
            agg.resource_series_at(&host.id, Duration::hours(1), Some(0), now),
            Err(CollectorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_targets_and_address_updates() {
        let agg = aggregator();
        let with_addr = agg.register_host_at("a", Some("10.0.0.1".into()), T0).await.unwrap();
        let without = agg.register_host_at("b", None, T0).await.unwrap();
        assert_eq!(agg.probe_targets(), vec![(with_addr.id.clone(), "10.0.0.1".to_string())]);

        assert!(agg.observe_address(&without.id, "10.0.0.2").await.unwrap());
        assert!(!agg.observe_address(&without.id, "10.0.0.2").await.unwrap());
        assert_eq!(agg.probe_targets().len(), 2);
    }

    #[test]
    fn test_concurrent_heartbeats_are_never_lost() {
        let agg = Arc::new(aggregator());
        let host = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(agg.register_host("busy", None))
            .unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let agg = agg.clone();
                let id = host.id.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        agg.record_heartbeat(&id, metrics(10.0, 10.0)).unwrap();
                    }
                });
            }
        });

        let samples = agg.recent(&host.id, Some(SampleKind::Heartbeat), None).unwrap();
        assert_eq!(samples.len(), 400);
        assert!(samples.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(dir.path().join("data"));
        let agg = aggregator().with_state_files(files.clone());
        let host = agg.register_host("web-01", Some("10.0.0.1".into())).await.unwrap();
        agg.record_heartbeat(&host.id, metrics(50.0, 40.0)).unwrap();
        agg.record_probe(&host.id, ProbeResult::reachable(Some(4.0))).unwrap();
        assert_eq!(agg.persist_samples().await.unwrap(), 2);

        let reborn = aggregator().with_state_files(files);
        assert_eq!(reborn.restore().await.unwrap(), (1, 2));
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            reborn.current_status_at(&host.id, now).unwrap(),
            agg.current_status_at(&host.id, now).unwrap()
        );
    }

    #[tokio::test]
    async fn test_registration_fails_when_host_table_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let agg = aggregator().with_state_files(StateFiles::new(blocker.join("data")));

        let err = agg.register_host("web-01", None).await.unwrap_err();
        assert!(matches!(err, CollectorError::Persistence(_)));
        assert_eq!(agg.host_count(), 0);
    }

    #[test]
    fn test_load_skips_orphan_samples_and_prunes() {
        let agg = aggregator();
        let host = Host { id: HostId::from("h1"), name: "h1".into(), address: None, registered_at: T0 };
        let samples = vec![
            Sample::heartbeat(HostId::from("h1"), T0, metrics(1.0, 1.0)),
            Sample::heartbeat(HostId::from("h1"), T0 + Duration::hours(20), metrics(1.0, 1.0)),
            Sample::heartbeat(HostId::from("orphan"), T0, metrics(1.0, 1.0)),
        ];
        assert_eq!(agg.load(vec![host], samples, T0 + Duration::hours(30)), (1, 1));
    }

    #[test]
    fn test_load_reports_samples_kept_under_count_cap() {
        let policy = RetentionPolicy { max_age: Duration::hours(24), max_samples: 3 };
        let agg = Aggregator::new(policy, ClassifierConfig::default());
        let host = Host { id: HostId::from("h1"), name: "h1".into(), address: None, registered_at: T0 };
        let samples = (0..10)
            .map(|i| Sample::heartbeat(HostId::from("h1"), T0 + Duration::seconds(i), metrics(1.0, 1.0)))
            .collect();
        assert_eq!(agg.load(vec![host], samples, T0 + Duration::minutes(1)), (1, 3));
    }

    #[tokio::test]
    async fn test_unchanged_address_does_not_wait_for_host_writes() {
        let agg = aggregator();
        let host = agg.register_host_at("a", Some("10.0.0.1".into()), T0).await.unwrap();

        let _held = agg.host_writes.lock().await;
        let unchanged = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            agg.observe_address(&host.id, "10.0.0.1"),
        )
        .await;
        assert!(matches!(unchanged, Ok(Ok(false))));

        let changed = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            agg.observe_address(&host.id, "10.0.0.9"),
        )
        .await;
        assert!(changed.is_err());
    }

    #[tokio::test]
    async fn test_unknown_host_wins_over_invalid_window() {
        let agg = aggregator();
        let ghost = HostId::from("ghost");
        assert!(matches!(
            agg.timeline_at(&ghost, Duration::ZERO, T0),
            Err(CollectorError::NotFound(_))
        ));
        assert!(matches!(
            agg.resource_series_at(&ghost, Duration::ZERO, Some(0), T0),
            Err(CollectorError::NotFound(_))
        ));
    }
}
