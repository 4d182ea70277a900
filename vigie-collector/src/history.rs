/**
 * HISTORY STORE - Fenêtre d'échantillons bornée par hôte
 *
 * RÔLE : Stockage append-only des heartbeats et résultats de sonde, avec
 * éviction par âge puis par nombre (FIFO) à chaque insertion.
 *
 * CONCURRENCE :
 * - Une fenêtre = un Mutex dédié : deux hôtes ne se bloquent jamais entre eux
 * - La map hôte -> fenêtre n'est verrouillée en écriture qu'à l'ouverture d'une fenêtre
 * - Les lectures clonent sous le verrou : jamais de fenêtre vue en cours d'éviction
 */

use crate::error::{CollectorError, CollectorResult};
use crate::models::{HostId, Sample, SampleKind};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Bornes de rétention, issues de la configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_samples: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(24),
            max_samples: 4096,
        }
    }
}

/// Derniers échantillons connus de chaque type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Latest {
    pub heartbeat: Option<Sample>,
    pub probe: Option<Sample>,
}

/// Séquence ordonnée (timestamps croissants) des échantillons d'un hôte
#[derive(Debug, Default)]
pub struct HistoryWindow {
    samples: VecDeque<Sample>,
    latest: Latest,
}

impl HistoryWindow {
    /// Insère puis évince. Retourne l'échantillon tel que stocké et le nombre d'évictions.
    fn push(&mut self, mut sample: Sample, policy: &RetentionPolicy) -> (Sample, usize) {
        // ordre non décroissant garanti même si l'appelant fournit un horodatage plus ancien
        if let Some(newest) = self.newest_timestamp() {
            if sample.timestamp < newest {
                sample.timestamp = newest;
            }
        }

        match sample.kind() {
            SampleKind::Heartbeat => self.latest.heartbeat = Some(sample.clone()),
            SampleKind::Probe => self.latest.probe = Some(sample.clone()),
        }
        self.samples.push_back(sample.clone());

        let evicted = self.evict(sample.timestamp - policy.max_age, policy.max_samples);
        (sample, evicted)
    }

    fn evict(&mut self, cutoff: OffsetDateTime, max_samples: usize) -> usize {
        let mut evicted = 0;
        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
            evicted += 1;
        }
        while self.samples.len() > max_samples {
            self.samples.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn newest_timestamp(&self) -> Option<OffsetDateTime> {
        let newest_cached = [&self.latest.heartbeat, &self.latest.probe]
            .into_iter()
            .flatten()
            .map(|s| s.timestamp)
            .max();
        self.samples.back().map(|s| s.timestamp).max(newest_cached)
    }

    fn recent(&self, kind: Option<SampleKind>, limit: Option<usize>) -> Vec<Sample> {
        self.samples
            .iter()
            .rev()
            .filter(|s| kind.is_none_or(|k| s.kind() == k))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    fn since(&self, since: OffsetDateTime) -> Vec<Sample> {
        let start = self.samples.partition_point(|s| s.timestamp < since);
        self.samples.range(start..).cloned().collect()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

type SharedWindow = Arc<Mutex<HistoryWindow>>;

pub struct HistoryStore {
    policy: RetentionPolicy,
    windows: RwLock<HashMap<HostId, SharedWindow>>,
}

impl HistoryStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Crée la fenêtre vide d'un hôte nouvellement enregistré (sans effet si elle existe)
    pub fn open(&self, host_id: &HostId) {
        self.windows.write().entry(host_id.clone()).or_default();
    }

    pub fn contains(&self, host_id: &HostId) -> bool {
        self.windows.read().contains_key(host_id)
    }

    fn slot(&self, host_id: &HostId) -> CollectorResult<SharedWindow> {
        self.windows
            .read()
            .get(host_id)
            .cloned()
            .ok_or_else(|| CollectorError::NotFound(host_id.clone()))
    }

    /// Ajoute un échantillon puis applique la politique de rétention.
    /// Retourne l'échantillon stocké (horodatage éventuellement ramené au plus récent).
    pub fn append(&self, host_id: &HostId, sample: Sample) -> CollectorResult<Sample> {
        if &sample.host_id != host_id {
            return Err(CollectorError::InvalidSample(format!(
                "sample for host {} appended to host {}",
                sample.host_id, host_id
            )));
        }
        let slot = self.slot(host_id)?;
        let (stored, evicted) = slot.lock().push(sample, &self.policy);
        if evicted > 0 {
            tracing::debug!(host_id = %host_id, evicted, "[history] evicted samples");
        }
        Ok(stored)
    }

    /// Échantillons du plus récent au plus ancien, filtrés par type et limités.
    /// Un hôte connu sans donnée donne une liste vide, pas une erreur.
    pub fn recent(
        &self,
        host_id: &HostId,
        kind: Option<SampleKind>,
        limit: Option<usize>,
    ) -> CollectorResult<Vec<Sample>> {
        let slot = self.slot(host_id)?;
        let window = slot.lock();
        Ok(window.recent(kind, limit))
    }

    /// Échantillons avec `timestamp >= since`, ordre croissant
    pub fn window(&self, host_id: &HostId, since: OffsetDateTime) -> CollectorResult<Vec<Sample>> {
        let slot = self.slot(host_id)?;
        let window = slot.lock();
        Ok(window.since(since))
    }

    /// Dernier heartbeat et dernière sonde, en O(1)
    pub fn latest(&self, host_id: &HostId) -> CollectorResult<Latest> {
        let slot = self.slot(host_id)?;
        let window = slot.lock();
        Ok(window.latest.clone())
    }

    pub fn len(&self, host_id: &HostId) -> CollectorResult<usize> {
        Ok(self.slot(host_id)?.lock().len())
    }

    pub fn total_samples(&self) -> usize {
        let slots: Vec<SharedWindow> = self.windows.read().values().cloned().collect();
        slots.iter().map(|w| w.lock().len()).sum()
    }

    /// Évince tout ce qui est plus vieux que `now - max_age` dans toutes les fenêtres
    pub fn prune(&self, now: OffsetDateTime) -> usize {
        let cutoff = now - self.policy.max_age;
        let slots: Vec<SharedWindow> = self.windows.read().values().cloned().collect();
        slots
            .iter()
            .map(|w| w.lock().evict(cutoff, self.policy.max_samples))
            .sum()
    }

    /// Copie de tous les échantillons, triés par (hôte, timestamp), pour la persistance
    pub fn export(&self) -> Vec<Sample> {
        let mut slots: Vec<(HostId, SharedWindow)> = self
            .windows
            .read()
            .iter()
            .map(|(id, w)| (id.clone(), w.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
            .into_iter()
            .flat_map(|(_, w)| w.lock().samples.iter().cloned().collect::<Vec<_>>())
            .collect()
    }
}
