/**
 * MODÈLE DE DONNÉES VIGIE - Hôtes, échantillons et états de santé
 *
 * RÔLE : Types partagés par le store, le classifieur, l'agrégateur et l'API.
 *
 * - Host = machine surveillée (identifiant opaque, nom d'affichage, adresse sondée)
 * - Sample = une observation horodatée côté serveur (heartbeat OU résultat de sonde)
 * - Health = état dérivé, jamais stocké (OK < WARN < DOWN)
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifiant stable et opaque d'un hôte (token aléatoire, pas un entier séquentiel)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    /// Génère un nouvel identifiant : UUID v4 en hexadécimal sans tirets
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for HostId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Machine surveillée, créée une seule fois à l'enregistrement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// Libellé d'affichage, ne porte pas l'identité
    pub name: String,
    /// Cible des sondes de joignabilité (IP ou nom DNS), absente = jamais sondé
    pub address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Heartbeat,
    Probe,
}

impl FromStr for SampleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heartbeat" => Ok(SampleKind::Heartbeat),
            "probe" | "ping" => Ok(SampleKind::Probe),
            other => Err(format!("unknown sample kind '{other}'")),
        }
    }
}

/// Charge utile d'un heartbeat agent. Les compteurs réseau sont cumulatifs et
/// peuvent repartir de zéro si l'agent redémarre : on les stocke bruts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

impl HeartbeatMetrics {
    /// Rejette les pourcentages hors [0, 100] ou non finis
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [("cpu_percent", self.cpu_percent), ("mem_percent", self.mem_percent)] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(format!("{field} out of range: {value}"));
            }
        }
        Ok(())
    }
}

/// Résultat d'une sonde de joignabilité
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency_ms: Option<f64>,
}

impl ProbeResult {
    pub fn reachable(latency_ms: Option<f64>) -> Self {
        Self { ok: true, latency_ms }
    }

    pub fn unreachable() -> Self {
        Self { ok: false, latency_ms: None }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.latency_ms {
            Some(ms) if !ms.is_finite() || ms < 0.0 => Err(format!("latency_ms out of range: {ms}")),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    Heartbeat(HeartbeatMetrics),
    Probe(ProbeResult),
}

/// Une observation. Le timestamp est posé par le collecteur à la réception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub host_id: HostId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub signal: Signal,
}

impl Sample {
    pub fn heartbeat(host_id: HostId, timestamp: OffsetDateTime, metrics: HeartbeatMetrics) -> Self {
        Self { host_id, timestamp, signal: Signal::Heartbeat(metrics) }
    }

    pub fn probe(host_id: HostId, timestamp: OffsetDateTime, result: ProbeResult) -> Self {
        Self { host_id, timestamp, signal: Signal::Probe(result) }
    }

    pub fn kind(&self) -> SampleKind {
        match self.signal {
            Signal::Heartbeat(_) => SampleKind::Heartbeat,
            Signal::Probe(_) => SampleKind::Probe,
        }
    }

    pub fn metrics(&self) -> Option<&HeartbeatMetrics> {
        match &self.signal {
            Signal::Heartbeat(m) => Some(m),
            Signal::Probe(_) => None,
        }
    }

    pub fn probe_result(&self) -> Option<&ProbeResult> {
        match &self.signal {
            Signal::Probe(p) => Some(p),
            Signal::Heartbeat(_) => None,
        }
    }
}

/// État de santé dérivé. L'ordre des variantes porte la règle "pire des deux signaux".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Ok,
    Warn,
    Down,
}

impl Health {
    pub fn worst(self, other: Health) -> Health {
        self.max(other)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Health::Ok => "OK",
            Health::Warn => "WARN",
            Health::Down => "DOWN",
        };
        f.write_str(label)
    }
}
