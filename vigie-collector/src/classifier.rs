/**
 * CLASSIFIEUR DE SANTÉ - Fonction pure (dernier heartbeat, dernière sonde, now) -> OK/WARN/DOWN
 *
 * RÈGLES (pire des deux signaux, DOWN > WARN > OK) :
 * - Chemin sonde : sonde trop ancienne = joignabilité inconnue (aucun verdict),
 *   sonde en échec = DOWN, latence au-dessus du seuil = WARN, sinon OK
 * - Chemin heartbeat : aucun heartbeat ou heartbeat plus vieux que le timeout = DOWN, sinon OK
 */

use crate::models::{Health, Sample};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

/// Seuils opérateur du classifieur
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    /// Au-delà, l'agent est considéré interrompu (2x l'intervalle de report par défaut)
    pub heartbeat_timeout: Duration,
    /// Au-delà, la dernière sonde ne dit plus rien (le prober lui-même est peut-être arrêté)
    pub probe_stale_after: Duration,
    pub warn_latency_ms: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::seconds(120),
            probe_stale_after: Duration::seconds(180),
            warn_latency_ms: 300.0,
        }
    }
}

/// Verdict complet : santé combinée + verdict de chaque chemin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub health: Health,
    /// `None` = joignabilité inconnue (jamais sondé ou sonde périmée)
    pub ping: Option<Health>,
    pub heartbeat: Health,
}

pub fn probe_verdict(
    last_probe: Option<&Sample>,
    now: OffsetDateTime,
    cfg: &ClassifierConfig,
) -> Option<Health> {
    let sample = last_probe?;
    let result = sample.probe_result()?;
    if now - sample.timestamp > cfg.probe_stale_after {
        return None;
    }
    if !result.ok {
        return Some(Health::Down);
    }
    match result.latency_ms {
        Some(ms) if ms > cfg.warn_latency_ms => Some(Health::Warn),
        _ => Some(Health::Ok),
    }
}

pub fn heartbeat_verdict(
    last_heartbeat: Option<&Sample>,
    now: OffsetDateTime,
    cfg: &ClassifierConfig,
) -> Health {
    match last_heartbeat {
        Some(sample) if sample.metrics().is_some() && now - sample.timestamp <= cfg.heartbeat_timeout => {
            Health::Ok
        }
        _ => Health::Down,
    }
}

pub fn assess(
    last_heartbeat: Option<&Sample>,
    last_probe: Option<&Sample>,
    now: OffsetDateTime,
    cfg: &ClassifierConfig,
) -> Verdict {
    let ping = probe_verdict(last_probe, now, cfg);
    let heartbeat = heartbeat_verdict(last_heartbeat, now, cfg);
    Verdict {
        health: ping.unwrap_or(Health::Ok).worst(heartbeat),
        ping,
        heartbeat,
    }
}

pub fn classify(
    last_heartbeat: Option<&Sample>,
    last_probe: Option<&Sample>,
    now: OffsetDateTime,
    cfg: &ClassifierConfig,
) -> Health {
    assess(last_heartbeat, last_probe, now, cfg).health
}
