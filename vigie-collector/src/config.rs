use crate::classifier::ClassifierConfig;
use crate::history::RetentionPolicy;
use crate::timeline::TimelineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_MQTT_TOPIC: &str = "vigie/hosts/heartbeat@v1";

/// Borne haute de toutes les durées en secondes (10 ans)
const MAX_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub api_key: Option<String>,
    pub retention: RetentionConf,
    pub classifier: ClassifierConf,
    pub prober: ProberConf,
    pub timeline: TimelineConf,
    pub persist: PersistConf,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetentionConf {
    pub max_age_secs: u64,
    pub max_samples: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClassifierConf {
    pub heartbeat_timeout_secs: u64,
    pub probe_stale_secs: u64,
    pub warn_latency_ms: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProberConf {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TimelineConf {
    pub bucket_secs: u64,
    pub resource_points: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PersistConf {
    pub snapshot_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
}

fn default_mqtt_topic() -> String {
    DEFAULT_MQTT_TOPIC.to_string()
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("./data"),
            api_key: None,
            retention: RetentionConf::default(),
            classifier: ClassifierConf::default(),
            prober: ProberConf::default(),
            timeline: TimelineConf::default(),
            persist: PersistConf::default(),
            mqtt: None,
        }
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self { max_age_secs: 24 * 3600, max_samples: 4096 }
    }
}

impl Default for ClassifierConf {
    fn default() -> Self {
        // heartbeat attendu toutes les 60s : timeout à 2x
        Self { heartbeat_timeout_secs: 120, probe_stale_secs: 180, warn_latency_ms: 300.0 }
    }
}

impl Default for ProberConf {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 60, timeout_secs: 3 }
    }
}

impl Default for TimelineConf {
    fn default() -> Self {
        Self { bucket_secs: 300, resource_points: 60 }
    }
}

impl Default for PersistConf {
    fn default() -> Self {
        Self { snapshot_interval_secs: 300 }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secs = [
            ("retention.max_age_secs", self.retention.max_age_secs),
            ("classifier.heartbeat_timeout_secs", self.classifier.heartbeat_timeout_secs),
            ("classifier.probe_stale_secs", self.classifier.probe_stale_secs),
            ("prober.interval_secs", self.prober.interval_secs),
            ("prober.timeout_secs", self.prober.timeout_secs),
            ("timeline.bucket_secs", self.timeline.bucket_secs),
            ("persist.snapshot_interval_secs", self.persist.snapshot_interval_secs),
        ];
        if let Some((name, value)) = secs.into_iter().find(|(_, value)| *value > MAX_SECS) {
            return Err(ConfigError::Invalid(format!("{name} too large: {value} (max {MAX_SECS})")));
        }
        let non_zero = [
            ("retention.max_age_secs", self.retention.max_age_secs),
            ("retention.max_samples", self.retention.max_samples as u64),
            ("classifier.heartbeat_timeout_secs", self.classifier.heartbeat_timeout_secs),
            ("classifier.probe_stale_secs", self.classifier.probe_stale_secs),
            ("prober.interval_secs", self.prober.interval_secs),
            ("prober.timeout_secs", self.prober.timeout_secs),
            ("timeline.bucket_secs", self.timeline.bucket_secs),
            ("timeline.resource_points", self.timeline.resource_points as u64),
            ("persist.snapshot_interval_secs", self.persist.snapshot_interval_secs),
        ];
        if let Some((name, _)) = non_zero.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if !self.classifier.warn_latency_ms.is_finite() || self.classifier.warn_latency_ms <= 0.0 {
            return Err(ConfigError::Invalid("classifier.warn_latency_ms must be a positive number".into()));
        }
        if self.prober.timeout_secs > self.prober.interval_secs {
            return Err(ConfigError::Invalid(
                "prober.timeout_secs must not exceed prober.interval_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: time::Duration::seconds(self.retention.max_age_secs as i64),
            max_samples: self.retention.max_samples,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            heartbeat_timeout: time::Duration::seconds(self.classifier.heartbeat_timeout_secs as i64),
            probe_stale_after: time::Duration::seconds(self.classifier.probe_stale_secs as i64),
            warn_latency_ms: self.classifier.warn_latency_ms,
        }
    }

    pub fn timeline_config(&self) -> TimelineConfig {
        TimelineConfig {
            bucket: time::Duration::seconds(self.timeline.bucket_secs as i64),
            resource_points: self.timeline.resource_points,
        }
    }

    /// Clé API effective : variable d'environnement prioritaire sur le fichier
    pub fn effective_api_key(&self) -> Option<String> {
        std::env::var("VIGIE_API_KEY")
            .ok()
            .or_else(|| self.api_key.clone())
            .filter(|k| !k.is_empty())
    }
}

pub fn parse_config(txt: &str) -> Result<CollectorConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(CollectorConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> CollectorConfig {
    let path = std::env::var("VIGIE_CONFIG").unwrap_or_else(|_| "collector.yaml".into());
    load_config_from(Path::new(&path)).await
}

/// Fichier absent ou invalide : configuration par défaut
pub async fn load_config_from(path: &Path) -> CollectorConfig {
    if !path.exists() {
        info!(path = %path.display(), "[config] no config file, using defaults");
        return CollectorConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "[config] unreadable config, using defaults");
            return CollectorConfig::default();
        }
    };
    parse_config(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "[config] invalid config, using defaults");
        CollectorConfig::default()
    })
}
