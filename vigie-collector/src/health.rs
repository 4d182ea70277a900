use crate::aggregator::Aggregator;
use crate::prober::CycleReport;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

/// Santé du collecteur lui-même (pas celle des hôtes surveillés)
#[derive(Debug, Serialize)]
pub struct CollectorHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: usize,
    pub samples_retained: usize,
    pub memory_usage_mb: Option<f32>,
    pub last_probe_cycle: Option<ProbeCycleInfo>,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeCycleInfo {
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub probed: usize,
    pub reachable: usize,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
    last_cycle: Arc<Mutex<Option<ProbeCycleInfo>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
            last_cycle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn record_probe_cycle(&self, report: &CycleReport) {
        *self.last_cycle.lock() = Some(ProbeCycleInfo {
            finished_at: OffsetDateTime::now_utc(),
            probed: report.probed,
            reachable: report.reachable,
            duration_ms: report.elapsed.as_millis() as u64,
        });
    }

    pub fn last_probe_cycle(&self) -> Option<ProbeCycleInfo> {
        *self.last_cycle.lock()
    }

    pub fn get_health(&self, aggregator: &Aggregator) -> CollectorHealth {
        CollectorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: aggregator.host_count(),
            samples_retained: aggregator.sample_count(),
            memory_usage_mb: get_memory_usage_mb(),
            last_probe_cycle: self.last_probe_cycle(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// RSS du process lu dans /proc (Linux uniquement)
fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierConfig;
    use crate::history::RetentionPolicy;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_reports_fleet_size_and_cycle() {
        let aggregator = Aggregator::new(RetentionPolicy::default(), ClassifierConfig::default());
        aggregator.register_host("web-01", None).await.unwrap();
        let tracker = HealthTracker::new();

        let before = tracker.get_health(&aggregator);
        assert_eq!(before.hosts_tracked, 1);
        assert_eq!(before.samples_retained, 0);
        assert!(before.last_probe_cycle.is_none());
        assert_eq!(before.mqtt_status, "disabled");

        tracker.record_probe_cycle(&CycleReport { probed: 3, reachable: 2, elapsed: Duration::from_millis(1500) });
        tracker.increment_reconnects();
        let after = tracker.get_health(&aggregator);
        let cycle = after.last_probe_cycle.unwrap();
        assert_eq!((cycle.probed, cycle.reachable, cycle.duration_ms), (3, 2, 1500));
        assert_eq!(after.mqtt_status, "reconnecting");
        assert_eq!(after.mqtt_reconnects, 1);
    }
}
