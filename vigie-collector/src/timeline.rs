/**
 * TIMELINE - Découpage d'une fenêtre d'historique en créneaux fixes
 *
 * RÔLE : Alimente la barre colorée 24h (un créneau de 5 min par défaut = 288 créneaux)
 * et les courbes CPU/RAM moyennées.
 *
 * Chaque créneau est classifié avec les échantillons les plus récents
 * reçus dans le créneau ou avant lui, évalués à la fin du créneau.
 */

use crate::classifier::{self, ClassifierConfig};
use crate::models::{Health, Sample, SampleKind};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineConfig {
    pub bucket: Duration,
    pub resource_points: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::minutes(5),
            resource_points: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSlot {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    /// `None` pour les créneaux antérieurs à l'enregistrement de l'hôte
    pub health: Option<Health>,
    pub heartbeats: u32,
    pub probes: u32,
    pub probes_ok: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourcePoint {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    pub cpu_percent: Option<f32>,
    pub mem_percent: Option<f32>,
}

/// `samples` : ordre croissant, doit couvrir `start - lookback` pour que le
/// premier créneau voie le dernier signal reçu avant lui.
pub fn build_timeline(
    samples: &[Sample],
    registered_at: OffsetDateTime,
    start: OffsetDateTime,
    end: OffsetDateTime,
    bucket: Duration,
    cfg: &ClassifierConfig,
) -> Vec<TimelineSlot> {
    if end <= start || bucket <= Duration::ZERO {
        return Vec::new();
    }

    let mut slots = Vec::new();
    let mut last_heartbeat: Option<&Sample> = None;
    let mut last_probe: Option<&Sample> = None;
    let mut cursor = 0;
    let mut slot_start = start;

    while slot_start < end {
        let slot_end = (slot_start + bucket).min(end);
        let is_last = slot_end == end;
        let mut slot = TimelineSlot {
            start: slot_start,
            end: slot_end,
            health: None,
            heartbeats: 0,
            probes: 0,
            probes_ok: 0,
        };

        while let Some(sample) = samples.get(cursor) {
            let inside = sample.timestamp < slot_end || (is_last && sample.timestamp <= slot_end);
            if !inside {
                break;
            }
            let counted = sample.timestamp >= slot_start;
            match sample.kind() {
                SampleKind::Heartbeat => {
                    last_heartbeat = Some(sample);
                    if counted {
                        slot.heartbeats += 1;
                    }
                }
                SampleKind::Probe => {
                    last_probe = Some(sample);
                    if counted {
                        slot.probes += 1;
                        if sample.probe_result().is_some_and(|p| p.ok) {
                            slot.probes_ok += 1;
                        }
                    }
                }
            }
            cursor += 1;
        }

        if slot_end > registered_at {
            slot.health = Some(classifier::classify(last_heartbeat, last_probe, slot_end, cfg));
        }
        slots.push(slot);
        slot_start = slot_end;
    }

    slots
}

/// Moyennes CPU/RAM des heartbeats par créneau de largeur égale
pub fn build_resource_series(
    samples: &[Sample],
    start: OffsetDateTime,
    end: OffsetDateTime,
    points: usize,
) -> Vec<ResourcePoint> {
    let total_secs = (end - start).whole_seconds();
    if points == 0 || total_secs <= 0 {
        return Vec::new();
    }
    let width_secs = (total_secs / points as i64).max(1);

    // (somme cpu, somme ram, nombre)
    let mut buckets = vec![(0.0f64, 0.0f64, 0u32); points];
    for sample in samples {
        let Some(metrics) = sample.metrics() else { continue };
        if sample.timestamp < start || sample.timestamp > end {
            continue;
        }
        let idx = ((sample.timestamp - start).whole_seconds() / width_secs) as usize;
        let bucket = &mut buckets[idx.min(points - 1)];
        bucket.0 += f64::from(metrics.cpu_percent);
        bucket.1 += f64::from(metrics.mem_percent);
        bucket.2 += 1;
    }

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, (cpu, mem, count))| {
            let average = |sum: f64| (count > 0).then(|| (sum / f64::from(count)) as f32);
            ResourcePoint {
                start: start + Duration::seconds(i as i64 * width_secs),
                cpu_percent: average(cpu),
                mem_percent: average(mem),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HeartbeatMetrics, HostId, ProbeResult};
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2026-03-01 00:00 UTC);

    fn hb(at: OffsetDateTime, cpu: f32) -> Sample {
        Sample::heartbeat(
            HostId::from("h1"),
            at,
            HeartbeatMetrics { cpu_percent: cpu, mem_percent: cpu / 2.0, net_rx_bytes: 0, net_tx_bytes: 0 },
        )
    }

    fn probe(at: OffsetDateTime, ok: bool) -> Sample {
        let result = if ok { ProbeResult::reachable(Some(3.0)) } else { ProbeResult::unreachable() };
        Sample::probe(HostId::from("h1"), at, result)
    }

    #[test]
    fn test_full_day_has_288_slots() {
        let cfg = ClassifierConfig::default();
        let end = START + Duration::hours(24);
        let slots = build_timeline(&[], START, START, end, Duration::minutes(5), &cfg);
        assert_eq!(slots.len(), 288);
        assert!(slots.iter().all(|s| s.health == Some(Health::Down)));
        assert_eq!(slots.last().unwrap().end, end);
    }

    #[test]
    fn test_slots_before_registration_are_unknown() {
        let cfg = ClassifierConfig::default();
        let registered = START + Duration::minutes(12);
        let slots = build_timeline(&[], registered, START, START + Duration::minutes(30), Duration::minutes(5), &cfg);
        let known: Vec<bool> = slots.iter().map(|s| s.health.is_some()).collect();
        assert_eq!(known, vec![false, false, true, true, true, true]);
    }

    #[test]
    fn test_heartbeat_gap_turns_slots_down() {
        let cfg = ClassifierConfig::default();
        let mut samples = Vec::new();
        // heartbeats chaque minute pendant 10 min, puis silence
        for m in 0..10 {
            samples.push(hb(START + Duration::minutes(m), 10.0));
        }
        let slots = build_timeline(&samples, START, START, START + Duration::minutes(20), Duration::minutes(5), &cfg);
        let health: Vec<Option<Health>> = slots.iter().map(|s| s.health).collect();
        assert_eq!(
            health,
            vec![Some(Health::Ok), Some(Health::Ok), Some(Health::Down), Some(Health::Down)]
        );
        assert_eq!(slots[0].heartbeats, 5);
        assert_eq!(slots[2].heartbeats, 0);
    }

    #[test]
    fn test_signal_before_window_is_carried_in() {
        let cfg = ClassifierConfig::default();
        let samples = vec![hb(START - Duration::seconds(30), 10.0)];
        let slots = build_timeline(&samples, START - Duration::hours(1), START, START + Duration::minutes(1), Duration::minutes(1), &cfg);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].health, Some(Health::Ok));
        assert_eq!(slots[0].heartbeats, 0);
    }

    #[test]
    fn test_probe_counts_and_failure() {
        let cfg = ClassifierConfig::default();
        let samples = vec![
            hb(START + Duration::seconds(10), 10.0),
            probe(START + Duration::seconds(20), true),
            probe(START + Duration::seconds(200), false),
        ];
        let slots = build_timeline(&samples, START, START, START + Duration::minutes(5), Duration::minutes(5), &cfg);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].probes, 2);
        assert_eq!(slots[0].probes_ok, 1);
        assert_eq!(slots[0].health, Some(Health::Down));
    }

    #[test]
    fn test_sample_at_window_end_is_in_last_slot() {
        let cfg = ClassifierConfig::default();
        let end = START + Duration::minutes(10);
        let samples = vec![hb(end, 10.0)];
        let slots = build_timeline(&samples, START, START, end, Duration::minutes(5), &cfg);
        assert_eq!(slots[1].heartbeats, 1);
    }

    #[test]
    fn test_resource_series_averages_per_bucket() {
        let samples = vec![
            hb(START + Duration::minutes(1), 10.0),
            hb(START + Duration::minutes(2), 30.0),
            probe(START + Duration::minutes(3), true),
            hb(START + Duration::minutes(25), 80.0),
        ];
        let series = build_resource_series(&samples, START, START + Duration::minutes(30), 3);
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].cpu_percent, Some(20.0));
        assert_eq!(series[0].mem_percent, Some(10.0));
        assert_eq!(series[1].cpu_percent, None);
        assert_eq!(series[2].cpu_percent, Some(80.0));
        assert_eq!(series[2].start, START + Duration::minutes(20));
    }
}
