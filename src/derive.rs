//! On-demand projection of cached readings into alerts and aggregates.
//!
//! Derivation is a pure function of its inputs: the reading snapshot, the
//! set of devices reported offline, the mode and "now". Nothing is carried
//! over between calls.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use serde::Serialize;

use crate::models::{Mode, Reading};
use crate::shift::ShiftConfig;

// ---

/// Open-alert cap applied to mock data only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockCap {
    pub enabled: bool,
    pub max_open: usize,
}

impl Default for MockCap {
    fn default() -> Self {
        Self {
            enabled: true,
            max_open: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeriveConfig {
    /// Readings with a value above this open an alert.
    pub value_threshold: f64,
    pub overdue_after: Duration,
    pub mock_cap: MockCap,
    pub default_location: String,
    pub local_offset: FixedOffset,
}

impl Default for DeriveConfig {
    fn default() -> Self {
        Self {
            value_threshold: 70.0,
            overdue_after: Duration::minutes(30),
            mock_cap: MockCap::default(),
            default_location: "Unassigned".to_string(),
            local_offset: ShiftConfig::default().local_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertStatus {
    Open,
    #[serde(rename = "Followed Up")]
    FollowedUp,
}

/// UI-agnostic projection of one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub source_id: String,
    pub area: String,
    pub location: String,
    pub operator: Option<String>,
    pub fatigue_type: Option<String>,
    pub status: AlertStatus,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Local time of day the alert opened.
    pub opened_at: NaiveTime,
    pub within_shift: bool,
    pub origin: Mode,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Set when the mock cap force-resolved this alert.
    pub auto_resolved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStats {
    pub total: usize,
    pub open: usize,
    pub followed_up: usize,
    pub within_shift: usize,
    pub auto_resolved: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaSummary {
    pub area: String,
    pub total: usize,
    pub open: usize,
    pub followed_up: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStat {
    pub area: String,
    pub location: String,
    pub open: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRisk {
    pub operator: String,
    pub events: usize,
    pub open: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRisk {
    pub location: String,
    pub area: String,
    pub open: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueAlert {
    #[serde(flatten)]
    pub alert: Alert,
    pub overdue_minutes: i64,
}

/// Alerts plus every aggregate computed from them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Derived {
    pub alerts: Vec<Alert>,
    pub stats: AlertStats,
    pub area_summary: Vec<AreaSummary>,
    pub location_stats: Vec<LocationStat>,
    pub high_risk_operators: Vec<OperatorRisk>,
    pub high_risk_zones: Vec<ZoneRisk>,
    pub overdue_alerts: Vec<OverdueAlert>,
}

fn explicit_status(status: &str) -> Option<AlertStatus> {
    match status.trim().to_ascii_lowercase().as_str() {
        "open" | "new" | "active" | "unresolved" => Some(AlertStatus::Open),
        "followed up" | "followed_up" | "followedup" | "resolved" | "closed" | "done" => {
            Some(AlertStatus::FollowedUp)
        }
        _ => None,
    }
}

/// Sort `(name, count)` pairs by count descending, then name.
fn ranked<T, F: Fn(&T) -> (usize, &str)>(mut items: Vec<T>, key: F) -> Vec<T> {
    items.sort_by(|a, b| {
        let (ca, na) = key(a);
        let (cb, nb) = key(b);
        cb.cmp(&ca).then_with(|| na.cmp(nb))
    });
    items
}

pub struct AlertDeriver {
    cfg: DeriveConfig,
}

impl AlertDeriver {
    // ---
    pub fn new(cfg: DeriveConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &DeriveConfig {
        &self.cfg
    }

    /// Status resolution order: explicit normalized status, else offline
    /// opens, else a value over the threshold opens, else followed up.
    pub fn resolve_status(&self, reading: &Reading, offline: &HashSet<String>) -> AlertStatus {
        // ---
        if let Some(status) = explicit_status(&reading.status) {
            return status;
        }
        if reading.status == "offline" || offline.contains(&reading.source_id) {
            return AlertStatus::Open;
        }
        match reading.value {
            Some(v) if v > self.cfg.value_threshold => AlertStatus::Open,
            _ => AlertStatus::FollowedUp,
        }
    }

    pub fn derive_alerts(&self, readings: &[Reading], offline: &HashSet<String>) -> Vec<Alert> {
        // ---
        readings
            .iter()
            .map(|r| Alert {
                id: r.identity.clone(),
                source_id: r.source_id.clone(),
                area: r.meta.area.clone(),
                location: r
                    .meta
                    .location
                    .clone()
                    .unwrap_or_else(|| self.cfg.default_location.clone()),
                operator: r.meta.operator.clone(),
                fatigue_type: r.meta.fatigue_type.clone(),
                status: self.resolve_status(r, offline),
                value: r.value,
                timestamp: r.timestamp,
                opened_at: r.timestamp.with_timezone(&self.cfg.local_offset).time(),
                within_shift: r.meta.within_shift,
                origin: r.origin,
                media_url: r.meta.media_url.clone(),
                latitude: r.meta.latitude,
                longitude: r.meta.longitude,
                auto_resolved: false,
            })
            .collect()
    }

    /// Force-resolve the oldest open alerts beyond `max_open`.
    ///
    /// Returns how many alerts were resolved.
    pub fn apply_mock_cap(&self, alerts: &mut [Alert], max_open: usize) -> usize {
        // ---
        let mut open: Vec<usize> = alerts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.status == AlertStatus::Open)
            .map(|(i, _)| i)
            .collect();
        if open.len() <= max_open {
            return 0;
        }
        open.sort_by_key(|&i| alerts[i].timestamp);
        let excess = open.len() - max_open;
        for &i in &open[..excess] {
            alerts[i].status = AlertStatus::FollowedUp;
            alerts[i].auto_resolved = true;
        }
        excess
    }

    /// Open alerts older than the overdue threshold, oldest first.
    ///
    /// Each alert's local open time is placed on today's local date and
    /// diffed against local "now"; negative ages (clock skew, previous day)
    /// clamp to zero.
    pub fn overdue_alerts(&self, alerts: &[Alert], now: DateTime<Utc>) -> Vec<OverdueAlert> {
        // ---
        let now_local = now.with_timezone(&self.cfg.local_offset).naive_local();
        let mut overdue: Vec<OverdueAlert> = alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Open)
            .filter_map(|a| {
                let opened = now_local.date().and_time(a.opened_at);
                let age = (now_local - opened).max(Duration::zero());
                (age > self.cfg.overdue_after).then(|| OverdueAlert {
                    alert: a.clone(),
                    overdue_minutes: age.num_minutes(),
                })
            })
            .collect();
        overdue.sort_by(|a, b| b.overdue_minutes.cmp(&a.overdue_minutes));
        overdue
    }

    /// Alerts and all aggregates for one snapshot.
    pub fn derive(
        &self,
        readings: &[Reading],
        offline: &HashSet<String>,
        mode: Mode,
        now: DateTime<Utc>,
    ) -> Derived {
        // ---
        let mut alerts = self.derive_alerts(readings, offline);
        let cap = self.cfg.mock_cap;
        if mode == Mode::Mock && cap.enabled {
            self.apply_mock_cap(&mut alerts, cap.max_open);
        }
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let is_open = |a: &Alert| a.status == AlertStatus::Open;

        let stats = AlertStats {
            total: alerts.len(),
            open: alerts.iter().filter(|a| is_open(a)).count(),
            followed_up: alerts.iter().filter(|a| !is_open(a)).count(),
            within_shift: alerts.iter().filter(|a| a.within_shift).count(),
            auto_resolved: alerts.iter().filter(|a| a.auto_resolved).count(),
        };

        let mut areas: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        let mut locations: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        let mut operators: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        let mut zones: BTreeMap<&str, (&str, usize)> = BTreeMap::new();

        for alert in &alerts {
            let open = usize::from(is_open(alert));
            let area = areas.entry(alert.area.as_str()).or_default();
            area.0 += 1;
            area.1 += open;

            *locations
                .entry((alert.area.as_str(), alert.location.as_str()))
                .or_default() += open;

            if let Some(name) = alert.operator.as_deref() {
                let op = operators.entry(name).or_default();
                op.0 += 1;
                op.1 += open;
            }

            if open == 1 {
                zones
                    .entry(alert.location.as_str())
                    .or_insert((alert.area.as_str(), 0))
                    .1 += 1;
            }
        }

        let area_summary = areas
            .into_iter()
            .map(|(area, (total, open))| AreaSummary {
                area: area.to_string(),
                total,
                open,
                followed_up: total - open,
            })
            .collect();

        let location_stats = ranked(
            locations
                .into_iter()
                .map(|((area, location), open)| LocationStat {
                    area: area.to_string(),
                    location: location.to_string(),
                    open,
                })
                .collect(),
            |s: &LocationStat| (s.open, s.location.as_str()),
        );

        let high_risk_operators = ranked(
            operators
                .into_iter()
                .filter(|(_, (events, _))| *events > 1)
                .map(|(operator, (events, open))| OperatorRisk {
                    operator: operator.to_string(),
                    events,
                    open,
                })
                .collect(),
            |o: &OperatorRisk| (o.events, o.operator.as_str()),
        );

        let high_risk_zones = ranked(
            zones
                .into_iter()
                .map(|(location, (area, open))| ZoneRisk {
                    location: location.to_string(),
                    area: area.to_string(),
                    open,
                })
                .collect(),
            |z: &ZoneRisk| (z.open, z.location.as_str()),
        );

        let overdue_alerts = self.overdue_alerts(&alerts, now);

        Derived {
            alerts,
            stats,
            area_summary,
            location_stats,
            high_risk_operators,
            high_risk_zones,
            overdue_alerts,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{ReadingMeta, UNKNOWN_STATUS};
    use chrono::TimeZone;

    fn reading(id: &str, minute: u32, status: &str, value: Option<f64>) -> Reading {
        // ---
        // Minutes after 03:00 UTC, i.e. 10:00 local at +07:00.
        let timestamp = Utc.with_ymd_and_hms(2025, 3, 26, 3, minute, 0).unwrap();
        Reading {
            source_id: format!("S-{id}"),
            identity: id.to_string(),
            status: status.to_string(),
            value,
            timestamp,
            received_at: timestamp,
            origin: Mode::Mock,
            meta: ReadingMeta {
                area: "Mining".to_string(),
                ..Default::default()
            },
        }
    }

    fn deriver() -> AlertDeriver {
        AlertDeriver::new(DeriveConfig::default())
    }

    fn local(hour: u32, minute: u32) -> DateTime<Utc> {
        // Local +07:00 wall time on 2025-03-26.
        Utc.with_ymd_and_hms(2025, 3, 26, hour - 7, minute, 0).unwrap()
    }

    #[test]
    fn test_status_resolution_order() {
        // ---
        let d = deriver();
        let none = HashSet::new();

        assert_eq!(d.resolve_status(&reading("a", 0, "Followed Up", Some(99.0)), &none), AlertStatus::FollowedUp);
        assert_eq!(d.resolve_status(&reading("b", 0, "open", Some(1.0)), &none), AlertStatus::Open);
        assert_eq!(d.resolve_status(&reading("c", 0, "offline", None), &none), AlertStatus::Open);
        assert_eq!(d.resolve_status(&reading("d", 0, "online", Some(70.5)), &none), AlertStatus::Open);
        assert_eq!(d.resolve_status(&reading("e", 0, "online", Some(70.0)), &none), AlertStatus::FollowedUp);
        assert_eq!(d.resolve_status(&reading("f", 0, UNKNOWN_STATUS, None), &none), AlertStatus::FollowedUp);

        let offline: HashSet<String> = ["S-g".to_string()].into_iter().collect();
        assert_eq!(d.resolve_status(&reading("g", 0, "online", None), &offline), AlertStatus::Open);
    }

    #[test]
    fn test_mock_cap_resolves_oldest_excess() {
        // ---
        let d = deriver();
        let readings: Vec<Reading> = (0..5)
            .map(|i| reading(&format!("r{i}"), i * 10, "open", None))
            .collect();
        let mut alerts = d.derive_alerts(&readings, &HashSet::new());

        let resolved = d.apply_mock_cap(&mut alerts, 3);

        assert_eq!(resolved, 2);
        for alert in &alerts {
            let oldest = alert.id == "r0" || alert.id == "r1";
            assert_eq!(alert.auto_resolved, oldest);
            let expected = if oldest { AlertStatus::FollowedUp } else { AlertStatus::Open };
            assert_eq!(alert.status, expected);
        }
    }

    #[test]
    fn test_mock_cap_only_in_mock_mode_and_toggleable() {
        // ---
        let readings: Vec<Reading> = (0..5).map(|i| reading(&format!("r{i}"), i, "open", None)).collect();
        let now = local(10, 10);

        let live = deriver().derive(&readings, &HashSet::new(), Mode::Live, now);
        assert_eq!(live.stats.open, 5);

        let mock = deriver().derive(&readings, &HashSet::new(), Mode::Mock, now);
        assert_eq!((mock.stats.open, mock.stats.auto_resolved), (3, 2));

        let disabled = AlertDeriver::new(DeriveConfig {
            mock_cap: MockCap {
                enabled: false,
                max_open: 3,
            },
            ..DeriveConfig::default()
        });
        assert_eq!(disabled.derive(&readings, &HashSet::new(), Mode::Mock, now).stats.open, 5);
    }

    #[test]
    fn test_overdue_threshold() {
        // ---
        let d = deriver();
        let alerts = d.derive_alerts(&[reading("late", 0, "open", None)], &HashSet::new());
        assert_eq!(alerts[0].opened_at, NaiveTime::from_hms_opt(10, 0, 0).unwrap());

        let at_1035 = d.overdue_alerts(&alerts, local(10, 35));
        assert_eq!(at_1035.len(), 1);
        assert_eq!(at_1035[0].overdue_minutes, 35);

        assert!(d.overdue_alerts(&alerts, local(10, 29)).is_empty());
        assert!(d.overdue_alerts(&alerts, local(10, 30)).is_empty());
    }

    #[test]
    fn test_overdue_clamps_negative_age() {
        // ---
        let d = deriver();
        let alerts = d.derive_alerts(&[reading("future", 50, "open", None)], &HashSet::new());
        assert!(d.overdue_alerts(&alerts, local(10, 5)).is_empty());
    }

    #[test]
    fn test_followed_up_alerts_never_overdue() {
        // ---
        let d = deriver();
        let alerts = d.derive_alerts(&[reading("done", 0, "closed", None)], &HashSet::new());
        assert!(d.overdue_alerts(&alerts, local(15, 0)).is_empty());
    }

    #[test]
    fn test_aggregates() {
        // ---
        let mut readings = vec![
            reading("1", 0, "open", None),
            reading("2", 1, "open", None),
            reading("3", 2, "closed", None),
            reading("4", 3, "open", None),
            reading("5", 4, "open", None),
        ];
        let locations = ["Pit A", "Pit A", "Pit A", "Road 3", ""];
        let operators = [Some("Agus"), Some("Agus"), Some("Agus"), Some("Sari"), None];
        for (i, r) in readings.iter_mut().enumerate() {
            r.meta.location = (!locations[i].is_empty()).then(|| locations[i].to_string());
            r.meta.operator = operators[i].map(str::to_string);
        }
        readings[3].meta.area = "Hauling".to_string();

        let derived = deriver().derive(&readings, &HashSet::new(), Mode::Live, local(10, 10));

        assert_eq!(derived.stats.total, 5);
        assert_eq!(derived.stats.open, 4);
        assert_eq!(derived.stats.followed_up, 1);

        assert_eq!(
            derived.area_summary,
            vec![
                AreaSummary { area: "Hauling".into(), total: 1, open: 1, followed_up: 0 },
                AreaSummary { area: "Mining".into(), total: 4, open: 3, followed_up: 1 },
            ]
        );

        assert_eq!(derived.location_stats[0].location, "Pit A");
        assert_eq!(derived.location_stats[0].open, 2);
        assert!(derived.location_stats.iter().any(|s| s.location == "Unassigned" && s.open == 1));

        assert_eq!(derived.high_risk_operators.len(), 1);
        assert_eq!(derived.high_risk_operators[0].operator, "Agus");
        assert_eq!(derived.high_risk_operators[0].events, 3);
        assert_eq!(derived.high_risk_operators[0].open, 2);

        assert_eq!(derived.high_risk_zones[0].location, "Pit A");
        assert_eq!(derived.high_risk_zones[0].open, 2);
        assert_eq!(derived.high_risk_zones.len(), 3);

        // Newest first.
        assert_eq!(derived.alerts[0].id, "5");
    }

    #[test]
    fn test_derivation_is_pure() {
        // ---
        let readings: Vec<Reading> = (0..5).map(|i| reading(&format!("r{i}"), i, "open", None)).collect();
        let d = deriver();
        let now = local(11, 0);
        let first = d.derive(&readings, &HashSet::new(), Mode::Mock, now);
        let second = d.derive(&readings, &HashSet::new(), Mode::Mock, now);
        assert_eq!(first, second);
    }
}
