//! Area inference and shift-window membership.
//!
//! Every raw event is assigned an operational area and tested against that
//! area's local time-of-day window. Windows with `start > end` wrap past
//! midnight. Each decision is kept in a bounded ring buffer so operators
//! can see why events were kept or dropped.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Timelike, Utc,
};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::fields;

// ---

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Local time-of-day range, in minutes since midnight, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftWindow {
    pub start: u16,
    pub end: u16,
}

impl ShiftWindow {
    /// The whole day; used when an area has no configured window.
    pub const FULL_DAY: ShiftWindow = ShiftWindow {
        start: 0,
        end: MINUTES_PER_DAY - 1,
    };

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Wraparound-aware membership test.
    pub fn contains(&self, minute: u16) -> bool {
        if self.wraps_midnight() {
            minute >= self.start || minute <= self.end
        } else {
            self.start <= minute && minute <= self.end
        }
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    // ---
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.trim().parse().ok()?;
    let m: u16 = m.trim().parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

fn fmt_hhmm(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

impl FromStr for ShiftWindow {
    type Err = String;

    /// Parse `HH:MM-HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("shift window '{s}' must look like HH:MM-HH:MM"))?;
        let start = parse_hhmm(start).ok_or_else(|| format!("bad start time in '{s}'"))?;
        let end = parse_hhmm(end).ok_or_else(|| format!("bad end time in '{s}'"))?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for ShiftWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", fmt_hhmm(self.start), fmt_hhmm(self.end))
    }
}

impl Serialize for ShiftWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Area names with their windows and the rules used to infer them.
#[derive(Debug, Clone)]
pub struct ShiftConfig {
    // ---
    /// Offset of the operational local clock.
    pub local_offset: FixedOffset,
    pub windows: Vec<(String, ShiftWindow)>,
    pub default_area: String,
    /// `(area, keywords)` matched as substrings of the source group name.
    pub group_keywords: Vec<(String, Vec<String>)>,
    /// `(area, prefixes)` matched against the location name.
    pub location_prefixes: Vec<(String, Vec<String>)>,
    /// `(area, prefixes)` matched against the device id.
    pub device_prefixes: Vec<(String, Vec<String>)>,
    /// Local hour at which the idempotency bucket rolls over.
    pub cutoff_hour: u32,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            local_offset: FixedOffset::east_opt(7 * 3600).unwrap_or(Utc.fix()),
            windows: vec![
                ("Mining".to_string(), ShiftWindow { start: 6 * 60, end: 18 * 60 }),
                ("Hauling".to_string(), ShiftWindow { start: 18 * 60, end: 6 * 60 }),
            ],
            default_area: "Mining".to_string(),
            group_keywords: Vec::new(),
            location_prefixes: Vec::new(),
            device_prefixes: Vec::new(),
            cutoff_hour: 6,
        }
    }
}

impl ShiftConfig {
    // ---
    /// Canonical configured area name for `name`, compared case-insensitively.
    pub fn canonical_area(&self, name: &str) -> Option<&str> {
        self.windows
            .iter()
            .map(|(area, _)| area.as_str())
            .chain(std::iter::once(self.default_area.as_str()))
            .find(|area| area.eq_ignore_ascii_case(name.trim()))
    }

    /// Window for `area`; falls back to the default area's window, then the full day.
    pub fn window_for(&self, area: &str) -> ShiftWindow {
        let find = |name: &str| {
            self.windows
                .iter()
                .find(|(a, _)| a.eq_ignore_ascii_case(name))
                .map(|(_, w)| *w)
        };
        find(area)
            .or_else(|| find(&self.default_area))
            .unwrap_or(ShiftWindow::FULL_DAY)
    }

    pub fn local_now(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.local_offset).naive_local()
    }

    /// Local minutes since midnight for an instant.
    pub fn local_minute(&self, at: DateTime<Utc>) -> u16 {
        let local = at.with_timezone(&self.local_offset);
        (local.hour() * 60 + local.minute()) as u16
    }

    /// Coarse bucket deciding when idempotency tracking resets: the local
    /// calendar date of `now - cutoff_hour`.
    pub fn cutoff_key(&self, now: DateTime<Utc>) -> String {
        let shifted = self.local_now(now) - Duration::hours(i64::from(self.cutoff_hour));
        shifted.date().format("%Y-%m-%d").to_string()
    }

    /// Local time range covering every configured window on `date`.
    ///
    /// Any wrapping window widens the range to the full day.
    pub fn union_range(&self, date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        // ---
        let full_day = (
            date.and_time(NaiveTime::MIN),
            date.and_hms_opt(23, 59, 59).unwrap_or(date.and_time(NaiveTime::MIN)),
        );
        if self.windows.is_empty() || self.windows.iter().any(|(_, w)| w.wraps_midnight()) {
            return full_day;
        }
        let start = self.windows.iter().map(|(_, w)| w.start).min().unwrap_or(0);
        let end = self
            .windows
            .iter()
            .map(|(_, w)| w.end)
            .max()
            .unwrap_or(MINUTES_PER_DAY - 1);
        let at = |minute: u16, second: u32| {
            NaiveTime::from_hms_opt(u32::from(minute / 60), u32::from(minute % 60), second)
                .map(|t| date.and_time(t))
        };
        match (at(start, 0), at(end, 59)) {
            (Some(s), Some(e)) => (s, e),
            _ => full_day,
        }
    }
}

// ---

/// Which rule of the area priority chain produced the area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaRule {
    ExplicitTag,
    GroupKeyword,
    LocationPrefix,
    DevicePrefix,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub area: String,
    pub rule: AreaRule,
    pub window: ShiftWindow,
    /// Best-available event instant (local field preferred).
    pub event_time: Option<DateTime<Utc>>,
    pub local_minute: Option<u16>,
    pub within_shift: bool,
}

/// One retained classification decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRecord {
    pub at: DateTime<Utc>,
    pub source_id: Option<String>,
    pub area: String,
    pub rule: AreaRule,
    pub window: ShiftWindow,
    pub local_minute: Option<u16>,
    pub kept: bool,
    pub reason: &'static str,
}

pub struct ShiftWindowClassifier {
    cfg: ShiftConfig,
    debug: Mutex<VecDeque<ClassificationRecord>>,
    debug_capacity: usize,
}

impl ShiftWindowClassifier {
    // ---
    pub fn new(cfg: ShiftConfig, debug_capacity: usize) -> Self {
        Self {
            cfg,
            debug: Mutex::new(VecDeque::with_capacity(debug_capacity.min(1024))),
            debug_capacity: debug_capacity.max(1),
        }
    }

    pub fn config(&self) -> &ShiftConfig {
        &self.cfg
    }

    fn infer_area(&self, payload: &Value) -> (String, AreaRule) {
        // ---
        if let Some(tag) = fields::AREA.resolve_str(payload) {
            let area = self
                .cfg
                .canonical_area(&tag)
                .map(str::to_string)
                .unwrap_or(tag);
            return (area, AreaRule::ExplicitTag);
        }

        if let Some(group) = fields::GROUP.resolve_str(payload) {
            let group = group.to_lowercase();
            let hit = self.cfg.group_keywords.iter().find(|(_, keywords)| {
                keywords.iter().any(|k| group.contains(&k.to_lowercase()))
            });
            if let Some((area, _)) = hit {
                return (area.clone(), AreaRule::GroupKeyword);
            }
        }

        let prefixed = |value: Option<String>, table: &[(String, Vec<String>)]| {
            let value = value?.to_lowercase();
            table
                .iter()
                .find(|(_, prefixes)| {
                    prefixes
                        .iter()
                        .any(|p| value.starts_with(&p.to_lowercase()))
                })
                .map(|(area, _)| area.clone())
        };

        if let Some(area) = prefixed(fields::LOCATION.resolve_str(payload), &self.cfg.location_prefixes) {
            return (area, AreaRule::LocationPrefix);
        }
        if let Some(area) = prefixed(fields::SOURCE_ID.resolve_str(payload), &self.cfg.device_prefixes) {
            return (area, AreaRule::DevicePrefix);
        }

        (self.cfg.default_area.clone(), AreaRule::Default)
    }

    /// Best-available event instant: the local-clock field wins over the
    /// server/UTC field.
    pub fn event_time(&self, payload: &Value) -> Option<DateTime<Utc>> {
        fields::LOCAL_TIME
            .resolve_instant(payload, self.cfg.local_offset)
            .or_else(|| fields::SERVER_TIME.resolve_instant(payload, Utc.fix()))
    }

    pub fn classify(&self, payload: &Value) -> Classification {
        // ---
        let (area, rule) = self.infer_area(payload);
        let window = self.cfg.window_for(&area);
        let event_time = self.event_time(payload);
        let local_minute = event_time.map(|t| self.cfg.local_minute(t));
        let within_shift = local_minute.is_some_and(|m| window.contains(m));

        let reason = match local_minute {
            None => "missing timestamp",
            Some(_) if within_shift => "inside shift window",
            Some(_) => "outside shift window",
        };
        self.record(ClassificationRecord {
            at: Utc::now(),
            source_id: fields::SOURCE_ID.resolve_str(payload),
            area: area.clone(),
            rule,
            window,
            local_minute,
            kept: within_shift,
            reason,
        });

        Classification {
            area,
            rule,
            window,
            event_time,
            local_minute,
            within_shift,
        }
    }

    fn record(&self, entry: ClassificationRecord) {
        let mut ring = self.debug.lock();
        while ring.len() >= self.debug_capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Retained decisions, oldest first.
    pub fn recent_decisions(&self) -> Vec<ClassificationRecord> {
        self.debug.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn window(s: &str) -> ShiftWindow {
        s.parse().unwrap()
    }

    fn config() -> ShiftConfig {
        ShiftConfig {
            group_keywords: vec![("Hauling".to_string(), vec!["haul".to_string()])],
            location_prefixes: vec![("Mining".to_string(), vec!["PIT".to_string()])],
            device_prefixes: vec![("Hauling".to_string(), vec!["HT-".to_string()])],
            ..ShiftConfig::default()
        }
    }

    #[test]
    fn test_wrapping_window_membership() {
        // ---
        let night = window("22:00-06:00");
        assert!(night.wraps_midnight());
        assert!(night.contains(23 * 60));
        assert!(night.contains(5 * 60));
        assert!(night.contains(22 * 60));
        assert!(night.contains(6 * 60));
        assert!(!night.contains(12 * 60));
        assert!(!night.contains(6 * 60 + 1));
    }

    #[test]
    fn test_plain_window_membership() {
        // ---
        let day = window("06:00-18:00");
        assert!(!day.wraps_midnight());
        assert!(day.contains(6 * 60));
        assert!(day.contains(18 * 60));
        assert!(day.contains(12 * 60));
        assert!(!day.contains(18 * 60 + 1));
        assert!(!day.contains(0));
    }

    #[test]
    fn test_window_parse_and_display() {
        // ---
        assert_eq!(window("7:05-19:30").to_string(), "07:05-19:30");
        assert!("25:00-06:00".parse::<ShiftWindow>().is_err());
        assert!("06:00".parse::<ShiftWindow>().is_err());
    }

    #[test]
    fn test_area_priority_chain() {
        // ---
        let c = ShiftWindowClassifier::new(config(), 16);

        let explicit = json!({"area": "hauling", "group_name": "Mine fleet", "device_id": "HT-1"});
        let by_group = json!({"group_name": "Haul Road 3", "location": "PIT-2"});
        let by_location = json!({"location": "pit-2 north", "device_id": "HT-9"});
        let by_device = json!({"device_id": "ht-9"});
        let fallback = json!({"device_id": "X-1"});

        assert_eq!(c.classify(&explicit).area, "Hauling");
        assert_eq!(c.classify(&explicit).rule, AreaRule::ExplicitTag);
        assert_eq!(c.classify(&by_group).rule, AreaRule::GroupKeyword);
        assert_eq!(c.classify(&by_location).area, "Mining");
        assert_eq!(c.classify(&by_location).rule, AreaRule::LocationPrefix);
        assert_eq!(c.classify(&by_device).area, "Hauling");
        assert_eq!(c.classify(&by_device).rule, AreaRule::DevicePrefix);
        assert_eq!(c.classify(&fallback).area, "Mining");
        assert_eq!(c.classify(&fallback).rule, AreaRule::Default);
    }

    #[test]
    fn test_local_time_field_wins_over_server_time() {
        // ---
        let c = ShiftWindowClassifier::new(config(), 16);
        // Local 10:00 at +07:00 is inside Mining's day shift; the server
        // field (20:00 UTC = 03:00 local) would be outside it.
        let payload = json!({
            "device_id": "D1",
            "local_time": "2025-03-26 10:00:00",
            "server_time": "2025-03-26T20:00:00Z"
        });
        let result = c.classify(&payload);
        assert_eq!(result.local_minute, Some(10 * 60));
        assert!(result.within_shift);
    }

    #[test]
    fn test_server_time_converted_to_local_clock() {
        // ---
        let c = ShiftWindowClassifier::new(config(), 16);
        // 16:30 UTC = 23:30 local: inside Hauling's wrapping night shift.
        let payload = json!({"device_id": "HT-4", "timestamp": "2025-03-26T16:30:00Z"});
        let result = c.classify(&payload);
        assert_eq!(result.area, "Hauling");
        assert_eq!(result.local_minute, Some(23 * 60 + 30));
        assert!(result.within_shift);
    }

    #[test]
    fn test_missing_timestamp_is_not_within_shift() {
        // ---
        let c = ShiftWindowClassifier::new(config(), 16);
        let result = c.classify(&json!({"device_id": "D1"}));
        assert!(!result.within_shift);
        assert_eq!(c.recent_decisions()[0].reason, "missing timestamp");
    }

    #[test]
    fn test_debug_ring_is_bounded() {
        // ---
        let c = ShiftWindowClassifier::new(config(), 3);
        for i in 0..5 {
            c.classify(&json!({"device_id": format!("D{i}")}));
        }
        let recent = c.recent_decisions();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].source_id.as_deref(), Some("D2"));
        assert_eq!(recent[2].source_id.as_deref(), Some("D4"));
    }

    #[test]
    fn test_union_range() {
        // ---
        let date = NaiveDate::from_ymd_opt(2025, 3, 26).unwrap();
        let (start, end) = config().union_range(date);
        assert_eq!(start.to_string(), "2025-03-26 00:00:00");
        assert_eq!(end.to_string(), "2025-03-26 23:59:59");

        let day_only = ShiftConfig {
            windows: vec![
                ("A".to_string(), window("07:00-15:00")),
                ("B".to_string(), window("06:30-12:00")),
            ],
            ..ShiftConfig::default()
        };
        let (start, end) = day_only.union_range(date);
        assert_eq!(start.to_string(), "2025-03-26 06:30:00");
        assert_eq!(end.to_string(), "2025-03-26 15:00:59");
    }

    #[test]
    fn test_cutoff_key_rolls_at_cutoff_hour() {
        // ---
        let cfg = config();
        // 22:59 UTC on the 25th = 05:59 local on the 26th: still the 25th's cycle.
        let before = Utc.with_ymd_and_hms(2025, 3, 25, 22, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 25, 23, 0, 0).unwrap();
        assert_eq!(cfg.cutoff_key(before), "2025-03-25");
        assert_eq!(cfg.cutoff_key(after), "2025-03-26");
    }
}
