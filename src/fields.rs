//! Ordered field-resolution rules for heterogeneous upstream payloads.
//!
//! Each concept the pipeline cares about is one [`FieldRule`] listing the
//! candidate paths in priority order. Path segments match object keys
//! case-insensitively with `_` and `-` ignored, so `deviceId`, `device_id`
//! and `DEVICE-ID` all resolve the same field. Dotted paths walk nested
//! objects; numeric segments index arrays (`media.0.url`).

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

// ---

/// A named concept and the ordered paths that may carry it.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub paths: &'static [&'static str],
}

pub const IDENTITY: FieldRule = FieldRule {
    name: "identity",
    paths: &["identity", "event_id", "alarm_id", "uuid", "id"],
};

pub const SOURCE_ID: FieldRule = FieldRule {
    name: "source_id",
    paths: &[
        "device_id",
        "sensor_id",
        "imei",
        "device.device_id",
        "device.imei",
        "device.id",
        "device_no",
        "unit_id",
    ],
};

pub const STATUS: FieldRule = FieldRule {
    name: "status",
    paths: &["alert_status", "status", "state", "device_status"],
};

pub const VALUE: FieldRule = FieldRule {
    name: "value",
    paths: &["value", "fatigue_level", "level", "score"],
};

pub const LOCAL_TIME: FieldRule = FieldRule {
    name: "local_time",
    paths: &["local_time", "time_local", "alarm_time_local", "device_time"],
};

pub const SERVER_TIME: FieldRule = FieldRule {
    name: "server_time",
    paths: &["timestamp", "server_time", "alarm_time", "created_at", "time"],
};

pub const AREA: FieldRule = FieldRule {
    name: "area",
    paths: &["area", "area_name", "zone"],
};

pub const GROUP: FieldRule = FieldRule {
    name: "group",
    paths: &["group_name", "fleet_name", "device_group", "group", "device.group"],
};

pub const LOCATION: FieldRule = FieldRule {
    name: "location",
    paths: &[
        "location",
        "location_name",
        "geofence_name",
        "geofence",
        "geofence.name",
        "site",
    ],
};

pub const OPERATOR: FieldRule = FieldRule {
    name: "operator",
    paths: &["driver_name", "operator_name", "operator", "driver", "driver.name"],
};

pub const FATIGUE_TYPE: FieldRule = FieldRule {
    name: "fatigue_type",
    paths: &["fatigue_type", "alarm_type", "alarm_name", "event_type", "type"],
};

pub const LATITUDE: FieldRule = FieldRule {
    name: "latitude",
    paths: &["latitude", "lat", "gps.lat", "gps.latitude"],
};

pub const LONGITUDE: FieldRule = FieldRule {
    name: "longitude",
    paths: &["longitude", "lng", "lon", "gps.lng", "gps.longitude"],
};

pub const MEDIA_URL: FieldRule = FieldRule {
    name: "media_url",
    paths: &[
        "media_url",
        "image_url",
        "snapshot_url",
        "video_url",
        "attachment_url",
        "media.0.url",
        "media.url",
    ],
};

pub const DEVICE_ONLINE: FieldRule = FieldRule {
    name: "online",
    paths: &["online", "is_online", "status", "state"],
};

pub const DEVICE_NAME: FieldRule = FieldRule {
    name: "device_name",
    paths: &["device_name", "name", "vehicle_name", "plate_no"],
};

pub const LAST_SEEN: FieldRule = FieldRule {
    name: "last_seen",
    paths: &["last_seen", "last_online", "last_update", "updated_at"],
};

pub const ACCESS_TOKEN: FieldRule = FieldRule {
    name: "access_token",
    paths: &["access_token", "token", "data.access_token", "data.token"],
};

// ---

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    // ---
    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => {
                let wanted = fold_key(segment);
                map.iter()
                    .find(|(k, _)| fold_key(k) == wanted)
                    .map(|(_, v)| v)?
            }
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

impl FieldRule {
    /// First non-null, non-empty value among the candidate paths.
    pub fn resolve<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        // ---
        self.paths
            .iter()
            .filter_map(|path| lookup_path(payload, path))
            .find(|v| match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
    }

    /// Resolve as a trimmed string; numbers and booleans are rendered.
    pub fn resolve_str(&self, payload: &Value) -> Option<String> {
        // ---
        match self.resolve(payload)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn resolve_f64(&self, payload: &Value) -> Option<f64> {
        // ---
        let number = match self.resolve(payload)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        number.filter(|v| v.is_finite())
    }

    pub fn resolve_bool(&self, payload: &Value) -> Option<bool> {
        // ---
        match self.resolve(payload)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "online" | "active" | "connected" => Some(true),
                "false" | "0" | "no" | "offline" | "inactive" | "disconnected" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Resolve as an instant. Naive date-times are read in `naive_zone`.
    pub fn resolve_instant(&self, payload: &Value, naive_zone: FixedOffset) -> Option<DateTime<Utc>> {
        self.paths
            .iter()
            .filter_map(|path| lookup_path(payload, path))
            .find_map(|v| decode_instant(v, naive_zone))
    }
}

// ---

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    // ---
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    // Anything past ~2001-09 in milliseconds is > 1e12; seconds stay below.
    let millis = if raw > 1e12 { raw } else { raw * 1000.0 };
    DateTime::from_timestamp_millis(millis as i64)
}

/// Decode one JSON value into a UTC instant.
pub fn decode_instant(value: &Value, naive_zone: FixedOffset) -> Option<DateTime<Utc>> {
    // ---
    match value {
        Value::Number(n) => from_epoch(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(epoch) = s.parse::<f64>() {
                return from_epoch(epoch);
            }
            NAIVE_FORMATS.iter().find_map(|fmt| {
                let naive = NaiveDateTime::parse_from_str(s, fmt).ok()?;
                naive_zone
                    .from_local_datetime(&naive)
                    .single()
                    .map(|dt| dt.with_timezone(&Utc))
            })
        }
        _ => None,
    }
}
