//! Synthetic payloads for mock mode.
//!
//! Entropy comes from v4 UUIDs, which double as the event identity. The
//! payload shape mirrors the live integrator closely enough that the same
//! normalizer handles both.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::models::{DeviceHealth, Mode, RawEvent};

// ---

const LOCATIONS: &[&str] = &["PIT-1 North", "PIT-2 South", "Haul Road KM3", "Crusher Bay", "ROM Pad"];
const OPERATORS: &[&str] = &["Agus", "Budi", "Sari", "Dewi", "Rudi", "Wayan"];
const FATIGUE_TYPES: &[&str] = &["Eyes Closed", "Yawning", "Distraction", "Phone Use", "No Face"];

fn pick<'a>(options: &[&'a str], entropy: u128, shift: u32) -> &'a str {
    let idx = ((entropy >> shift) % options.len() as u128) as usize;
    options[idx]
}

/// One synthetic event per source id, stamped `now`.
pub(super) fn synthesize_events(source_ids: &[String], now: DateTime<Utc>) -> Vec<RawEvent> {
    // ---
    source_ids
        .iter()
        .map(|source_id| {
            let id = Uuid::new_v4();
            let entropy = id.as_u128();
            let value = (entropy % 1_000) as f64 / 10.0;
            let status = match (entropy >> 12) % 10 {
                0 => "offline",
                _ => "online",
            };
            let payload = json!({
                "id": id.to_string(),
                "device_id": source_id,
                "status": status,
                "value": value,
                "timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "location": pick(LOCATIONS, entropy, 20),
                "driver_name": pick(OPERATORS, entropy, 28),
                "alarm_type": pick(FATIGUE_TYPES, entropy, 36),
                "lat": -2.5 - ((entropy >> 44) % 100) as f64 / 1_000.0,
                "lng": 115.4 + ((entropy >> 52) % 100) as f64 / 1_000.0,
            });
            RawEvent::new(payload, Mode::Mock, now)
        })
        .collect()
}

/// Every configured source reported online.
pub(super) fn synthesize_devices(source_ids: &[String]) -> Vec<DeviceHealth> {
    let seen = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    source_ids
        .iter()
        .map(|id| DeviceHealth {
            device_id: id.clone(),
            name: None,
            online: true,
            last_seen: Some(seen.clone()),
        })
        .collect()
}
