//! Data models for the fatigue telemetry pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ---

/// Status assigned when the upstream payload carries none.
pub const UNKNOWN_STATUS: &str = "unknown";

/// Operating mode of the upstream side; also the provenance of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Mock,
    Live,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Mock => "mock",
            Mode::Live => "live",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            other => Err(format!("unknown mode '{other}' (expected mock|live)")),
        }
    }
}

/// Opaque upstream payload as received. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    // ---
    pub payload: Value,
    pub origin: Mode,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    // ---
    pub fn new(payload: Value, origin: Mode, received_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            origin,
            received_at,
        }
    }

    /// SHA-256 hex digest of the compact JSON rendering of the payload.
    ///
    /// Object keys serialize in sorted order, so two payloads with the same
    /// fields hash identically regardless of the order they arrived in.
    pub fn content_hash(&self) -> String {
        // ---
        let rendered = serde_json::to_string(&self.payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(rendered.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Descriptive attributes carried alongside a reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingMeta {
    // ---
    pub area: String,
    pub location: Option<String>,
    pub operator: Option<String>,
    pub fatigue_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub media_url: Option<String>,
    pub within_shift: bool,
}

/// Canonical normalized unit; one per raw event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    // ---
    pub source_id: String,
    /// Deduplication key: explicit upstream identity, else `source_id|timestamp`.
    pub identity: String,
    pub status: String,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub origin: Mode,
    pub meta: ReadingMeta,
}

impl Reading {
    // ---
    pub fn has_status(&self) -> bool {
        self.status != UNKNOWN_STATUS
    }

    /// Merge `newer` over `self`, keeping prior values for every field the
    /// newer reading omits.
    pub fn merged_with(&self, newer: Reading) -> Reading {
        // ---
        let status = if newer.has_status() {
            newer.status
        } else {
            self.status.clone()
        };
        let prev = &self.meta;
        let meta = ReadingMeta {
            area: if newer.meta.area.is_empty() {
                prev.area.clone()
            } else {
                newer.meta.area
            },
            location: newer.meta.location.or_else(|| prev.location.clone()),
            operator: newer.meta.operator.or_else(|| prev.operator.clone()),
            fatigue_type: newer
                .meta
                .fatigue_type
                .or_else(|| prev.fatigue_type.clone()),
            latitude: newer.meta.latitude.or(prev.latitude),
            longitude: newer.meta.longitude.or(prev.longitude),
            media_url: newer.meta.media_url.or_else(|| prev.media_url.clone()),
            within_shift: newer.meta.within_shift,
        };

        Reading {
            source_id: newer.source_id,
            identity: newer.identity,
            status,
            value: newer.value.or(self.value),
            timestamp: newer.timestamp,
            received_at: newer.received_at,
            origin: newer.origin,
            meta,
        }
    }
}

/// Online/offline state of a single upstream device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    pub device_id: String,
    pub name: Option<String>,
    pub online: bool,
    pub last_seen: Option<String>,
}
