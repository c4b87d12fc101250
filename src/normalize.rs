//! Maps heterogeneous upstream and mock payloads onto [`Reading`].
//!
//! Normalization is total: malformed or partial payloads degrade to
//! defaults (status `unknown`, no value, default area) and never fail.

use std::sync::Arc;

use chrono::SecondsFormat;

use crate::fields;
use crate::models::{RawEvent, Reading, ReadingMeta, UNKNOWN_STATUS};
use crate::shift::{Classification, ShiftWindowClassifier};

// ---

/// Source id used when a payload names no device at all.
pub const UNKNOWN_SOURCE: &str = "unknown";

pub struct EventNormalizer {
    classifier: Arc<ShiftWindowClassifier>,
}

impl EventNormalizer {
    // ---
    pub fn new(classifier: Arc<ShiftWindowClassifier>) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &ShiftWindowClassifier {
        &self.classifier
    }

    pub fn normalize(&self, raw: &RawEvent) -> Reading {
        let classification = self.classifier.classify(&raw.payload);
        self.normalize_classified(raw, classification)
    }

    /// Build a reading from an already-classified event.
    pub fn normalize_classified(&self, raw: &RawEvent, class: Classification) -> Reading {
        // ---
        let payload = &raw.payload;
        let source_id =
            fields::SOURCE_ID.resolve_str(payload).unwrap_or_else(|| UNKNOWN_SOURCE.to_string());
        let timestamp = class.event_time.unwrap_or(raw.received_at);
        let identity = fields::IDENTITY.resolve_str(payload).unwrap_or_else(|| {
            format!(
                "{}|{}",
                source_id,
                timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
            )
        });
        let status = fields::STATUS
            .resolve_str(payload)
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string());

        Reading {
            source_id,
            identity,
            status,
            value: fields::VALUE.resolve_f64(payload),
            timestamp,
            received_at: raw.received_at,
            origin: raw.origin,
            meta: ReadingMeta {
                area: class.area,
                location: fields::LOCATION.resolve_str(payload),
                operator: fields::OPERATOR.resolve_str(payload),
                fatigue_type: fields::FATIGUE_TYPE.resolve_str(payload),
                latitude: fields::LATITUDE.resolve_f64(payload),
                longitude: fields::LONGITUDE.resolve_f64(payload),
                media_url: fields::MEDIA_URL.resolve_str(payload),
                within_shift: class.within_shift,
            },
        }
    }
}
