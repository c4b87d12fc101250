//! Periodic persistence of the cached snapshot into the durable store.
//!
//! Three phases per pass: the primary readings table (fixed schema, bulk
//! insert), the raw audit table and the enriched history table (both
//! introspected at runtime). A table whose columns cannot be read is skipped
//! and reported through [`SchemaHealth`]; it never fails the pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{BoundedKeySet, StateCaches, DEFAULT_PERSISTED_CAPACITY};
use crate::error::StoreError;
use crate::models::{RawEvent, Reading};
use crate::shift::ShiftConfig;

// ---

pub const RAW_EVENTS_TABLE: &str = "fatigue_raw_events";
pub const HISTORY_TABLE: &str = "fatigue_event_history";

const RAW_COLUMNS: &[&str] = &["content_hash", "origin", "payload", "received_at"];

const HISTORY_COLUMNS: &[&str] = &[
    "identity",
    "snapshot_key",
    "source_id",
    "status",
    "value",
    "shift_label",
    "shift_window",
    "within_shift",
    "event_time_utc",
    "event_time_local",
    "origin",
    "raw_meta",
    "recorded_at",
];

/// A single bindable column value for dynamically shaped rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    Float(Option<f64>),
    Bool(bool),
    Timestamp(Option<DateTime<Utc>>),
    Json(Value),
}

/// Durable sink for readings and introspected audit rows.
pub trait Store: Send + Sync {
    /// Bulk insert into the primary readings table; returns rows written.
    fn insert_readings(
        &self,
        readings: &[Reading],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Column names of `table`, empty when the table does not exist.
    fn table_columns(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Insert one row, ignoring unique conflicts. Returns `true` if a row was written.
    fn insert_row(
        &self,
        table: &str,
        row: &[(String, ColumnValue)],
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

impl<S: Store> Store for Arc<S> {
    fn insert_readings(
        &self,
        readings: &[Reading],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send {
        (**self).insert_readings(readings)
    }

    fn table_columns(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send {
        (**self).table_columns(table)
    }

    fn insert_row(
        &self,
        table: &str,
        row: &[(String, ColumnValue)],
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        (**self).insert_row(table, row)
    }
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub persisted_capacity: usize,
    pub raw_table: String,
    pub history_table: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            persisted_capacity: DEFAULT_PERSISTED_CAPACITY,
            raw_table: RAW_EVENTS_TABLE.to_string(),
            history_table: HISTORY_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistReport {
    pub inserted: u64,
    pub raw_inserted: u64,
    pub history_inserted: u64,
    /// Readings already persisted in the current shift cycle.
    pub skipped: usize,
}

/// Availability of one introspected table as of its last check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaHealth {
    pub table: String,
    pub available: bool,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Idempotency {
    persisted: BoundedKeySet,
    cutoff_key: Option<String>,
}

pub struct PersistenceWriter<S> {
    store: S,
    shift: ShiftConfig,
    cfg: PersistConfig,
    idempotency: Mutex<Idempotency>,
    columns: RwLock<HashMap<String, Vec<String>>>,
    warned: Mutex<HashSet<String>>,
    schema: RwLock<BTreeMap<String, SchemaHealth>>,
}

impl<S: Store> PersistenceWriter<S> {
    // ---
    pub fn new(store: S, shift: ShiftConfig, cfg: PersistConfig) -> Self {
        Self {
            store,
            shift,
            idempotency: Mutex::new(Idempotency {
                persisted: BoundedKeySet::new(cfg.persisted_capacity),
                cutoff_key: None,
            }),
            cfg,
            columns: RwLock::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
            schema: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn schema_health(&self) -> Vec<SchemaHealth> {
        self.schema.read().values().cloned().collect()
    }

    pub fn persisted_count(&self) -> usize {
        self.idempotency.lock().persisted.len()
    }

    /// Persist every not-yet-persisted reading of the current snapshot.
    ///
    /// Only a failure of the primary insert is returned as an error; audit
    /// and history phases degrade to zero counts.
    pub async fn persist_snapshot(
        &self,
        caches: &StateCaches,
        now: DateTime<Utc>,
    ) -> Result<PersistReport, StoreError> {
        // ---
        let snapshot_key = self.shift.cutoff_key(now);
        let (pending, skipped) = {
            let mut state = self.idempotency.lock();
            if state.cutoff_key.as_deref() != Some(snapshot_key.as_str()) {
                if let Some(previous) = state.cutoff_key.replace(snapshot_key.clone()) {
                    info!(from = %previous, to = %snapshot_key, "shift cycle rolled over, idempotency set reset");
                }
                state.persisted.clear();
            }

            let readings = caches.snapshot().readings;
            let total = readings.len();
            let mut seen = HashSet::new();
            let pending: Vec<Reading> = readings
                .into_iter()
                .filter(|r| !state.persisted.contains(&r.identity))
                .filter(|r| seen.insert(r.identity.clone()))
                .collect();
            let skipped = total - pending.len();
            (pending, skipped)
        };

        let mut report = PersistReport {
            skipped,
            ..PersistReport::default()
        };

        if !pending.is_empty() {
            report.inserted = self.store.insert_readings(&pending).await?;
        }

        report.raw_inserted = self.persist_raw(caches).await;
        report.history_inserted = self.persist_history(&pending, &snapshot_key, now).await;

        {
            let mut state = self.idempotency.lock();
            for reading in &pending {
                state.persisted.insert(reading.identity.clone());
            }
        }

        debug!(
            inserted = report.inserted,
            raw_inserted = report.raw_inserted,
            history_inserted = report.history_inserted,
            skipped = report.skipped,
            "persist pass finished"
        );
        Ok(report)
    }

    async fn persist_raw(&self, caches: &StateCaches) -> u64 {
        // ---
        if caches.raw.is_empty() {
            return 0;
        }
        let table = self.cfg.raw_table.as_str();
        let Some(columns) = self.usable_columns(table, RAW_COLUMNS).await else {
            return 0;
        };

        let mode = caches.mode();
        let mut pending = caches.raw.drain().into_iter();
        let mut inserted = 0;
        while let Some(raw) = pending.next() {
            let row = project(&columns, raw_row(&raw));
            match self.insert_one(table, &row).await {
                Ok(written) => inserted += u64::from(written),
                Err(_) => {
                    let requeued = caches
                        .with_mode(mode, |c| c.raw.requeue_front(std::iter::once(raw).chain(pending)));
                    if requeued.is_none() {
                        debug!("mode switched during raw persistence, unwritten payloads discarded");
                    }
                    break;
                }
            }
        }
        inserted
    }

    async fn persist_history(&self, readings: &[Reading], snapshot_key: &str, now: DateTime<Utc>) -> u64 {
        // ---
        if readings.is_empty() {
            return 0;
        }
        let table = self.cfg.history_table.as_str();
        let Some(columns) = self.usable_columns(table, HISTORY_COLUMNS).await else {
            return 0;
        };

        let mut inserted = 0;
        for reading in readings {
            let row = project(&columns, self.history_row(reading, snapshot_key, now));
            if let Ok(written) = self.insert_one(table, &row).await {
                inserted += u64::from(written);
            }
        }
        inserted
    }

    /// Insert one audit row, keeping the table's health entry current. A
    /// failure drops the cached columns so the next pass introspects again.
    async fn insert_one(&self, table: &str, row: &[(String, ColumnValue)]) -> Result<bool, StoreError> {
        // ---
        match self.store.insert_row(table, row).await {
            Ok(written) => {
                let stale = self.schema.read().get(table).is_some_and(|h| !h.available);
                if stale {
                    info!(table, "audit inserts succeeding again");
                    self.record_schema(table, true, None);
                }
                Ok(written)
            }
            Err(e) => {
                warn!(table, error = %e, "audit row insert failed");
                self.columns.write().remove(table);
                self.record_schema(table, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Columns of `table` when at least one of `wanted` is among them.
    async fn usable_columns(&self, table: &str, wanted: &[&str]) -> Option<Vec<String>> {
        // ---
        let columns = self.columns_for(table).await?;
        if wanted
            .iter()
            .any(|w| columns.iter().any(|c| c.eq_ignore_ascii_case(w)))
        {
            return Some(columns);
        }
        if self.warned.lock().insert(table.to_string()) {
            warn!(table, "table has none of the expected columns, insert phase skipped");
        }
        self.columns.write().remove(table);
        self.record_schema(table, false, Some("no matching columns".to_string()));
        None
    }

    /// Cached column list for `table`; `None` when the table is unusable.
    async fn columns_for(&self, table: &str) -> Option<Vec<String>> {
        // ---
        if let Some(columns) = self.columns.read().get(table) {
            return Some(columns.clone());
        }

        let failure = match self.store.table_columns(table).await {
            Ok(columns) if !columns.is_empty() => {
                if self.warned.lock().remove(table) {
                    info!(table, "table metadata readable again");
                }
                self.columns.write().insert(table.to_string(), columns.clone());
                self.record_schema(table, true, None);
                return Some(columns);
            }
            Ok(_) => StoreError::SchemaUnavailable {
                table: table.to_string(),
                reason: "no columns".to_string(),
            },
            Err(e) => e,
        };

        if self.warned.lock().insert(table.to_string()) {
            warn!(table, error = %failure, "table metadata unavailable, insert phase skipped");
        }
        self.record_schema(table, false, Some(failure.to_string()));
        None
    }

    fn record_schema(&self, table: &str, available: bool, last_error: Option<String>) {
        self.schema.write().insert(
            table.to_string(),
            SchemaHealth {
                table: table.to_string(),
                available,
                last_error,
                checked_at: Utc::now(),
            },
        );
    }

    fn history_row(&self, reading: &Reading, snapshot_key: &str, now: DateTime<Utc>) -> Vec<(String, ColumnValue)> {
        // ---
        let local = reading
            .timestamp
            .with_timezone(&self.shift.local_offset)
            .to_rfc3339_opts(SecondsFormat::Secs, false);
        let window = self.shift.window_for(&reading.meta.area);
        let meta = serde_json::to_value(&reading.meta).unwrap_or(Value::Null);

        vec![
            text("identity", &reading.identity),
            text("snapshot_key", snapshot_key),
            text("source_id", &reading.source_id),
            text("status", &reading.status),
            ("value".to_string(), ColumnValue::Float(reading.value)),
            text("shift_label", &reading.meta.area),
            text("shift_window", &window.to_string()),
            ("within_shift".to_string(), ColumnValue::Bool(reading.meta.within_shift)),
            ("event_time_utc".to_string(), ColumnValue::Timestamp(Some(reading.timestamp))),
            text("event_time_local", &local),
            text("origin", reading.origin.as_str()),
            ("raw_meta".to_string(), ColumnValue::Json(meta)),
            ("recorded_at".to_string(), ColumnValue::Timestamp(Some(now))),
        ]
    }
}

fn text(column: &str, value: &str) -> (String, ColumnValue) {
    (column.to_string(), ColumnValue::Text(Some(value.to_string())))
}

fn raw_row(raw: &RawEvent) -> Vec<(String, ColumnValue)> {
    vec![
        text("content_hash", &raw.content_hash()),
        text("origin", raw.origin.as_str()),
        ("payload".to_string(), ColumnValue::Json(raw.payload.clone())),
        ("received_at".to_string(), ColumnValue::Timestamp(Some(raw.received_at))),
    ]
}

/// Keep only the columns the table actually has.
fn project(columns: &[String], row: Vec<(String, ColumnValue)>) -> Vec<(String, ColumnValue)> {
    row.into_iter()
        .filter(|(name, _)| columns.iter().any(|c| c.eq_ignore_ascii_case(name)))
        .collect()
}

// ---

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory [`Store`] double.

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub readings: Mutex<Vec<Reading>>,
        pub rows: Mutex<Vec<(String, Vec<(String, ColumnValue)>)>>,
        pub columns: Mutex<HashMap<String, Vec<String>>>,
        /// Tables whose metadata lookup fails.
        pub broken: Mutex<HashSet<String>>,
        /// Tables whose row inserts fail.
        pub failing: Mutex<HashSet<String>>,
        unique: Mutex<HashSet<String>>,
    }

    impl MemoryStore {
        /// A store with both audit tables present and every column available.
        pub fn with_audit_tables() -> Self {
            let store = Self::default();
            {
                let mut columns = store.columns.lock();
                columns.insert(RAW_EVENTS_TABLE.to_string(), RAW_COLUMNS.iter().map(|c| c.to_string()).collect());
                columns.insert(HISTORY_TABLE.to_string(), HISTORY_COLUMNS.iter().map(|c| c.to_string()).collect());
            }
            store
        }

        pub fn rows_in(&self, table: &str) -> Vec<Vec<(String, ColumnValue)>> {
            self.rows
                .lock()
                .iter()
                .filter(|(t, _)| t == table)
                .map(|(_, row)| row.clone())
                .collect()
        }
    }

    impl Store for MemoryStore {
        async fn insert_readings(&self, readings: &[Reading]) -> Result<u64, StoreError> {
            self.readings.lock().extend_from_slice(readings);
            Ok(readings.len() as u64)
        }

        async fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
            if self.broken.lock().contains(table) {
                return Err(StoreError::SchemaUnavailable {
                    table: table.to_string(),
                    reason: "permission denied for information_schema".to_string(),
                });
            }
            Ok(self.columns.lock().get(table).cloned().unwrap_or_default())
        }

        async fn insert_row(&self, table: &str, row: &[(String, ColumnValue)]) -> Result<bool, StoreError> {
            if self.failing.lock().contains(table) {
                return Err(StoreError::SchemaUnavailable {
                    table: table.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            let key: Vec<String> = row
                .iter()
                .filter(|(c, _)| matches!(c.as_str(), "content_hash" | "identity" | "snapshot_key"))
                .map(|(_, v)| format!("{v:?}"))
                .collect();
            if !self.unique.lock().insert(format!("{table}:{}", key.join("|"))) {
                return Ok(false);
            }
            self.rows.lock().push((table.to_string(), row.to_vec()));
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::memory::MemoryStore;
    use super::*;
    use crate::models::{Mode, ReadingMeta, UNKNOWN_STATUS};
    use chrono::TimeZone;
    use serde_json::json;

    fn reading(identity: &str, source: &str) -> Reading {
        // ---
        let at = Utc.with_ymd_and_hms(2025, 3, 26, 3, 0, 0).unwrap();
        Reading {
            source_id: source.to_string(),
            identity: identity.to_string(),
            status: UNKNOWN_STATUS.to_string(),
            value: Some(42.0),
            timestamp: at,
            received_at: at,
            origin: Mode::Live,
            meta: ReadingMeta {
                area: "Mining".to_string(),
                within_shift: true,
                ..Default::default()
            },
        }
    }

    fn live_caches(readings: Vec<Reading>) -> StateCaches {
        let caches = StateCaches::new(Mode::Live, 100, 100);
        caches.events.replace(readings);
        caches
    }

    fn day(d: u32) -> DateTime<Utc> {
        // 10:00 local at +07:00.
        Utc.with_ymd_and_hms(2025, 3, d, 3, 0, 0).unwrap()
    }

    fn writer(store: Arc<MemoryStore>) -> PersistenceWriter<Arc<MemoryStore>> {
        PersistenceWriter::new(store, ShiftConfig::default(), PersistConfig::default())
    }

    #[tokio::test]
    async fn test_each_identity_persisted_once_per_cycle() {
        // ---
        let store = Arc::new(MemoryStore::with_audit_tables());
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(vec![reading("a", "S1"), reading("b", "S2")]);

        let first = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!((first.inserted, first.history_inserted, first.skipped), (2, 2, 0));

        let second = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!((second.inserted, second.history_inserted, second.skipped), (0, 0, 2));

        assert_eq!(store.readings.lock().len(), 2);
        assert_eq!(writer.persisted_count(), 2);
    }

    #[tokio::test]
    async fn test_cutoff_rollover_resets_idempotency() {
        // ---
        let store = Arc::new(MemoryStore::with_audit_tables());
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(vec![reading("a", "S1")]);

        writer.persist_snapshot(&caches, day(26)).await.unwrap();
        let next_day = writer.persist_snapshot(&caches, day(27)).await.unwrap();

        assert_eq!(next_day.inserted, 1);
        assert_eq!(store.readings.lock().len(), 2);
        assert_eq!(store.rows_in(HISTORY_TABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_failure_skips_phase_then_recovers() {
        // ---
        let store = Arc::new(MemoryStore::with_audit_tables());
        store.broken.lock().insert(RAW_EVENTS_TABLE.to_string());
        store.broken.lock().insert(HISTORY_TABLE.to_string());
        let writer = writer(Arc::clone(&store));

        let caches = live_caches(vec![reading("a", "S1")]);
        let raw = RawEvent::new(json!({"id": "a", "device_id": "S1"}), Mode::Live, day(26));
        caches.raw.push_many(vec![raw]);

        let degraded = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!((degraded.inserted, degraded.raw_inserted, degraded.history_inserted), (1, 0, 0));
        assert_eq!(caches.raw.len(), 1, "buffer kept while the table is unavailable");
        let health = writer.schema_health();
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(|h| !h.available && h.last_error.is_some()));

        store.broken.lock().clear();
        caches.events.replace(vec![reading("a", "S1"), reading("b", "S2")]);

        let healthy = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!((healthy.inserted, healthy.raw_inserted, healthy.history_inserted), (1, 1, 1));
        assert!(caches.raw.is_empty());
        assert!(writer.schema_health().iter().all(|h| h.available));
    }

    #[tokio::test]
    async fn test_missing_table_counts_as_unavailable() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(vec![reading("a", "S1")]);

        let report = writer.persist_snapshot(&caches, day(26)).await.unwrap();

        assert_eq!((report.inserted, report.history_inserted), (1, 0));
        let health = writer.schema_health();
        assert_eq!(health[0].table, HISTORY_TABLE);
        assert!(health[0].last_error.as_deref().unwrap().contains("no columns"));
    }

    #[tokio::test]
    async fn test_rows_projected_onto_available_columns() {
        // ---
        let store = Arc::new(MemoryStore::default());
        store.columns.lock().insert(
            HISTORY_TABLE.to_string(),
            vec!["identity".to_string(), "snapshot_key".to_string(), "shift_window".to_string()],
        );
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(vec![reading("a", "S1")]);

        writer.persist_snapshot(&caches, day(26)).await.unwrap();

        let rows = store.rows_in(HISTORY_TABLE);
        assert_eq!(rows.len(), 1);
        let columns: Vec<&str> = rows[0].iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, vec!["identity", "snapshot_key", "shift_window"]);
        assert_eq!(rows[0][1].1, ColumnValue::Text(Some("2025-03-26".to_string())));
        assert_eq!(rows[0][2].1, ColumnValue::Text(Some("06:00-18:00".to_string())));
    }

    #[tokio::test]
    async fn test_failed_audit_insert_clears_once_inserts_succeed() {
        // ---
        let store = Arc::new(MemoryStore::with_audit_tables());
        store.failing.lock().insert(HISTORY_TABLE.to_string());
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(vec![reading("a", "S1")]);

        let failed = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!((failed.inserted, failed.history_inserted), (1, 0));
        let history = writer.schema_health();
        assert!(history.iter().any(|h| h.table == HISTORY_TABLE && !h.available));

        store.failing.lock().clear();
        caches.events.replace(vec![reading("a", "S1"), reading("b", "S2")]);

        let recovered = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!(recovered.history_inserted, 1);
        let history = writer.schema_health();
        let entry = history.iter().find(|h| h.table == HISTORY_TABLE).unwrap();
        assert!(entry.available);
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_raw_inserts_stay_buffered() {
        // ---
        let store = Arc::new(MemoryStore::with_audit_tables());
        store.failing.lock().insert(RAW_EVENTS_TABLE.to_string());
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(Vec::new());
        caches.raw.push_many(vec![
            RawEvent::new(json!({"id": "e1", "device_id": "S1"}), Mode::Live, day(26)),
            RawEvent::new(json!({"id": "e2", "device_id": "S1"}), Mode::Live, day(26)),
        ]);

        let failed = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!(failed.raw_inserted, 0);
        assert_eq!(caches.raw.len(), 2);

        store.failing.lock().clear();
        let recovered = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!(recovered.raw_inserted, 2);
        assert!(caches.raw.is_empty());

        let ids: Vec<Value> = store
            .rows_in(RAW_EVENTS_TABLE)
            .into_iter()
            .filter_map(|row| row.into_iter().find(|(c, _)| c == "payload"))
            .filter_map(|(_, v)| match v {
                ColumnValue::Json(payload) => Some(payload["id"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![json!("e1"), json!("e2")]);
    }

    #[tokio::test]
    async fn test_raw_table_without_known_columns_keeps_buffer() {
        // ---
        let store = Arc::new(MemoryStore::default());
        store
            .columns
            .lock()
            .insert(RAW_EVENTS_TABLE.to_string(), vec!["legacy_blob".to_string()]);
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(Vec::new());
        caches
            .raw
            .push_many(vec![RawEvent::new(json!({"id": "e1"}), Mode::Live, day(26))]);

        let report = writer.persist_snapshot(&caches, day(26)).await.unwrap();

        assert_eq!(report.raw_inserted, 0);
        assert_eq!(caches.raw.len(), 1);
        assert!(store.rows_in(RAW_EVENTS_TABLE).is_empty());
        let health = writer.schema_health();
        assert!(health
            .iter()
            .any(|h| h.table == RAW_EVENTS_TABLE && !h.available));
    }

    #[tokio::test]
    async fn test_duplicate_raw_payloads_collapse_by_content_hash() {
        // ---
        let store = Arc::new(MemoryStore::with_audit_tables());
        let writer = writer(Arc::clone(&store));
        let caches = live_caches(Vec::new());
        let payload = json!({"device_id": "S1", "value": 3});
        caches.raw.push_many(vec![
            RawEvent::new(payload.clone(), Mode::Live, day(26)),
            RawEvent::new(payload, Mode::Live, day(26)),
        ]);

        let report = writer.persist_snapshot(&caches, day(26)).await.unwrap();
        assert_eq!(report.raw_inserted, 1);
    }
}
