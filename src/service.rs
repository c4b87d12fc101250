//! The `Monitor` service object: owns the caches, the upstream client and the
//! derivation and persistence components, and exposes the read surface used
//! by the HTTP layer.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{DeviceHealthSnapshot, StateCaches};
use crate::config::Config;
use crate::derive::{Alert, AlertDeriver, Derived};
use crate::error::UpstreamError;
use crate::models::{Mode, RawEvent, Reading};
use crate::normalize::EventNormalizer;
use crate::persist::{PersistReport, PersistenceWriter, SchemaHealth, Store};
use crate::scheduler::{JobStatus, Scheduler};
use crate::shift::{ClassificationRecord, ShiftWindow, ShiftWindowClassifier};
use crate::upstream::{EventQuery, UpstreamClient};

// ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub fetched: usize,
    pub kept: usize,
    /// Dropped as outside the shift window, or discarded by a mode switch.
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftWindowView {
    pub area: String,
    pub window: ShiftWindow,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewMeta {
    pub mode: Mode,
    pub generated_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub cutoff_key: String,
    pub shift_windows: Vec<ShiftWindowView>,
    pub ingest: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub meta: OverviewMeta,
    pub device_health: DeviceHealthSnapshot,
    pub sensors: Vec<Reading>,
    #[serde(flatten)]
    pub derived: Derived,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDetail {
    pub meta: OverviewMeta,
    pub sensor: Option<Reading>,
    pub alert: Option<Alert>,
    /// Cached events for this source, newest first.
    pub history: Vec<Reading>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub sensors: usize,
    pub events: usize,
    pub raw_pending: usize,
    pub persisted_ids: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, or `degraded` when a job is failing or a table is unavailable.
    pub status: &'static str,
    pub mode: Mode,
    pub ingest: JobStatus,
    pub persist: JobStatus,
    pub devices: Option<JobStatus>,
    pub schema: Vec<SchemaHealth>,
    pub cache: CacheStats,
    pub classifier: Vec<ClassificationRecord>,
}

pub struct Monitor<S> {
    caches: StateCaches,
    client: UpstreamClient,
    classifier: Arc<ShiftWindowClassifier>,
    normalizer: EventNormalizer,
    deriver: AlertDeriver,
    writer: PersistenceWriter<S>,
    ingest_job: Arc<Scheduler>,
    persist_job: Arc<Scheduler>,
    devices_job: Option<Arc<Scheduler>>,
}

impl<S: Store + 'static> Monitor<S> {
    // ---
    pub fn new(cfg: &Config, store: S) -> Result<Self> {
        // ---
        let classifier = Arc::new(ShiftWindowClassifier::new(
            cfg.shift.clone(),
            cfg.classifier_debug_capacity,
        ));
        Ok(Self {
            caches: StateCaches::new(cfg.mode, cfg.event_capacity, cfg.raw_capacity),
            client: UpstreamClient::new(cfg.upstream.clone())?,
            normalizer: EventNormalizer::new(Arc::clone(&classifier)),
            classifier,
            deriver: AlertDeriver::new(cfg.derive.clone()),
            writer: PersistenceWriter::new(store, cfg.shift.clone(), cfg.persist.clone()),
            ingest_job: Arc::new(Scheduler::new("ingest", cfg.poll_interval)),
            persist_job: Arc::new(Scheduler::new("persist", cfg.persist_interval)),
            devices_job: cfg
                .device_poll_interval
                .map(|every| Arc::new(Scheduler::new("devices", every))),
        })
    }

    pub fn mode(&self) -> Mode {
        self.caches.mode()
    }

    pub fn caches(&self) -> &StateCaches {
        &self.caches
    }

    pub fn writer(&self) -> &PersistenceWriter<S> {
        &self.writer
    }

    /// Fetch one batch for the current mode and fold it into the caches.
    pub async fn ingest_once(&self) -> Result<IngestReport> {
        // ---
        let mode = self.caches.mode();
        let now = Utc::now();
        let query = EventQuery::for_shift_day(
            self.classifier.config(),
            self.client.config().source_ids.clone(),
            now,
        );
        let batch = self.client.fetch_batch(mode, &query, now).await?;
        let report = self.apply_batch(mode, batch);
        debug!(mode = %mode, fetched = report.fetched, kept = report.kept, dropped = report.dropped, "ingest pass finished");
        Ok(report)
    }

    /// Normalize a fetched batch and apply it, provided the mode it was
    /// fetched under is still current.
    pub fn apply_batch(&self, mode: Mode, batch: Vec<RawEvent>) -> IngestReport {
        // ---
        let fetched = batch.len();
        let mut readings: Vec<Reading> = match mode {
            Mode::Live => batch
                .iter()
                .filter_map(|raw| {
                    let class = self.classifier.classify(&raw.payload);
                    class
                        .within_shift
                        .then(|| self.normalizer.normalize_classified(raw, class))
                })
                .collect(),
            Mode::Mock => batch.iter().map(|raw| self.normalizer.normalize(raw)).collect(),
        };
        let kept = readings.len();
        // Oldest first so the latest reading per source wins the merge.
        readings.sort_by_key(|r| r.timestamp);

        let applied = self.caches.with_mode(mode, move |caches| {
            if mode == Mode::Live {
                caches.raw.push_many(batch);
                caches.events.replace(readings.clone());
            }
            caches.sensors.upsert_many(readings);
        });

        match applied {
            Some(()) => IngestReport {
                fetched,
                kept,
                dropped: fetched - kept,
            },
            None => {
                debug!(fetched, "mode switched during fetch, batch discarded");
                IngestReport {
                    fetched,
                    kept: 0,
                    dropped: fetched,
                }
            }
        }
    }

    /// Refresh the device health inventory.
    pub async fn poll_devices(&self) -> Result<usize> {
        // ---
        let mode = self.caches.mode();
        let devices = self.client.fetch_devices(mode).await?;
        let count = devices.len();
        self.caches
            .with_mode(mode, |caches| caches.devices.replace(devices, Utc::now()));
        Ok(count)
    }

    pub async fn persist_once(&self) -> Result<PersistReport> {
        // ---
        let report = self.writer.persist_snapshot(&self.caches, Utc::now()).await?;
        if report.inserted > 0 || report.raw_inserted > 0 || report.history_inserted > 0 {
            info!(
                inserted = report.inserted,
                raw_inserted = report.raw_inserted,
                history_inserted = report.history_inserted,
                "snapshot persisted"
            );
        }
        Ok(report)
    }

    /// Switch the operating mode, clearing every cache. Switching to live
    /// fails when the integrator is not configured for it.
    pub fn switch_mode(&self, mode: Mode) -> Result<bool, UpstreamError> {
        if mode == Mode::Live {
            self.client.config().validate_live()?;
        }
        Ok(self.caches.switch_mode(mode))
    }

    fn meta(&self, mode: Mode, now: DateTime<Utc>, last_updated_at: Option<DateTime<Utc>>) -> OverviewMeta {
        let shift = self.classifier.config();
        OverviewMeta {
            mode,
            generated_at: now,
            last_updated_at,
            cutoff_key: shift.cutoff_key(now),
            shift_windows: shift
                .windows
                .iter()
                .map(|(area, window)| ShiftWindowView {
                    area: area.clone(),
                    window: *window,
                })
                .collect(),
            ingest: self.ingest_job.status(),
        }
    }

    fn derive_at(&self, now: DateTime<Utc>) -> (OverviewMeta, DeviceHealthSnapshot, Derived) {
        // ---
        let snapshot = self.caches.snapshot();
        let devices = self.caches.devices.snapshot();
        let offline: HashSet<String> = devices
            .devices
            .iter()
            .filter(|d| !d.online)
            .map(|d| d.device_id.clone())
            .collect();
        let derived = self
            .deriver
            .derive(&snapshot.readings, &offline, snapshot.mode, now);
        (self.meta(snapshot.mode, now, snapshot.last_updated_at), devices, derived)
    }

    /// Best-effort view of the current snapshot; never fails.
    pub fn overview(&self, now: DateTime<Utc>) -> Overview {
        let (meta, device_health, derived) = self.derive_at(now);
        Overview {
            meta,
            device_health,
            sensors: self.caches.sensors.get_all(),
            derived,
        }
    }

    /// `None` when nothing is cached for `source_id`.
    pub fn sensor_detail(&self, source_id: &str, now: DateTime<Utc>) -> Option<SensorDetail> {
        // ---
        let sensor = self.caches.sensors.get(source_id);
        let history = self.caches.events.for_source(source_id);
        if sensor.is_none() && history.is_empty() {
            return None;
        }
        let (meta, _, derived) = self.derive_at(now);
        let alert = derived.alerts.into_iter().find(|a| a.source_id == source_id);
        Some(SensorDetail {
            meta,
            sensor,
            alert,
            history,
        })
    }

    pub fn health(&self) -> HealthReport {
        // ---
        let ingest = self.ingest_job.status();
        let persist = self.persist_job.status();
        let devices = self.devices_job.as_ref().map(|job| job.status());
        let schema = self.writer.schema_health();

        let degraded = ingest.is_failing()
            || persist.is_failing()
            || devices.as_ref().is_some_and(JobStatus::is_failing)
            || schema.iter().any(|s| !s.available);

        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            mode: self.caches.mode(),
            ingest,
            persist,
            devices,
            schema,
            cache: CacheStats {
                sensors: self.caches.sensors.len(),
                events: self.caches.events.len(),
                raw_pending: self.caches.raw.len(),
                persisted_ids: self.writer.persisted_count(),
            },
            classifier: self.classifier.recent_decisions(),
        }
    }

    /// Start the ingest, persist and (if enabled) device loops.
    pub fn spawn_jobs(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        // ---
        let mut handles = Vec::new();

        let monitor = Arc::clone(self);
        handles.push(self.ingest_job.spawn(cancel.clone(), move || {
            let monitor = Arc::clone(&monitor);
            async move { monitor.ingest_once().await.map(|_| ()) }
        }));

        let monitor = Arc::clone(self);
        handles.push(self.persist_job.spawn(cancel.clone(), move || {
            let monitor = Arc::clone(&monitor);
            async move { monitor.persist_once().await.map(|_| ()) }
        }));

        if let Some(job) = &self.devices_job {
            let monitor = Arc::clone(self);
            handles.push(job.spawn(cancel.clone(), move || {
                let monitor = Arc::clone(&monitor);
                async move { monitor.poll_devices().await.map(|_| ()) }
            }));
        }

        handles
    }
}
