//! Bounded in-memory state shared by ingestion, derivation and persistence.
//!
//! All caches are explicitly constructed service objects; nothing here is a
//! process-wide singleton. Each cache guards its state with one lock, so a
//! reader sees either the whole of an upsert/replace or none of it.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::models::{DeviceHealth, Mode, RawEvent, Reading};

// ---

/// Default capacity of the rolling event set.
pub const DEFAULT_EVENT_CAPACITY: usize = 1_000;

/// Default capacity of the persisted identity set.
pub const DEFAULT_PERSISTED_CAPACITY: usize = 10_000;

/// Insertion-ordered key set with strict FIFO eviction past capacity.
#[derive(Debug)]
pub struct BoundedKeySet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedKeySet {
    // ---
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        // ---
        if self.members.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---

#[derive(Debug, Default)]
struct SensorState {
    entries: HashMap<String, Reading>,
    last_updated_at: Option<DateTime<Utc>>,
}

/// Latest reading per source id.
#[derive(Debug, Default)]
pub struct SensorCache {
    state: RwLock<SensorState>,
}

impl SensorCache {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `reading` into the entry for its source id.
    pub fn upsert(&self, reading: Reading) {
        self.upsert_many(std::iter::once(reading));
    }

    /// Upsert a batch under a single write lock.
    pub fn upsert_many<I: IntoIterator<Item = Reading>>(&self, readings: I) {
        // ---
        let mut state = self.state.write();
        let mut touched = 0usize;
        for reading in readings {
            let merged = match state.entries.get(&reading.source_id) {
                Some(prev) => prev.merged_with(reading),
                None => reading,
            };
            state.entries.insert(merged.source_id.clone(), merged);
            touched += 1;
        }
        if touched > 0 {
            state.last_updated_at = Some(Utc::now());
        }
    }

    pub fn get(&self, source_id: &str) -> Option<Reading> {
        self.state.read().entries.get(source_id).cloned()
    }

    /// Every cached reading, ordered by source id.
    pub fn get_all(&self) -> Vec<Reading> {
        let mut all: Vec<Reading> = self.state.read().entries.values().cloned().collect();
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        all
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_updated_at
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.last_updated_at = None;
    }
}

// ---

/// Rolling deduplicated event set, newest first.
#[derive(Debug)]
pub struct EventCache {
    events: RwLock<Vec<Reading>>,
    capacity: usize,
}

impl EventCache {
    // ---
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Replace the tracked set. The first occurrence of each identity key
    /// wins; the result is sorted by timestamp descending and the oldest
    /// entries past capacity are evicted.
    pub fn replace(&self, readings: Vec<Reading>) -> usize {
        // ---
        let incoming = readings.len();
        let mut seen = HashSet::with_capacity(incoming);
        let mut unique: Vec<Reading> = readings
            .into_iter()
            .filter(|r| seen.insert(r.identity.clone()))
            .collect();
        unique.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        unique.truncate(self.capacity);

        let kept = unique.len();
        if kept < incoming {
            debug!(incoming, kept, "event cache dropped duplicate or overflow events");
        }
        *self.events.write() = unique;
        kept
    }

    pub fn get_all(&self) -> Vec<Reading> {
        self.events.read().clone()
    }

    /// Events of one source, newest first.
    pub fn for_source(&self, source_id: &str) -> Vec<Reading> {
        self.events
            .read()
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

// ---

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealthSnapshot {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub updated_at: Option<DateTime<Utc>>,
    pub devices: Vec<DeviceHealth>,
}

/// Latest device inventory from the health poller.
#[derive(Debug, Default)]
pub struct DeviceHealthCache {
    snapshot: RwLock<DeviceHealthSnapshot>,
}

impl DeviceHealthCache {
    // ---
    pub fn replace(&self, mut devices: Vec<DeviceHealth>, at: DateTime<Utc>) {
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let online = devices.iter().filter(|d| d.online).count();
        *self.snapshot.write() = DeviceHealthSnapshot {
            total: devices.len(),
            online,
            offline: devices.len() - online,
            updated_at: Some(at),
            devices,
        };
    }

    pub fn snapshot(&self) -> DeviceHealthSnapshot {
        self.snapshot.read().clone()
    }

    pub fn is_offline(&self, device_id: &str) -> bool {
        self.snapshot
            .read()
            .devices
            .iter()
            .any(|d| d.device_id == device_id && !d.online)
    }

    pub fn clear(&self) {
        *self.snapshot.write() = DeviceHealthSnapshot::default();
    }
}

// ---

/// Raw upstream payloads awaiting audit persistence; oldest dropped past capacity.
#[derive(Debug)]
pub struct PendingRawBuffer {
    pending: parking_lot::Mutex<VecDeque<RawEvent>>,
    capacity: usize,
}

impl PendingRawBuffer {
    // ---
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: parking_lot::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push_many<I: IntoIterator<Item = RawEvent>>(&self, events: I) {
        let mut pending = self.pending.lock();
        let mut dropped = 0usize;
        for event in events {
            if pending.len() >= self.capacity {
                pending.pop_front();
                dropped += 1;
            }
            pending.push_back(event);
        }
        if dropped > 0 {
            debug!(dropped, "raw buffer full, oldest payloads discarded");
        }
    }

    pub fn drain(&self) -> Vec<RawEvent> {
        self.pending.lock().drain(..).collect()
    }

    /// Put unwritten events back ahead of anything buffered since the drain.
    /// Capacity still applies; the oldest are the ones dropped.
    pub fn requeue_front<I: IntoIterator<Item = RawEvent>>(&self, events: I) {
        // ---
        let mut pending = self.pending.lock();
        let mut restored: VecDeque<RawEvent> = events.into_iter().collect();
        restored.append(&mut pending);
        let overflow = restored.len().saturating_sub(self.capacity);
        if overflow > 0 {
            restored.drain(..overflow);
            debug!(dropped = overflow, "raw buffer full on requeue, oldest payloads discarded");
        }
        *pending = restored;
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

// ---

/// Consistent view of the cache that matches the current mode.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub mode: Mode,
    /// Event-oriented readings in live mode, latest-per-source in mock mode.
    pub readings: Vec<Reading>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// The caches plus the operating mode they were filled under.
#[derive(Debug)]
pub struct StateCaches {
    mode: RwLock<Mode>,
    pub sensors: SensorCache,
    pub events: EventCache,
    pub devices: DeviceHealthCache,
    pub raw: PendingRawBuffer,
}

impl StateCaches {
    // ---
    pub fn new(mode: Mode, event_capacity: usize, raw_capacity: usize) -> Self {
        Self {
            mode: RwLock::new(mode),
            sensors: SensorCache::new(),
            events: EventCache::new(event_capacity),
            devices: DeviceHealthCache::default(),
            raw: PendingRawBuffer::new(raw_capacity),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Switch mode, clearing every cache while the mode lock is held so no
    /// reader observes readings of the previous provenance under the new mode.
    pub fn switch_mode(&self, mode: Mode) -> bool {
        // ---
        let mut current = self.mode.write();
        if *current == mode {
            return false;
        }
        self.sensors.clear();
        self.events.clear();
        self.devices.clear();
        self.raw.clear();
        let previous = *current;
        info!(from = %previous, to = %mode, "operating mode switched, caches cleared");
        *current = mode;
        true
    }

    /// Run `apply` only if the mode is still `expected`, holding the mode
    /// steady for the duration so a concurrent switch cannot interleave.
    pub fn with_mode<R>(&self, expected: Mode, apply: impl FnOnce(&Self) -> R) -> Option<R> {
        let mode = self.mode.read();
        (*mode == expected).then(|| apply(self))
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        // ---
        let mode = self.mode.read();
        let readings = match *mode {
            Mode::Live => self.events.get_all(),
            Mode::Mock => self.sensors.get_all(),
        };
        CacheSnapshot {
            mode: *mode,
            readings,
            last_updated_at: self.sensors.last_updated_at(),
        }
    }
}
