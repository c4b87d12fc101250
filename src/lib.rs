//! Fatigue telemetry monitor.
//!
//! Polls an upstream fatigue-event integrator (or synthesizes mock data),
//! normalizes and classifies events against per-area shift windows, keeps a
//! bounded in-memory snapshot, derives alerts and aggregates on demand and
//! persists the snapshot idempotently to PostgreSQL.
//!
//! Data flows `upstream` -> `normalize` (via `shift`) -> `cache` ->
//! `derive` / `persist`, driven by `scheduler` loops owned by
//! [`service::Monitor`].

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod derive;
pub mod error;
pub mod fields;
pub mod models;
pub mod normalize;
pub mod persist;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod shift;
pub mod store;
pub mod upstream;

pub use config::Config;
pub use models::{Mode, RawEvent, Reading};
pub use service::Monitor;
