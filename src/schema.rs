//! Database schema management for `fatigue-monitor`.
//!
//! Ensures the readings, raw audit and history tables exist before the
//! persistence job starts. Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// `fatigue_readings` takes the fixed-shape bulk insert. The raw audit and
/// history tables are introspected at runtime, so columns may be added to
/// them without a code change.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Primary time series; the in-process persisted set keeps rows unique per shift cycle
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fatigue_readings (
            id            BIGSERIAL PRIMARY KEY,
            identity      TEXT        NOT NULL,
            source_id     TEXT        NOT NULL,
            status        TEXT        NOT NULL,
            value         DOUBLE PRECISION,
            area          TEXT        NOT NULL,
            location      TEXT,
            operator      TEXT,
            fatigue_type  TEXT,
            latitude      DOUBLE PRECISION,
            longitude     DOUBLE PRECISION,
            within_shift  BOOLEAN     NOT NULL,
            origin        TEXT        NOT NULL,
            event_time    TIMESTAMPTZ NOT NULL,
            received_at   TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fatigue_raw_events (
            id            BIGSERIAL PRIMARY KEY,
            content_hash  TEXT        NOT NULL UNIQUE,
            origin        TEXT        NOT NULL,
            payload       JSONB       NOT NULL,
            received_at   TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fatigue_event_history (
            id                BIGSERIAL PRIMARY KEY,
            identity          TEXT        NOT NULL,
            snapshot_key      TEXT        NOT NULL,
            source_id         TEXT        NOT NULL,
            status            TEXT,
            value             DOUBLE PRECISION,
            shift_label       TEXT,
            shift_window      TEXT,
            within_shift      BOOLEAN,
            event_time_utc    TIMESTAMPTZ,
            event_time_local  TEXT,
            origin            TEXT,
            raw_meta          JSONB,
            recorded_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (identity, snapshot_key)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_fatigue_readings_source_time
            ON fatigue_readings (source_id, event_time DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_fatigue_readings_identity
            ON fatigue_readings (identity);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
