//! PostgreSQL implementation of [`Store`].

use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::StoreError;
use crate::models::Reading;
use crate::persist::{ColumnValue, Store};

// ---

/// Readings per bulk statement; 14 binds each keeps us under the 65535 parameter limit.
const INSERT_CHUNK: usize = 1_000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Accept plain lowercase SQL identifiers only; they are interpolated, not bound.
fn checked_identifier(name: &str) -> Result<&str, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

impl Store for PgStore {
    async fn insert_readings(&self, readings: &[Reading]) -> Result<u64, StoreError> {
        // ---
        let mut written = 0;
        for chunk in readings.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fatigue_readings (identity, source_id, status, value, area, location, \
                 operator, fatigue_type, latitude, longitude, within_shift, origin, event_time, received_at) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(&r.identity)
                    .push_bind(&r.source_id)
                    .push_bind(&r.status)
                    .push_bind(r.value)
                    .push_bind(&r.meta.area)
                    .push_bind(&r.meta.location)
                    .push_bind(&r.meta.operator)
                    .push_bind(&r.meta.fatigue_type)
                    .push_bind(r.meta.latitude)
                    .push_bind(r.meta.longitude)
                    .push_bind(r.meta.within_shift)
                    .push_bind(r.origin.as_str())
                    .push_bind(r.timestamp)
                    .push_bind(r.received_at);
            });
            written += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        // ---
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::TEXT
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
             ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(columns)
    }

    async fn insert_row(&self, table: &str, row: &[(String, ColumnValue)]) -> Result<bool, StoreError> {
        // ---
        if row.is_empty() {
            return Ok(false);
        }
        let table = checked_identifier(table)?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO {table} ("));
        let mut names = qb.separated(", ");
        for (column, _) in row {
            names.push(checked_identifier(column)?);
        }
        qb.push(") VALUES (");
        let mut values = qb.separated(", ");
        for (_, value) in row {
            match value {
                ColumnValue::Text(v) => values.push_bind(v.clone()),
                ColumnValue::Float(v) => values.push_bind(*v),
                ColumnValue::Bool(v) => values.push_bind(*v),
                ColumnValue::Timestamp(v) => values.push_bind(*v),
                ColumnValue::Json(v) => values.push_bind(sqlx::types::Json(v.clone())),
            };
        }
        qb.push(") ON CONFLICT DO NOTHING");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
