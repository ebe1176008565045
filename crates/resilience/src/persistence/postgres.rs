//! PostgreSQL store implementations
//!
//! Shared state for horizontally scaled deployments:
//! - Circuit records are updated under `SELECT ... FOR UPDATE`
//! - Rate-limit hits are pruned, counted and appended under a transaction-scoped
//!   advisory lock on the key, so the check-then-append sequence is atomic

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use super::window_millis;
use crate::error::StoreError;
use crate::reliability::{CircuitBreakerConfig, CircuitEvent, CircuitRecord, CircuitState};

/// Apply the bundled schema migrations
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))
}

fn record_from_row(row: &PgRow) -> Result<CircuitRecord, StoreError> {
    let state: String = row.try_get("state")?;
    let state = CircuitState::parse(&state)
        .ok_or_else(|| StoreError::Serialization(format!("unknown circuit state: {state}")))?;
    let failure_count: i32 = row.try_get("failure_count")?;
    let success_count: i32 = row.try_get("success_count")?;

    Ok(CircuitRecord {
        state,
        failure_count: failure_count.max(0) as u32,
        success_count: success_count.max(0) as u32,
        last_failure_at: row.try_get("last_failure_at")?,
        probe_started_at: row.try_get("probe_started_at")?,
    })
}

/// PostgreSQL implementation of [`CircuitStore`]
///
/// # Example
///
/// ```ignore
/// use breakwater_resilience::persistence::{migrate, PostgresCircuitStore};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// migrate(&pool).await?;
/// let store = PostgresCircuitStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresCircuitStore {
    pool: PgPool,
}

impl PostgresCircuitStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CircuitStore for PostgresCircuitStore {
    #[instrument(skip(self, config))]
    async fn apply(
        &self,
        name: &str,
        event: CircuitEvent,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Result<CircuitUpdate, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO breakwater_circuits (name, state)
            VALUES ($1, 'closed')
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT state, failure_count, success_count, last_failure_at, probe_started_at
            FROM breakwater_circuits
            WHERE name = $1
            FOR UPDATE
            "#,
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        let mut record = record_from_row(&row)?;
        let previous = record.state;
        let admission = record.apply(event, config, now);

        sqlx::query(
            r#"
            UPDATE breakwater_circuits
            SET state = $2,
                failure_count = $3,
                success_count = $4,
                last_failure_at = $5,
                probe_started_at = $6,
                updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(record.state.as_str())
        .bind(record.failure_count.min(i32::MAX as u32) as i32)
        .bind(record.success_count.min(i32::MAX as u32) as i32)
        .bind(record.last_failure_at)
        .bind(record.probe_started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit circuit update: {}", e);
            StoreError::from(e)
        })?;

        Ok(CircuitUpdate {
            previous,
            record,
            admission,
        })
    }

    async fn get(&self, name: &str) -> Result<Option<CircuitRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT state, failure_count, success_count, last_failure_at, probe_started_at
            FROM breakwater_circuits
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(&self) -> Result<HashMap<String, CircuitRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, state, failure_count, success_count, last_failure_at, probe_started_at
            FROM breakwater_circuits
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(String, CircuitRecord), StoreError> {
                let name: String = row.try_get("name")?;
                Ok((name, record_from_row(row)?))
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn reset(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO breakwater_circuits (name, state)
            VALUES ($1, 'closed')
            ON CONFLICT (name) DO UPDATE
            SET state = 'closed',
                failure_count = 0,
                success_count = 0,
                last_failure_at = NULL,
                probe_started_at = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        debug!(circuit = name, "Circuit reset");
        Ok(())
    }
}

/// PostgreSQL implementation of [`WindowStore`]
///
/// Each hit is a row; the key's rows are serialized through
/// `pg_advisory_xact_lock(hashtext(key))` for the duration of one check.
/// Rows of idle keys are purged from `record_hit` at most once per window
/// per store instance.
#[derive(Clone)]
pub struct PostgresWindowStore {
    pool: PgPool,
    next_sweep_ms: Arc<AtomicI64>,
}

impl PostgresWindowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            next_sweep_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claim the next sweep if one is due
    fn sweep_due(&self, now_ms: i64, window_ms: i64) -> bool {
        let next = self.next_sweep_ms.load(Ordering::Acquire);
        now_ms >= next
            && self
                .next_sweep_ms
                .compare_exchange(
                    next,
                    now_ms.saturating_add(window_ms),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }
}

#[async_trait]
impl WindowStore for PostgresWindowStore {
    #[instrument(skip(self))]
    async fn record_hit(
        &self,
        key: &str,
        window: Duration,
        max: u32,
        now_ms: i64,
    ) -> Result<WindowSample, StoreError> {
        let window_ms = window_millis(window);
        let window_start = now_ms.saturating_sub(window_ms);

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM breakwater_rate_limit_hits WHERE key = $1 AND hit_at_ms < $2")
            .bind(key)
            .bind(window_start)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS hits, MIN(hit_at_ms) AS oldest
            FROM breakwater_rate_limit_hits
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let hits: i64 = row.try_get("hits")?;
        let oldest_ms: Option<i64> = row.try_get("oldest")?;
        let count = hits.clamp(0, u32::MAX as i64) as u32;
        let recorded = count < max;

        if recorded {
            let expires_at_ms = now_ms.saturating_add(window_ms);
            sqlx::query(
                r#"
                INSERT INTO breakwater_rate_limit_hits (id, key, hit_at_ms, expires_at_ms)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(key)
            .bind(now_ms)
            .bind(expires_at_ms)
            .execute(&mut *tx)
            .await?;

            // Whole-key expiry follows the newest hit
            sqlx::query(
                "UPDATE breakwater_rate_limit_hits SET expires_at_ms = $2 WHERE key = $1 AND expires_at_ms < $2",
            )
            .bind(key)
            .bind(expires_at_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if self.sweep_due(now_ms, window_ms) {
            if let Err(e) = self.purge_expired(now_ms).await {
                warn!(error = %e, "Failed to purge expired rate limit hits");
            }
        }

        Ok(WindowSample {
            count,
            oldest_ms,
            recorded,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM breakwater_rate_limit_hits WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM breakwater_rate_limit_hits WHERE expires_at_ms < $1")
                .bind(now_ms)
                .execute(&self.pool)
                .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "Purged expired rate limit hits");
        }
        Ok(removed)
    }
}
