//! Domain stores for the relational backend
//!
//! All stores share one low-level [`PgStore`] execution client (pool plus
//! schema namespace). Correctness under concurrency comes entirely from
//! backend transactions and row locks — there is no in-process mutual
//! exclusion. Operations follow two disciplines:
//!
//! - multi-row mutations run inside an explicit transaction and take
//!   `SELECT ... FOR UPDATE` on any row they read-merge-write;
//! - single-row counter/flag updates are individual auto-committed
//!   statements, so unrelated rows are never locked inside one transaction
//!   (cross-entity locks in one transaction are how lock-ordering deadlocks
//!   arise under concurrent agents sharing a resource scope).
//!
//! When an operation must touch both a thread row and an observational-memory
//! row, it locks the thread first, on every code path.

pub mod datasets;
pub mod entities;
pub mod observations;
pub mod threads;

use crate::config::StorageConfig;
use crate::error::{EngramError, Result};
use crate::migration::MigrationEngine;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info};

/// Low-level execution client shared by every domain store
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    schema: Option<String>,
}

impl PgStore {
    /// Connect to the backend, verify it answers, and run migrations.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let store = Self::connect_unmigrated(config).await?;

        MigrationEngine::new(store.pool.clone(), store.schema.clone())
            .run()
            .await?;

        info!("relational backend ready");
        Ok(store)
    }

    /// Connect and verify health without running migrations.
    ///
    /// The automatic migration path refuses to start while duplicate message
    /// ids block the terminal uniqueness constraint; the operator command
    /// that repairs that state connects through here, since connecting
    /// through [`connect`](Self::connect) would fail on the very condition
    /// being repaired.
    pub async fn connect_unmigrated(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        info!(schema = ?config.schema_name, "connecting to relational backend");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(EngramError::db("store.connect"))?;

        let store = PgStore {
            pool,
            schema: config.schema_name.clone(),
        };
        store.verify_backend_health().await?;
        Ok(store)
    }

    /// Wrap an existing pool without connecting or migrating (tests, tools)
    pub fn from_pool(pool: PgPool, schema: Option<String>) -> Self {
        PgStore { pool, schema }
    }

    /// Basic liveness probe before any DDL runs
    async fn verify_backend_health(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(EngramError::db("store.health_check"))?;
        debug!("backend health check passed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Qualified name of a managed table under this client's namespace
    pub fn table(&self, name: &str) -> String {
        crate::schema::ddl::qualify(self.schema(), name)
    }

    /// Thread and message operations
    pub fn threads(&self) -> threads::ThreadStore {
        threads::ThreadStore::new(self.clone())
    }

    /// Dataset parents, SCD-2 items, and version audit
    pub fn datasets(&self) -> datasets::DatasetStore {
        datasets::DatasetStore::new(self.clone())
    }

    /// Versioned prompt blocks
    pub fn prompt_blocks(&self) -> entities::VersionedEntityStore<entities::PromptBlocks> {
        entities::VersionedEntityStore::new(self.clone())
    }

    /// Versioned MCP server definitions
    pub fn server_definitions(
        &self,
    ) -> entities::VersionedEntityStore<entities::ServerDefinitions> {
        entities::VersionedEntityStore::new(self.clone())
    }

    /// Observational memory records and the buffering/activation engine
    pub fn observations(&self) -> observations::ObservationStore {
        observations::ObservationStore::new(self.clone())
    }
}

/// Both representations of one instant: the legacy timezone-naive column
/// value and its timezone-aware shadow. Writers always set both.
///
/// Truncated to microseconds, the backend's timestamp resolution, so a value
/// handed back to the caller at write time compares equal to the same value
/// read back later.
pub(crate) fn ts_pair(at: DateTime<Utc>) -> (NaiveDateTime, DateTime<Utc>) {
    let at = at.trunc_subsecs(6);
    (at.naive_utc(), at)
}

/// Current instant at the backend's microsecond resolution. All store writes
/// take their timestamps from here rather than `Utc::now()` directly.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_pair_agrees_on_the_instant() {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        assert_eq!(naive, now.naive_utc());
        assert_eq!(aware, now);
    }

    #[test]
    fn test_ts_pair_truncates_to_backend_resolution() {
        let nanos = Utc.with_ymd_and_hms(2026, 8, 25, 18, 27, 18).unwrap()
            + chrono::Duration::nanoseconds(192_201_003);
        let (naive, aware) = ts_pair(nanos);
        assert_eq!(aware.timestamp_subsec_nanos(), 192_201_000);
        assert_eq!(naive, aware.naive_utc());
        // stable under a second pass, as read-back values are
        assert_eq!(ts_pair(aware), (naive, aware));
    }
}
