//! Self-migrating table engine
//!
//! Runs once at process start: creates missing tables, backfills columns
//! added since the table was first deployed, applies constraints and indexes,
//! and performs the one irreversible structural migration (deduplicate, then
//! constrain) for append-heavy tables. Every step is check-then-act against
//! the backend catalog rather than a version table, so a second run issues no
//! DDL and no errors.

pub mod single_flight;

use crate::error::{EngramError, Result};
use crate::ident::{build_constraint_name, ConstraintName};
use crate::schema::ddl::{
    generate_add_column_sql, generate_add_shadow_column_sql, generate_constraint_sql,
    generate_index_sql, generate_table_sql, qualify, shadow_column_name,
};
use crate::schema::tables::all_tables;
use crate::schema::{ColumnType, MigrationStrategy, TableSchema, UniqueConstraint};
use once_cell::sync::Lazy;
use serde::Serialize;
use single_flight::SingleFlight;
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Process-wide registry so concurrent engine instances sharing a namespace
/// never race to create it twice
static SCHEMA_SETUP: Lazy<SingleFlight> = Lazy::new(SingleFlight::new);

/// Outcome of the structural dedup-then-constrain migration
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub already_migrated: bool,
    pub duplicates_removed: u64,
    pub message: String,
}

/// Startup migration engine for one namespace
pub struct MigrationEngine {
    pool: PgPool,
    schema: Option<String>,
}

impl MigrationEngine {
    pub fn new(pool: PgPool, schema: Option<String>) -> Self {
        MigrationEngine { pool, schema }
    }

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Materialize or upgrade the schema for every managed table.
    ///
    /// Safe to call from many processes concurrently; all correctness comes
    /// from idempotent DDL and catalog probes.
    pub async fn run(&self) -> Result<()> {
        info!(schema = ?self.schema, "running storage migrations");
        self.ensure_namespace().await?;

        for table in all_tables() {
            self.ensure_table(&table).await?;
        }

        for table in all_tables() {
            if let MigrationStrategy::DedupThenConstrain {
                constraint,
                manual_command,
                ..
            } = &table.strategy
            {
                self.ensure_terminal_constraint(&table, constraint, manual_command)
                    .await?;
            }
        }

        info!("storage migrations complete");
        Ok(())
    }

    /// Create the schema namespace, single-flight per namespace.
    ///
    /// The first caller creates; concurrent callers await the same outcome;
    /// a failure reaches every waiter, and a later call retries fresh.
    async fn ensure_namespace(&self) -> Result<()> {
        let Some(ns) = self.schema() else {
            return Ok(());
        };
        let pool = self.pool.clone();
        let statement = format!("CREATE SCHEMA IF NOT EXISTS {ns}");
        SCHEMA_SETUP
            .run(ns, || async move {
                debug!(namespace = ns, "creating schema namespace");
                sqlx::query(&statement)
                    .execute(&pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| format!("failed to create schema '{ns}': {e}"))
            })
            .await
            .map_err(EngramError::Migration)
    }

    /// Create the table if absent, then backfill any columns it is missing
    /// and apply its non-deferred constraints and indexes.
    async fn ensure_table(&self, table: &TableSchema) -> Result<()> {
        let create = generate_table_sql(table, self.schema(), false);
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(EngramError::db_with("migration.create_table", table.name))?;

        let existing = self.existing_columns(table.name).await?;

        for col in &table.columns {
            if !existing.contains(col.name) {
                info!(table = table.name, column = col.name, "backfilling column");
                let sql = generate_add_column_sql(table, col, self.schema());
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(EngramError::db_with("migration.add_column", col.name))?;
            }
            if col.ty == ColumnType::Timestamp {
                let shadow = shadow_column_name(col.name);
                if !existing.contains(shadow.as_str()) {
                    let sql = generate_add_shadow_column_sql(table, col.name, self.schema());
                    sqlx::query(&sql)
                        .execute(&self.pool)
                        .await
                        .map_err(EngramError::db_with("migration.add_shadow_column", shadow))?;
                }
            }
        }

        for constraint in &table.constraints {
            let sql =
                generate_constraint_sql(table, constraint.base_name, constraint.columns, self.schema());
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(EngramError::db_with(
                    "migration.add_constraint",
                    constraint.base_name,
                ))?;
        }

        for sql in generate_index_sql(table, self.schema()) {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(EngramError::db_with("migration.create_index", table.name))?;
        }

        Ok(())
    }

    /// Columns the catalog currently reports for `table`
    async fn existing_columns(&self, table: &str) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_name = $1 AND table_schema = COALESCE($2, current_schema())",
        )
        .bind(table)
        .bind(self.schema())
        .fetch_all(&self.pool)
        .await
        .map_err(EngramError::db_with("migration.existing_columns", table))?;
        Ok(rows.into_iter().collect())
    }

    async fn constraint_exists(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = $1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(EngramError::db_with("migration.constraint_exists", name))
    }

    /// Count of logical keys that have more than one physical row
    async fn duplicate_key_count(
        &self,
        table: &TableSchema,
        constraint: &UniqueConstraint,
    ) -> Result<i64> {
        let cols = constraint.columns.join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT {cols} FROM {} GROUP BY {cols} HAVING COUNT(*) > 1) dup",
            qualify(self.schema(), table.name)
        );
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(EngramError::db_with("migration.duplicate_probe", table.name))
    }

    /// Startup-time guard for the terminal uniqueness constraint.
    ///
    /// When the constraint is missing and duplicates exist, this refuses to
    /// proceed: resolving duplicates deletes rows and can be slow on large
    /// tables, so it must never run silently. The error names the operator
    /// command that performs the migration deliberately.
    async fn ensure_terminal_constraint(
        &self,
        table: &TableSchema,
        constraint: &UniqueConstraint,
        manual_command: &str,
    ) -> Result<()> {
        let name = build_constraint_name(ConstraintName {
            base: constraint.base_name,
            schema: self.schema(),
            max_bytes: None,
        });
        if self.constraint_exists(&name).await? {
            debug!(table = table.name, constraint = %name, "terminal constraint present");
            return Ok(());
        }

        let duplicates = self.duplicate_key_count(table, constraint).await?;
        if duplicates > 0 {
            return Err(EngramError::Migration(format!(
                "table '{}' has {duplicates} duplicate key group(s) blocking constraint '{name}'. \
                 This migration deletes superseded rows and may take a long time, so it will not \
                 run automatically. Run `{manual_command}` to perform it.",
                table.name
            )));
        }

        let sql = generate_constraint_sql(table, constraint.base_name, constraint.columns, self.schema());
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(EngramError::db_with("migration.terminal_constraint", table.name))?;
        info!(table = table.name, constraint = %name, "terminal constraint added");
        Ok(())
    }

    /// Operator-invoked structural migration: deduplicate, then constrain.
    ///
    /// Deduplication uses statement-level deletes so concurrent reads keep
    /// working; only the final constraint addition takes an exclusive lock.
    pub async fn run_structural_migration(&self, table: &TableSchema) -> Result<MigrationReport> {
        let MigrationStrategy::DedupThenConstrain {
            constraint,
            keep_priority,
            ..
        } = &table.strategy
        else {
            return Err(EngramError::InvalidInput(format!(
                "table '{}' has no structural migration",
                table.name
            )));
        };

        let name = build_constraint_name(ConstraintName {
            base: constraint.base_name,
            schema: self.schema(),
            max_bytes: None,
        });
        if self.constraint_exists(&name).await? {
            return Ok(MigrationReport {
                success: true,
                already_migrated: true,
                duplicates_removed: 0,
                message: format!("constraint '{name}' already exists; nothing to do"),
            });
        }

        let target = qualify(self.schema(), table.name);
        let cols = constraint.columns.join(", ");
        let order = keep_priority.join(", ");
        // Rank 1 is the keeper per the documented priority; everything else
        // is a superseded duplicate.
        let dedup = format!(
            "DELETE FROM {target} WHERE ctid IN (\
               SELECT ctid FROM (\
                 SELECT ctid, ROW_NUMBER() OVER (PARTITION BY {cols} ORDER BY {order}) AS rn \
                 FROM {target}\
               ) ranked WHERE rn > 1\
             )"
        );
        let result = sqlx::query(&dedup)
            .execute(&self.pool)
            .await
            .map_err(EngramError::db_with("migration.dedup", table.name))?;
        let removed = result.rows_affected();
        if removed > 0 {
            warn!(table = table.name, removed, "removed duplicate rows");
        }

        let sql = generate_constraint_sql(table, constraint.base_name, constraint.columns, self.schema());
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(EngramError::db_with("migration.terminal_constraint", table.name))?;

        Ok(MigrationReport {
            success: true,
            already_migrated: false,
            duplicates_removed: removed,
            message: format!(
                "removed {removed} duplicate row(s) from '{}' and added constraint '{name}'",
                table.name
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tables::messages_table;

    #[test]
    fn test_report_serializes_with_expected_fields() {
        let report = MigrationReport {
            success: true,
            already_migrated: false,
            duplicates_removed: 3,
            message: "done".into(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["success"], serde_json::json!(true));
        assert_eq!(value["duplicates_removed"], serde_json::json!(3));
    }

    #[test]
    fn test_messages_table_is_the_structural_candidate() {
        let table = messages_table();
        assert!(matches!(
            table.strategy,
            MigrationStrategy::DedupThenConstrain { .. }
        ));
    }
}
