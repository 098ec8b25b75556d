//! DDL generation for managed tables
//!
//! All emitted statements are idempotent: `CREATE TABLE IF NOT EXISTS`,
//! `CREATE INDEX IF NOT EXISTS`, and constraint additions guarded by an
//! existence probe against `pg_constraint` keyed by the truncated constraint
//! name. Every generated identifier passes through [`crate::ident`] so names
//! match what the backend itself silently produces at its 63-byte limit.

use crate::ident::{build_constraint_name, ConstraintName};
use crate::schema::{ColumnDef, ColumnType, TableSchema};
use crate::schema::tables::all_tables;

/// Name of the timezone-aware shadow column paired with a legacy
/// timezone-naive timestamp column
pub fn shadow_column_name(column: &str) -> String {
    format!("{column}_z")
}

/// SQL expression reading a timestamp column, preferring the shadow value
///
/// Historical rows were written to the timezone-naive column only; new rows
/// carry both. `COALESCE` lets reads pick the correct value transparently.
pub fn timestamp_read_expr(column: &str) -> String {
    format!("COALESCE({shadow}, {column})", shadow = shadow_column_name(column))
}

/// Qualified table reference under an optional schema namespace
pub fn qualify(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(ns) => format!("{ns}.{table}"),
        None => table.to_string(),
    }
}

fn column_clauses(col: &ColumnDef, in_composite_pk: bool) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut line = format!("{} {}", col.name, col.ty.pg_type());
    // composite-PK members are constrained once at table level, never inline
    if col.primary_key && !in_composite_pk {
        line.push_str(" PRIMARY KEY");
    } else if !col.nullable {
        line.push_str(" NOT NULL");
    }
    clauses.push(line);
    if col.ty == ColumnType::Timestamp {
        clauses.push(format!("{} TIMESTAMPTZ", shadow_column_name(col.name)));
    }
    clauses
}

/// Generate the `CREATE TABLE` statement for a table description.
///
/// `include_deferred_constraints` controls whether migration-sensitive
/// uniqueness constraints are emitted now (fresh bootstrap) or left for the
/// migration engine's dedup-then-constrain step (live upgrade).
pub fn generate_table_sql(
    table: &TableSchema,
    schema: Option<&str>,
    include_deferred_constraints: bool,
) -> String {
    let mut clauses: Vec<String> = Vec::new();
    let composite: &[&str] = table.composite_primary_key.unwrap_or(&[]);

    for col in &table.columns {
        clauses.extend(column_clauses(col, composite.contains(&col.name)));
    }
    if !composite.is_empty() {
        clauses.push(format!("PRIMARY KEY ({})", composite.join(", ")));
    }
    if include_deferred_constraints {
        if let Some(constraint) = table.deferred_constraint() {
            let name = build_constraint_name(ConstraintName {
                base: constraint.base_name,
                schema,
                max_bytes: None,
            });
            clauses.push(format!(
                "CONSTRAINT {name} UNIQUE ({})",
                constraint.columns.join(", ")
            ));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        qualify(schema, table.name),
        clauses.join(",\n  ")
    )
}

/// Generate a guarded `ADD CONSTRAINT` statement.
///
/// The probe keys on the truncated constraint name, which is byte-identical
/// to the name the backend silently produced for deployments that predate
/// name normalization, so pre-existing constraints are correctly detected.
pub fn generate_constraint_sql(
    table: &TableSchema,
    base_name: &str,
    columns: &[&str],
    schema: Option<&str>,
) -> String {
    let name = build_constraint_name(ConstraintName {
        base: base_name,
        schema,
        max_bytes: None,
    });
    format!(
        "DO $$\nBEGIN\n  IF NOT EXISTS (\n    SELECT 1 FROM pg_constraint WHERE conname = '{name}'\n  ) THEN\n    ALTER TABLE {table} ADD CONSTRAINT {name} UNIQUE ({cols});\n  END IF;\nEND $$;",
        table = qualify(schema, table.name),
        cols = columns.join(", "),
    )
}

/// Generate `CREATE INDEX IF NOT EXISTS` statements for a table
pub fn generate_index_sql(table: &TableSchema, schema: Option<&str>) -> Vec<String> {
    table
        .indexes
        .iter()
        .map(|idx| {
            let name = build_constraint_name(ConstraintName {
                base: idx.base_name,
                schema,
                max_bytes: None,
            });
            format!(
                "CREATE INDEX IF NOT EXISTS {name} ON {} ({})",
                qualify(schema, table.name),
                idx.columns.join(", ")
            )
        })
        .collect()
}

/// `ALTER TABLE ... ADD COLUMN` for one backfilled column.
///
/// NOT NULL columns get a type-appropriate default so the statement succeeds
/// on populated tables; nullable columns are added bare.
pub fn generate_add_column_sql(
    table: &TableSchema,
    col: &ColumnDef,
    schema: Option<&str>,
) -> String {
    let target = qualify(schema, table.name);
    if col.nullable {
        format!(
            "ALTER TABLE {target} ADD COLUMN IF NOT EXISTS {} {}",
            col.name,
            col.ty.pg_type()
        )
    } else {
        format!(
            "ALTER TABLE {target} ADD COLUMN IF NOT EXISTS {} {} NOT NULL DEFAULT {}",
            col.name,
            col.ty.pg_type(),
            col.ty.backfill_default()
        )
    }
}

/// `ALTER TABLE ... ADD COLUMN` for a timestamp's shadow column
pub fn generate_add_shadow_column_sql(
    table: &TableSchema,
    column: &str,
    schema: Option<&str>,
) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} TIMESTAMPTZ",
        qualify(schema, table.name),
        shadow_column_name(column)
    )
}

/// Emit the complete bootstrap DDL for a target namespace.
///
/// Pure and connection-free: schema namespace, every managed table (with
/// deferred constraints included, since a fresh database has no duplicate
/// history), every constraint, every index. Used to produce a reproducible
/// bootstrap script without touching a live database.
pub fn export_schema(schema: Option<&str>) -> String {
    let mut statements: Vec<String> = Vec::new();
    if let Some(ns) = schema {
        statements.push(format!("CREATE SCHEMA IF NOT EXISTS {ns};"));
    }
    for table in all_tables() {
        statements.push(format!(
            "{};",
            generate_table_sql(&table, schema, true)
        ));
        for constraint in &table.constraints {
            statements.push(generate_constraint_sql(
                &table,
                constraint.base_name,
                constraint.columns,
                schema,
            ));
        }
        for index_sql in generate_index_sql(&table, schema) {
            statements.push(format!("{index_sql};"));
        }
    }
    statements.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tables;

    #[test]
    fn test_create_table_has_if_not_exists_and_not_null() {
        let table = tables::threads_table();
        let sql = generate_table_sql(&table, None, true);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS engram_threads"));
        assert!(sql.contains("id TEXT PRIMARY KEY"));
        assert!(sql.contains("resource_id TEXT NOT NULL"));
    }

    #[test]
    fn test_timestamp_columns_get_shadow_columns() {
        let table = tables::threads_table();
        let sql = generate_table_sql(&table, None, true);
        assert!(sql.contains("created_at TIMESTAMP NOT NULL"));
        assert!(sql.contains("created_at_z TIMESTAMPTZ"));
        assert!(sql.contains("updated_at_z TIMESTAMPTZ"));
    }

    #[test]
    fn test_composite_pk_members_have_no_inline_pk() {
        let table = tables::dataset_items_table();
        let sql = generate_table_sql(&table, None, true);
        assert!(sql.contains("PRIMARY KEY (row_id)") || sql.contains("row_id UUID PRIMARY KEY"));
        // SCD-2 history table: no column-level PK on the logical item id
        assert!(!sql.contains("item_id TEXT PRIMARY KEY"));
    }

    #[test]
    fn test_schema_namespace_qualifies_and_prefixes() {
        let table = tables::messages_table();
        let sql = generate_table_sql(&table, Some("memory"), false);
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS memory.engram_messages"));
        // deferred unique(id) is excluded when constraints are deferred
        assert!(!sql.to_lowercase().contains("unique"));
    }

    #[test]
    fn test_deferred_constraint_included_for_bootstrap() {
        let table = tables::messages_table();
        let sql = generate_table_sql(&table, None, true);
        assert!(sql.contains("CONSTRAINT engram_messages_id_unique UNIQUE (id)"));
    }

    #[test]
    fn test_constraint_sql_probes_catalog_by_truncated_name() {
        let table = tables::observational_memory_table();
        let sql = generate_constraint_sql(
            &table,
            "engram_observational_memory_lookup_key_unique",
            &["lookup_key"],
            Some("a_schema_namespace_with_an_unreasonably_long_name_for_testing"),
        );
        // probe and ALTER use the same truncated name
        let name_in_probe = sql
            .split("conname = '")
            .nth(1)
            .and_then(|rest| rest.split('\'').next())
            .unwrap();
        assert!(name_in_probe.len() <= 63);
        assert!(sql.matches(name_in_probe).count() >= 2);
    }

    #[test]
    fn test_export_schema_covers_every_table() {
        let ddl = export_schema(Some("memory"));
        assert!(ddl.starts_with("CREATE SCHEMA IF NOT EXISTS memory;"));
        for table in tables::all_tables() {
            assert!(
                ddl.contains(&format!("memory.{}", table.name)),
                "missing table {}",
                table.name
            );
        }
    }

    #[test]
    fn test_export_schema_is_deterministic() {
        assert_eq!(export_schema(Some("ns")), export_schema(Some("ns")));
    }

    #[test]
    fn test_timestamp_read_expr_prefers_shadow() {
        assert_eq!(
            timestamp_read_expr("created_at"),
            "COALESCE(created_at_z, created_at)"
        );
    }
}
