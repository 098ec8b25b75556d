//! Abstract schema model for the managed tables
//!
//! Tables are described as data — ordered columns with semantic types,
//! constraints, indexes, and an explicit per-table [`MigrationStrategy`] —
//! and the DDL generator in [`ddl`] turns a description into idempotent SQL.
//! Special migration behavior hangs off the table descriptor, never off a
//! table-name comparison inside shared generator code.

pub mod ddl;
pub mod tables;

pub use ddl::{export_schema, generate_table_sql};

/// Semantic column types, mapped onto backend-native types by the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    BigInt,
    Float,
    Boolean,
    /// Emits a timezone-naive legacy column plus a `<name>_z timestamptz`
    /// shadow column; reads prefer `COALESCE(<name>_z, <name>)`
    Timestamp,
    Uuid,
    Jsonb,
}

impl ColumnType {
    /// Backend-native type name
    pub fn pg_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Uuid => "UUID",
            ColumnType::Jsonb => "JSONB",
        }
    }

    /// Default expression used when backfilling this column as NOT NULL into
    /// an already-deployed table
    pub fn backfill_default(&self) -> &'static str {
        match self {
            ColumnType::Text => "''",
            ColumnType::Integer | ColumnType::BigInt => "0",
            ColumnType::Float => "0",
            ColumnType::Boolean => "FALSE",
            ColumnType::Timestamp => "now()",
            ColumnType::Uuid => "gen_random_uuid()",
            ColumnType::Jsonb => "'{}'::jsonb",
        }
    }
}

/// One column of a managed table
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        ColumnDef {
            name,
            ty,
            nullable: false,
            primary_key: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// A named uniqueness constraint
#[derive(Debug, Clone)]
pub struct UniqueConstraint {
    /// Base name before schema prefixing and truncation
    pub base_name: &'static str,
    pub columns: &'static [&'static str],
}

/// A secondary index
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// Base name before schema prefixing and truncation
    pub base_name: &'static str,
    pub columns: &'static [&'static str],
}

/// How the migration engine treats this table beyond create + backfill
#[derive(Debug, Clone)]
pub enum MigrationStrategy {
    /// Create, backfill missing columns, apply constraints — nothing else
    Standard,

    /// Append-heavy table whose terminal uniqueness constraint may be blocked
    /// by historical duplicate rows. The engine probes for duplicates before
    /// constraining; when duplicates exist it refuses to proceed and names
    /// the manual migration command instead of silently deleting rows.
    DedupThenConstrain {
        constraint: UniqueConstraint,
        /// ORDER BY expressions ranking which duplicate row to keep, best
        /// first. The final entry must be a stable physical tiebreaker.
        keep_priority: &'static [&'static str],
        /// Operator command surfaced in the refusal error
        manual_command: &'static str,
    },
}

/// Full description of one managed table
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    /// Table-level composite primary key; member columns never carry their
    /// own per-column PRIMARY KEY clause
    pub composite_primary_key: Option<&'static [&'static str]>,
    /// Constraints safe to apply at create time
    pub constraints: Vec<UniqueConstraint>,
    pub indexes: Vec<IndexDef>,
    pub strategy: MigrationStrategy,
}

impl TableSchema {
    /// The deferred uniqueness constraint, when this table carries a
    /// dedup-then-constrain strategy
    pub fn deferred_constraint(&self) -> Option<&UniqueConstraint> {
        match &self.strategy {
            MigrationStrategy::DedupThenConstrain { constraint, .. } => Some(constraint),
            MigrationStrategy::Standard => None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}
