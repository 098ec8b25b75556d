//! Descriptors for every table managed by the migration engine
//!
//! Column order here is the DDL emission order. Each descriptor owns its own
//! migration behavior via [`MigrationStrategy`]; the messages table is the
//! one append-heavy table carrying the dedup-then-constrain step.

use crate::schema::{
    ColumnDef, ColumnType, IndexDef, MigrationStrategy, TableSchema, UniqueConstraint,
};

use ColumnType::*;

/// Operator command that runs the structural messages migration by hand
pub const MESSAGES_MIGRATION_COMMAND: &str = "engram migrate-messages";

/// Base name of the terminal uniqueness constraint on messages
pub const MESSAGES_ID_UNIQUE: &str = "engram_messages_id_unique";

pub fn threads_table() -> TableSchema {
    TableSchema {
        name: "engram_threads",
        columns: vec![
            ColumnDef::new("id", Text).primary_key(),
            ColumnDef::new("resource_id", Text),
            ColumnDef::new("title", Text).nullable(),
            ColumnDef::new("metadata", Jsonb),
            ColumnDef::new("created_at", Timestamp),
            ColumnDef::new("updated_at", Timestamp),
        ],
        composite_primary_key: None,
        constraints: vec![],
        indexes: vec![IndexDef {
            base_name: "engram_threads_resource_id_idx",
            columns: &["resource_id"],
        }],
        strategy: MigrationStrategy::Standard,
    }
}

/// Append-heavy message log.
///
/// Historical deployments wrote this table without any uniqueness constraint
/// (streaming inserts retried on reconnect), so `id` gets its terminal UNIQUE
/// constraint through the dedup-then-constrain migration rather than at
/// create time on upgraded databases.
pub fn messages_table() -> TableSchema {
    TableSchema {
        name: "engram_messages",
        columns: vec![
            ColumnDef::new("id", Text),
            ColumnDef::new("thread_id", Text),
            ColumnDef::new("resource_id", Text),
            ColumnDef::new("role", Text),
            ColumnDef::new("content", Jsonb),
            ColumnDef::new("status", Text),
            ColumnDef::new("metadata", Jsonb),
            ColumnDef::new("created_at", Timestamp),
            ColumnDef::new("updated_at", Timestamp),
        ],
        composite_primary_key: None,
        constraints: vec![],
        indexes: vec![
            IndexDef {
                base_name: "engram_messages_thread_id_idx",
                columns: &["thread_id", "created_at"],
            },
            IndexDef {
                base_name: "engram_messages_resource_id_idx",
                columns: &["resource_id"],
            },
        ],
        strategy: MigrationStrategy::DedupThenConstrain {
            constraint: UniqueConstraint {
                base_name: MESSAGES_ID_UNIQUE,
                columns: &["id"],
            },
            // Which duplicate survives: finalized rows first, then the most
            // recently updated, then the most recently created, then the
            // physical row as a stable tiebreaker.
            keep_priority: &[
                "CASE WHEN status = 'completed' THEN 0 ELSE 1 END",
                "COALESCE(updated_at_z, updated_at) DESC",
                "COALESCE(created_at_z, created_at) DESC",
                "ctid DESC",
            ],
            manual_command: MESSAGES_MIGRATION_COMMAND,
        },
    }
}

pub fn observational_memory_table() -> TableSchema {
    TableSchema {
        name: "engram_observational_memory",
        columns: vec![
            ColumnDef::new("id", Uuid).primary_key(),
            ColumnDef::new("lookup_key", Text),
            ColumnDef::new("scope_type", Text),
            ColumnDef::new("scope_id", Text),
            ColumnDef::new("active_observations", Text),
            ColumnDef::new("generation_count", BigInt),
            ColumnDef::new("buffered_chunks", Jsonb),
            ColumnDef::new("is_buffering", Boolean),
            ColumnDef::new("reflection_pending", Boolean),
            ColumnDef::new("buffered_reflection", Text).nullable(),
            ColumnDef::new("reflection_line_offset", BigInt).nullable(),
            ColumnDef::new("pending_message_tokens", BigInt),
            ColumnDef::new("observation_token_count", BigInt),
            ColumnDef::new("total_tokens_observed", BigInt),
            ColumnDef::new("last_observed_at", Timestamp).nullable(),
            ColumnDef::new("last_buffered_at", Timestamp).nullable(),
            ColumnDef::new("created_at", Timestamp),
            ColumnDef::new("updated_at", Timestamp),
        ],
        composite_primary_key: None,
        constraints: vec![UniqueConstraint {
            base_name: "engram_observational_memory_lookup_key_unique",
            columns: &["lookup_key"],
        }],
        indexes: vec![],
        strategy: MigrationStrategy::Standard,
    }
}

pub fn datasets_table() -> TableSchema {
    TableSchema {
        name: "engram_datasets",
        columns: vec![
            ColumnDef::new("id", Uuid).primary_key(),
            ColumnDef::new("name", Text),
            ColumnDef::new("description", Text).nullable(),
            ColumnDef::new("status", Text),
            ColumnDef::new("active_version_id", Uuid).nullable(),
            ColumnDef::new("author_id", Text).nullable(),
            ColumnDef::new("metadata", Jsonb),
            ColumnDef::new("version", BigInt),
            ColumnDef::new("created_at", Timestamp),
            ColumnDef::new("updated_at", Timestamp),
        ],
        composite_primary_key: None,
        constraints: vec![],
        indexes: vec![IndexDef {
            base_name: "engram_datasets_name_idx",
            columns: &["name"],
        }],
        strategy: MigrationStrategy::Standard,
    }
}

pub fn dataset_items_table() -> TableSchema {
    TableSchema {
        name: "engram_dataset_items",
        columns: vec![
            ColumnDef::new("row_id", Uuid).primary_key(),
            ColumnDef::new("dataset_id", Uuid),
            ColumnDef::new("item_id", Text),
            ColumnDef::new("data", Jsonb),
            ColumnDef::new("dataset_version", BigInt),
            ColumnDef::new("valid_to", BigInt).nullable(),
            ColumnDef::new("is_deleted", Boolean),
            ColumnDef::new("created_at", Timestamp),
            ColumnDef::new("updated_at", Timestamp),
        ],
        composite_primary_key: None,
        constraints: vec![],
        indexes: vec![
            IndexDef {
                base_name: "engram_dataset_items_item_idx",
                columns: &["dataset_id", "item_id"],
            },
            IndexDef {
                base_name: "engram_dataset_items_current_idx",
                columns: &["dataset_id", "valid_to"],
            },
        ],
        strategy: MigrationStrategy::Standard,
    }
}

/// Audit log of dataset version bumps; the composite primary key doubles as
/// the uniqueness guarantee that no version number is recorded twice.
pub fn dataset_versions_table() -> TableSchema {
    TableSchema {
        name: "engram_dataset_versions",
        columns: vec![
            ColumnDef::new("dataset_id", Uuid).primary_key(),
            ColumnDef::new("version", BigInt).primary_key(),
            ColumnDef::new("id", Uuid),
            ColumnDef::new("change", Text),
            ColumnDef::new("item_ids", Jsonb),
            ColumnDef::new("created_at", Timestamp),
        ],
        composite_primary_key: Some(&["dataset_id", "version"]),
        constraints: vec![],
        indexes: vec![],
        strategy: MigrationStrategy::Standard,
    }
}

fn versioned_parent_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", Uuid).primary_key(),
        ColumnDef::new("name", Text),
        ColumnDef::new("status", Text),
        ColumnDef::new("active_version_id", Uuid).nullable(),
        ColumnDef::new("author_id", Text).nullable(),
        ColumnDef::new("metadata", Jsonb),
        ColumnDef::new("created_at", Timestamp),
        ColumnDef::new("updated_at", Timestamp),
    ]
}

pub fn prompt_blocks_table() -> TableSchema {
    TableSchema {
        name: "engram_prompt_blocks",
        columns: versioned_parent_columns(),
        composite_primary_key: None,
        constraints: vec![],
        indexes: vec![IndexDef {
            base_name: "engram_prompt_blocks_name_idx",
            columns: &["name"],
        }],
        strategy: MigrationStrategy::Standard,
    }
}

pub fn server_definitions_table() -> TableSchema {
    TableSchema {
        name: "engram_server_definitions",
        columns: versioned_parent_columns(),
        composite_primary_key: None,
        constraints: vec![],
        indexes: vec![IndexDef {
            base_name: "engram_server_definitions_name_idx",
            columns: &["name"],
        }],
        strategy: MigrationStrategy::Standard,
    }
}

/// Shared version table for every entity family. No foreign key with
/// `ON DELETE CASCADE` — `parent_id` references different parent tables
/// depending on `parent_kind`, so deletes cascade explicitly in the stores.
pub fn entity_versions_table() -> TableSchema {
    TableSchema {
        name: "engram_entity_versions",
        columns: vec![
            ColumnDef::new("id", Uuid).primary_key(),
            ColumnDef::new("parent_id", Uuid),
            ColumnDef::new("parent_kind", Text),
            ColumnDef::new("version_number", BigInt),
            ColumnDef::new("content", Jsonb),
            ColumnDef::new("changed_fields", Jsonb),
            ColumnDef::new("change_message", Text).nullable(),
            ColumnDef::new("created_at", Timestamp),
        ],
        composite_primary_key: None,
        constraints: vec![UniqueConstraint {
            base_name: "engram_entity_versions_parent_version_unique",
            columns: &["parent_id", "version_number"],
        }],
        indexes: vec![IndexDef {
            base_name: "engram_entity_versions_parent_idx",
            columns: &["parent_id", "parent_kind"],
        }],
        strategy: MigrationStrategy::Standard,
    }
}

/// Every managed table, in migration order
pub fn all_tables() -> Vec<TableSchema> {
    vec![
        threads_table(),
        messages_table(),
        observational_memory_table(),
        datasets_table(),
        dataset_items_table(),
        dataset_versions_table(),
        prompt_blocks_table(),
        server_definitions_table(),
        entity_versions_table(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_table_names_are_unique_and_within_budget() {
        let tables = all_tables();
        let mut names: Vec<&str> = tables.iter().map(|t| t.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tables.len());
        for table in &tables {
            assert!(table.name.len() <= crate::ident::MAX_IDENTIFIER_BYTES);
        }
    }

    #[test]
    fn test_every_table_has_created_at() {
        for table in all_tables() {
            assert!(
                table.column("created_at").is_some(),
                "{} lacks created_at",
                table.name
            );
        }
    }

    #[test]
    fn test_messages_strategy_ends_with_physical_tiebreaker() {
        let table = messages_table();
        match table.strategy {
            MigrationStrategy::DedupThenConstrain { keep_priority, .. } => {
                assert_eq!(*keep_priority.last().unwrap(), "ctid DESC");
            }
            _ => panic!("messages must carry the dedup strategy"),
        }
    }

    #[test]
    fn test_composite_pk_table_lists_its_members_as_columns() {
        let table = dataset_versions_table();
        let pk = table.composite_primary_key.unwrap();
        for member in pk {
            assert!(table.column(member).is_some());
        }
    }
}
