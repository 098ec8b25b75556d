//! Database-backed integration tests.
//!
//! These run only when `TEST_DATABASE_URL` points at a PostgreSQL instance;
//! without it every test returns early. Each test works inside its own
//! throwaway schema namespace and drops it on the way out, so tests are
//! independent and re-runnable.

use engram::ident::{build_constraint_name, ConstraintName};
use engram::migration::MigrationEngine;
use engram::schema::ddl::shadow_column_name;
use engram::schema::{tables, ColumnType};
use engram::store::datasets::DatasetSpec;
use engram::store::entities::EntitySpec;
use engram::store::threads::{MessageSpec, ThreadSpec, ThreadUpdate};
use engram::types::{
    DatasetContent, MemoryScope, MessageRole, MessageStatus, MessageUpdate, PageRequest,
    PromptBlockContent,
};
use engram::{BufferedObservationChunk, PgStore, StorageConfig};
use serde_json::{json, Map};
use serial_test::serial;
use std::collections::HashSet;
use uuid::Uuid;

async fn test_store() -> Option<(PgStore, String)> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set; skipping");
            return None;
        }
    };
    let schema = format!("engram_test_{}", Uuid::new_v4().simple());
    let config = StorageConfig {
        database_url: url,
        schema_name: Some(schema.clone()),
        max_connections: 4,
        acquire_timeout_secs: 10,
    };
    let store = PgStore::connect(&config).await.expect("connect and migrate");
    Some((store, schema))
}

async fn drop_schema(store: &PgStore, schema: &str) {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(store.pool())
        .await
        .expect("drop test schema");
}

fn meta(pairs: &[(&str, &str)]) -> Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

/// Type name `information_schema.columns` reports for each semantic type
fn catalog_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Text => "text",
        ColumnType::Integer => "integer",
        ColumnType::BigInt => "bigint",
        ColumnType::Float => "double precision",
        ColumnType::Boolean => "boolean",
        ColumnType::Timestamp => "timestamp without time zone",
        ColumnType::Uuid => "uuid",
        ColumnType::Jsonb => "jsonb",
    }
}

#[tokio::test]
#[serial]
async fn test_migrations_are_idempotent() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    // connect() already migrated once; run twice more against the same
    // namespace and verify the catalog is stable
    let engine = MigrationEngine::new(store.pool().clone(), Some(schema.clone()));
    engine.run().await.expect("second run");
    engine.run().await.expect("third run");

    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = $1",
    )
    .bind(&schema)
    .fetch_one(store.pool())
    .await
    .expect("catalog probe");
    assert_eq!(tables, 9);

    drop_schema(&store, &schema).await;
}

#[tokio::test]
#[serial]
async fn test_migrated_catalog_matches_table_descriptors() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    for table in tables::all_tables() {
        // expected column set: declared columns plus a timezone-aware shadow
        // for every timestamp column
        let mut expected: HashSet<String> = HashSet::new();
        for col in &table.columns {
            expected.insert(col.name.to_string());
            if col.ty == ColumnType::Timestamp {
                expected.insert(shadow_column_name(col.name));
            }
        }

        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT column_name, is_nullable, data_type FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&schema)
        .bind(table.name)
        .fetch_all(store.pool())
        .await
        .expect("column probe");
        let actual: HashSet<String> = rows.iter().map(|(name, _, _)| name.clone()).collect();
        assert_eq!(actual, expected, "column set of {}", table.name);

        for (name, is_nullable, data_type) in &rows {
            let nullable = is_nullable == "YES";
            match table.column(name.as_str()) {
                Some(col) => {
                    assert_eq!(data_type, catalog_type(col.ty), "{}.{name}", table.name);
                    // the backend forces NOT NULL onto primary key members
                    let in_pk = col.primary_key
                        || table
                            .composite_primary_key
                            .is_some_and(|pk| pk.contains(&col.name));
                    assert_eq!(
                        nullable,
                        col.nullable && !in_pk,
                        "nullability of {}.{name}",
                        table.name
                    );
                }
                None => {
                    // shadow columns: timezone-aware and always nullable
                    assert_eq!(data_type, "timestamp with time zone", "{}.{name}", table.name);
                    assert!(nullable, "{}.{name} must be nullable", table.name);
                }
            }
        }

        // every uniqueness constraint, including the deferred one the engine
        // adds after its duplicate probe, exists under its truncated name
        for constraint in table.constraints.iter().chain(table.deferred_constraint()) {
            let name = build_constraint_name(ConstraintName {
                base: constraint.base_name,
                schema: Some(&schema),
                max_bytes: None,
            });
            let present: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = $1)",
            )
            .bind(&name)
            .fetch_one(store.pool())
            .await
            .expect("constraint probe");
            assert!(present, "missing constraint {name}");
        }

        for index in &table.indexes {
            let name = build_constraint_name(ConstraintName {
                base: index.base_name,
                schema: Some(&schema),
                max_bytes: None,
            });
            let present: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE schemaname = $1 AND indexname = $2)",
            )
            .bind(&schema)
            .bind(&name)
            .fetch_one(store.pool())
            .await
            .expect("index probe");
            assert!(present, "missing index {name}");
        }
    }

    drop_schema(&store, &schema).await;
}

#[tokio::test]
#[serial]
async fn test_manual_migration_runs_where_startup_refuses() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    // recreate the legacy state: no uniqueness constraint, duplicate ids
    let constraint = build_constraint_name(ConstraintName {
        base: tables::MESSAGES_ID_UNIQUE,
        schema: Some(&schema),
        max_bytes: None,
    });
    sqlx::query(&format!(
        "ALTER TABLE {schema}.engram_messages DROP CONSTRAINT {constraint}"
    ))
    .execute(store.pool())
    .await
    .expect("drop constraint");
    for status in ["pending", "completed"] {
        sqlx::query(&format!(
            "INSERT INTO {schema}.engram_messages \
             (id, thread_id, resource_id, role, content, status, metadata, \
              created_at, created_at_z, updated_at, updated_at_z) \
             VALUES ('dup-1', 't-1', 'r-1', 'assistant', '{{}}'::jsonb, $1, '{{}}'::jsonb, \
              now(), now(), now(), now())"
        ))
        .bind(status)
        .execute(store.pool())
        .await
        .expect("seed duplicate");
    }

    let config = StorageConfig {
        database_url: std::env::var("TEST_DATABASE_URL").expect("checked above"),
        schema_name: Some(schema.clone()),
        max_connections: 4,
        acquire_timeout_secs: 10,
    };

    // automatic startup refuses and names the operator command
    let err = PgStore::connect(&config)
        .await
        .expect_err("duplicates block startup");
    assert!(err.to_string().contains("engram migrate-messages"), "{err}");

    // the operator path connects without migrating and repairs the table
    let repair = PgStore::connect_unmigrated(&config)
        .await
        .expect("connect unmigrated");
    let engine = MigrationEngine::new(repair.pool().clone(), Some(schema.clone()));
    let report = engine
        .run_structural_migration(&tables::messages_table())
        .await
        .expect("structural migration");
    assert!(report.success);
    assert!(!report.already_migrated);
    assert_eq!(report.duplicates_removed, 1);

    // the finalized row is the survivor
    let status: String = sqlx::query_scalar(&format!(
        "SELECT status FROM {schema}.engram_messages WHERE id = 'dup-1'"
    ))
    .fetch_one(store.pool())
    .await
    .expect("survivor probe");
    assert_eq!(status, "completed");

    // startup now succeeds
    PgStore::connect(&config).await.expect("startup after repair");

    drop_schema(&store, &schema).await;
}

#[tokio::test]
#[serial]
async fn test_thread_and_message_lifecycle() {
    let Some((store, schema)) = test_store().await else {
        return;
    };
    let threads = store.threads();

    let thread = threads
        .create_thread(ThreadSpec {
            id: Some("t-1".into()),
            resource_id: "user-1".into(),
            title: Some("first".into()),
            metadata: meta(&[("origin", "test")]),
        })
        .await
        .expect("create thread");
    assert_eq!(thread.id, "t-1");

    let saved = threads
        .save_messages(vec![
            MessageSpec {
                id: None,
                thread_id: "t-1".into(),
                role: MessageRole::User,
                content: json!({"text": "hello"}),
                status: MessageStatus::Completed,
                metadata: Map::new(),
            },
            MessageSpec {
                id: None,
                thread_id: "t-1".into(),
                role: MessageRole::Assistant,
                content: json!({"text": "hi"}),
                status: MessageStatus::Pending,
                metadata: Map::new(),
            },
        ])
        .await
        .expect("save messages");
    assert_eq!(saved.len(), 2);

    let page = threads.get_messages("t-1", PageRequest::default()).await;
    assert_eq!(page.total, 2);

    // partial update: only metadata merges, role and content survive
    let updated = threads
        .update_message(
            &saved[1].id,
            MessageUpdate {
                role: None,
                content: None,
                status: Some(MessageStatus::Completed),
                metadata: Some(meta(&[("finalized", "yes")])),
            },
        )
        .await
        .expect("update message");
    assert_eq!(updated.role, MessageRole::Assistant);
    assert_eq!(updated.status, MessageStatus::Completed);
    assert_eq!(updated.metadata.get("finalized"), Some(&json!("yes")));

    // metadata merge on the thread keeps unrelated keys
    let merged = threads
        .update_thread(
            "t-1",
            ThreadUpdate {
                title: None,
                metadata: Some(meta(&[("stage", "done")])),
            },
        )
        .await
        .expect("update thread");
    assert_eq!(merged.metadata.get("origin"), Some(&json!("test")));
    assert_eq!(merged.metadata.get("stage"), Some(&json!("done")));
    assert_eq!(merged.title.as_deref(), Some("first"));

    threads.delete_thread("t-1").await.expect("delete thread");
    let page = threads.get_messages("t-1", PageRequest::default()).await;
    assert_eq!(page.total, 0);

    drop_schema(&store, &schema).await;
}

#[tokio::test]
#[serial]
async fn test_scd2_open_row_invariant_and_time_travel() {
    let Some((store, schema)) = test_store().await else {
        return;
    };
    let datasets = store.datasets();

    let (dataset, _definition) = datasets
        .create(DatasetSpec {
            name: "eval-set".into(),
            author_id: None,
            metadata: Map::new(),
            content: DatasetContent {
                description: Some("fixtures".into()),
                item_schema: None,
            },
            change_message: None,
        })
        .await
        .expect("create dataset");
    assert_eq!(dataset.version, 0);

    let added = datasets
        .add_item(dataset.id, Some("item-a".into()), json!({"n": 1}))
        .await
        .expect("add");
    assert_eq!(added.dataset_version, 1);
    let first_version = added.dataset_version;

    let updated = datasets
        .update_item(dataset.id, "item-a", json!({"n": 2}))
        .await
        .expect("update");
    assert!(updated.dataset_version > first_version);
    assert_eq!(updated.created_at, added.created_at);

    let tombstone = datasets
        .delete_item(dataset.id, "item-a")
        .await
        .expect("delete");
    assert!(tombstone.is_deleted);

    // updating a tombstoned item is a user error
    let err = datasets
        .update_item(dataset.id, "item-a", json!({"n": 3}))
        .await
        .expect_err("tombstoned item rejects update");
    assert!(err.is_user_error());

    // revival closes the tombstone and opens a fresh live row
    let revived = datasets
        .add_item(dataset.id, Some("item-a".into()), json!({"n": 4}))
        .await
        .expect("revive");
    assert!(!revived.is_deleted);

    // at most one open row per (dataset, item), ever
    let open_rows: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {schema}.engram_dataset_items \
         WHERE dataset_id = $1 AND item_id = $2 AND valid_to IS NULL"
    ))
    .bind(dataset.id)
    .bind("item-a")
    .fetch_one(store.pool())
    .await
    .expect("open row probe");
    assert_eq!(open_rows, 1);

    // reading as-of the first version still sees the original payload
    let snapshot = datasets
        .get_items_by_version(dataset.id, first_version)
        .await
        .expect("time travel");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].data, json!({"n": 1}));

    // as-of the tombstone's version the item is invisible
    let snapshot = datasets
        .get_items_by_version(dataset.id, tombstone.dataset_version)
        .await
        .expect("time travel at tombstone");
    assert!(snapshot.is_empty());

    let history = datasets
        .get_item_history(dataset.id, "item-a")
        .await
        .expect("history");
    assert_eq!(history.len(), 4);
    let versions: Vec<i64> = history.iter().map(|r| r.dataset_version).collect();
    let mut sorted = versions.clone();
    sorted.sort_unstable();
    assert_eq!(versions, sorted);

    let audit = datasets
        .list_version_audit(dataset.id)
        .await
        .expect("audit");
    assert_eq!(audit.len(), 4);

    drop_schema(&store, &schema).await;
}

#[tokio::test]
#[serial]
async fn test_versioned_entity_publish_flow() {
    let Some((store, schema)) = test_store().await else {
        return;
    };
    let blocks = store.prompt_blocks();

    let (parent, v1) = blocks
        .create(EntitySpec {
            name: "greeting".into(),
            author_id: Some("author-1".into()),
            metadata: Map::new(),
            content: PromptBlockContent {
                text: "Hello {{name}}".into(),
                variables: vec!["name".into()],
                model_hint: None,
            },
            change_message: Some("initial".into()),
        })
        .await
        .expect("create");
    assert_eq!(v1.version_number, 1);
    assert!(parent.active_version_id.is_none());

    let v2 = blocks
        .create_version(
            parent.id,
            &PromptBlockContent {
                text: "Hi {{name}}!".into(),
                variables: vec!["name".into()],
                model_hint: None,
            },
            vec!["text".into()],
            Some("friendlier".into()),
        )
        .await
        .expect("version 2");
    assert_eq!(v2.version_number, 2);

    // publish without an explicit version picks the latest
    let published = blocks.publish(parent.id, None).await.expect("publish");
    assert_eq!(published.active_version_id, Some(v2.id));

    let versions = blocks.list_versions(parent.id).await.expect("list");
    assert_eq!(versions.len(), 2);

    // deleting the parent removes its versions with it
    blocks.delete(parent.id).await.expect("delete");
    let orphans: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {schema}.engram_entity_versions WHERE parent_id = $1"
    ))
    .bind(parent.id)
    .fetch_one(store.pool())
    .await
    .expect("orphan probe");
    assert_eq!(orphans, 0);

    drop_schema(&store, &schema).await;
}

#[tokio::test]
#[serial]
async fn test_observation_buffering_and_activation() {
    let Some((store, schema)) = test_store().await else {
        return;
    };
    let observations = store.observations();
    let scope = MemoryScope::Thread("t-obs".into());

    let record = observations.get_or_create(&scope).await.expect("create");
    let again = observations.get_or_create(&scope).await.expect("get again");
    assert_eq!(record.id, again.id);

    for (i, tokens) in [2000i64, 2500, 3000].into_iter().enumerate() {
        observations
            .append_chunk(
                record.id,
                &BufferedObservationChunk {
                    id: Uuid::new_v4(),
                    cycle_id: format!("cycle-{i}"),
                    observations: format!("observation {i}"),
                    token_count: 100,
                    message_ids: vec![format!("m-{i}")],
                    message_tokens: tokens,
                    last_observed_at: chrono::Utc::now(),
                    created_at: chrono::Utc::now(),
                    suggested_continuation: (i == 2).then(|| "keep going".to_string()),
                    current_task: None,
                },
            )
            .await
            .expect("append");
    }

    let loaded = observations.get(&scope).await.expect("get").expect("exists");
    assert_eq!(loaded.buffered_chunks.len(), 3);
    assert_eq!(loaded.pending_message_tokens, 7500);
    assert!(loaded.is_buffering);

    let outcome = observations
        .activate(
            record.id,
            engram::store::observations::ActivationParams {
                current_pending_tokens: 10_000,
                message_tokens_threshold: 8_000,
                activation_ratio: 0.5,
                force_max_activation: false,
            },
        )
        .await
        .expect("activate");
    assert_eq!(outcome.decision.boundary, 3);
    // hints come only from the newest promoted chunk
    assert_eq!(outcome.suggested_continuation.as_deref(), Some("keep going"));

    let after = observations.get(&scope).await.expect("get").expect("exists");
    assert!(after.buffered_chunks.is_empty());
    assert!(!after.is_buffering);
    assert_eq!(after.observation_token_count, 300);
    assert!(after.active_observations.contains("observation 0"));
    assert!(after.active_observations.contains("observation 2"));
    assert!(after.last_observed_at.is_some());

    // reflection compacts the text into a new generation, keeping lines
    // added past the recorded boundary
    let boundary = observations
        .begin_reflection(record.id)
        .await
        .expect("begin reflection");
    assert_eq!(boundary, 3);
    observations
        .buffer_reflection(record.id, "summary of observations")
        .await
        .expect("buffer reflection");
    let reflected = observations
        .promote_reflection(record.id, 40)
        .await
        .expect("promote reflection");
    assert_eq!(reflected.generation_count, 1);
    assert_eq!(reflected.observation_token_count, 40);
    assert_eq!(reflected.active_observations, "summary of observations");

    drop_schema(&store, &schema).await;
}
