//! Versioned datasets with slowly-changing-dimension (SCD-2) items
//!
//! Item history is preserved as open/closed validity intervals instead of
//! overwrites: rows sharing an `item_id` are totally ordered by
//! `dataset_version`, at most one row per id is open (`valid_to IS NULL`),
//! and a deleted item keeps an open tombstone row. Every mutation bumps the
//! dataset's `version` counter exactly once inside its transaction — that
//! atomic increment is the serialization point that totally orders concurrent
//! mutations on the same dataset — and writes one audit row.

use crate::error::{EngramError, Result};
use crate::store::entities::{insert_version, row_to_version};
use crate::store::{now_micros, ts_pair, PgStore};
use crate::types::{
    merge_metadata, Dataset, DatasetChange, DatasetContent, DatasetItemRow, DatasetVersionAudit,
    EntityStatus, EntityUpdate, EntityVersion, Metadata, Page, PageRequest,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, Row, Transaction};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Discriminator for dataset definition snapshots in the shared version table
const DATASET_KIND: &str = "dataset";

/// Inputs for creating a dataset
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub name: String,
    pub author_id: Option<String>,
    pub metadata: Metadata,
    pub content: DatasetContent,
    pub change_message: Option<String>,
}

const DATASET_COLUMNS: &str =
    "id, name, description, status, active_version_id, author_id, metadata, version, \
     COALESCE(created_at_z, created_at) AS created_at, \
     COALESCE(updated_at_z, updated_at) AS updated_at";

const ITEM_COLUMNS: &str =
    "row_id, dataset_id, item_id, data, dataset_version, valid_to, is_deleted, \
     COALESCE(created_at_z, created_at) AS created_at, \
     COALESCE(updated_at_z, updated_at) AS updated_at";

fn row_to_dataset(row: &PgRow) -> Result<Dataset> {
    let status_raw: String = row
        .try_get("status")
        .map_err(EngramError::db("datasets.decode"))?;
    let status = EntityStatus::parse(&status_raw)
        .ok_or_else(|| EngramError::Invariant(format!("unknown dataset status '{status_raw}'")))?;
    let metadata: Value = row
        .try_get("metadata")
        .map_err(EngramError::db("datasets.decode"))?;
    let metadata = match metadata {
        Value::Object(map) => map,
        other => {
            return Err(EngramError::Invariant(format!(
                "dataset metadata is not a JSON object: {other}"
            )))
        }
    };
    Ok(Dataset {
        id: row.try_get("id").map_err(EngramError::db("datasets.decode"))?,
        name: row.try_get("name").map_err(EngramError::db("datasets.decode"))?,
        description: row
            .try_get("description")
            .map_err(EngramError::db("datasets.decode"))?,
        status,
        active_version_id: row
            .try_get("active_version_id")
            .map_err(EngramError::db("datasets.decode"))?,
        author_id: row
            .try_get("author_id")
            .map_err(EngramError::db("datasets.decode"))?,
        metadata,
        version: row
            .try_get("version")
            .map_err(EngramError::db("datasets.decode"))?,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("datasets.decode"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(EngramError::db("datasets.decode"))?,
    })
}

fn row_to_item(row: &PgRow) -> Result<DatasetItemRow> {
    Ok(DatasetItemRow {
        row_id: row.try_get("row_id").map_err(EngramError::db("datasets.decode"))?,
        dataset_id: row
            .try_get("dataset_id")
            .map_err(EngramError::db("datasets.decode"))?,
        item_id: row
            .try_get("item_id")
            .map_err(EngramError::db("datasets.decode"))?,
        data: row.try_get("data").map_err(EngramError::db("datasets.decode"))?,
        dataset_version: row
            .try_get("dataset_version")
            .map_err(EngramError::db("datasets.decode"))?,
        valid_to: row
            .try_get("valid_to")
            .map_err(EngramError::db("datasets.decode"))?,
        is_deleted: row
            .try_get("is_deleted")
            .map_err(EngramError::db("datasets.decode"))?,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("datasets.decode"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(EngramError::db("datasets.decode"))?,
    })
}

/// Store for datasets, their SCD-2 items, and the version audit log
pub struct DatasetStore {
    store: PgStore,
}

impl DatasetStore {
    pub(crate) fn new(store: PgStore) -> Self {
        DatasetStore { store }
    }

    fn datasets_table(&self) -> String {
        self.store.table("engram_datasets")
    }

    fn items_table(&self) -> String {
        self.store.table("engram_dataset_items")
    }

    fn audit_table(&self) -> String {
        self.store.table("engram_dataset_versions")
    }

    fn versions_table(&self) -> String {
        self.store.table("engram_entity_versions")
    }

    // -- dataset definition (versioned-entity pattern) ----------------------

    /// Create a dataset: draft parent plus definition version 1.
    ///
    /// Same discipline as every versioned entity — a failure after the
    /// parent insert best-effort deletes the still-draft orphan and
    /// re-raises.
    pub async fn create(&self, spec: DatasetSpec) -> Result<(Dataset, EntityVersion)> {
        let id = Uuid::new_v4();
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let insert = format!(
            "INSERT INTO {} (id, name, description, status, active_version_id, author_id, metadata, version, created_at, created_at_z, updated_at, updated_at_z) \
             VALUES ($1, $2, $3, $4, NULL, $5, $6, 0, $7, $8, $7, $8)",
            self.datasets_table()
        );
        sqlx::query(&insert)
            .bind(id)
            .bind(&spec.name)
            .bind(&spec.content.description)
            .bind(EntityStatus::Draft.as_str())
            .bind(&spec.author_id)
            .bind(Value::Object(spec.metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.create", id.to_string()))?;

        let content = serde_json::to_value(&spec.content)?;
        let version = match self.insert_definition_version(id, &content, spec.change_message.as_deref()).await {
            Ok(version) => version,
            Err(e) => {
                self.cleanup_orphan_draft(id).await;
                return Err(e);
            }
        };

        debug!(dataset_id = %id, "dataset created");
        Ok((
            Dataset {
                id,
                name: spec.name,
                description: spec.content.description.clone(),
                status: EntityStatus::Draft,
                active_version_id: None,
                author_id: spec.author_id,
                metadata: spec.metadata,
                version: 0,
                created_at: now,
                updated_at: now,
            },
            version,
        ))
    }

    async fn insert_definition_version(
        &self,
        dataset_id: Uuid,
        content: &Value,
        change_message: Option<&str>,
    ) -> Result<EntityVersion> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("datasets.create"))?;
        let versions_table = self.versions_table();
        let version = insert_version(
            &mut *tx,
            &versions_table,
            dataset_id,
            DATASET_KIND,
            content,
            &[],
            change_message,
        )
        .await?;
        tx.commit().await.map_err(EngramError::db("datasets.create"))?;
        Ok(version)
    }

    async fn cleanup_orphan_draft(&self, id: Uuid) {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND status = $2 AND active_version_id IS NULL",
            self.datasets_table()
        );
        match sqlx::query(&sql)
            .bind(id)
            .bind(EntityStatus::Draft.as_str())
            .execute(self.store.pool())
            .await
        {
            Ok(_) => debug!(dataset_id = %id, "orphaned draft dataset cleaned up"),
            Err(e) => warn!(dataset_id = %id, error = %e, "orphaned draft cleanup failed"),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Dataset> {
        let sql = format!(
            "SELECT {DATASET_COLUMNS} FROM {} WHERE id = $1",
            self.datasets_table()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.get", id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "dataset",
                id: id.to_string(),
            })?;
        row_to_dataset(&row)
    }

    /// Update dataset parent fields; metadata merges shallowly under a row
    /// lock, `updated_at` always bumps, NOT_FOUND when missing.
    pub async fn update(&self, id: Uuid, update: EntityUpdate, description: Option<String>) -> Result<Dataset> {
        let table = self.datasets_table();
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("datasets.update"))?;

        let select = format!("SELECT {DATASET_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("datasets.update", id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "dataset",
                id: id.to_string(),
            })?;
        let current = row_to_dataset(&row)?;

        let name = update.name.unwrap_or_else(|| current.name.clone());
        let status = update.status.unwrap_or(current.status);
        let author_id = update.author_id.or_else(|| current.author_id.clone());
        let description = description.or_else(|| current.description.clone());
        let metadata = match &update.metadata {
            Some(patch) => merge_metadata(&current.metadata, patch),
            None => current.metadata.clone(),
        };
        let now = now_micros();
        let (naive, aware) = ts_pair(now);

        let update_sql = format!(
            "UPDATE {table} SET name = $2, description = $3, status = $4, author_id = $5, \
             metadata = $6, updated_at = $7, updated_at_z = $8 WHERE id = $1"
        );
        sqlx::query(&update_sql)
            .bind(id)
            .bind(&name)
            .bind(&description)
            .bind(status.as_str())
            .bind(&author_id)
            .bind(Value::Object(metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("datasets.update", id.to_string()))?;
        tx.commit().await.map_err(EngramError::db("datasets.update"))?;

        Ok(Dataset {
            name,
            description,
            status,
            author_id,
            metadata,
            updated_at: now,
            ..current
        })
    }

    /// Delete a dataset with its items, audit rows, and definition versions.
    ///
    /// One transaction, explicit statement-per-table cascade.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("datasets.delete"))?;

        for sql in [
            format!("DELETE FROM {} WHERE dataset_id = $1", self.items_table()),
            format!("DELETE FROM {} WHERE dataset_id = $1", self.audit_table()),
            format!(
                "DELETE FROM {} WHERE parent_id = $1 AND parent_kind = '{DATASET_KIND}'",
                self.versions_table()
            ),
        ] {
            sqlx::query(&sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(EngramError::db_with("datasets.delete", id.to_string()))?;
        }

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.datasets_table()
        ))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(EngramError::db_with("datasets.delete", id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: "dataset",
                id: id.to_string(),
            });
        }

        tx.commit().await.map_err(EngramError::db("datasets.delete"))?;
        debug!(dataset_id = %id, "dataset deleted");
        Ok(())
    }

    // -- SCD-2 item mutations ----------------------------------------------

    /// Atomically bump and return the dataset's version counter.
    ///
    /// This single `UPDATE ... RETURNING` both serializes concurrent
    /// mutations (the row lock is held to commit) and allocates the new
    /// version number.
    async fn bump_version(&self, tx: &mut PgConnection, dataset_id: Uuid) -> Result<i64> {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        sqlx::query_scalar(&format!(
            "UPDATE {} SET version = version + 1, updated_at = $2, updated_at_z = $3 \
             WHERE id = $1 RETURNING version",
            self.datasets_table()
        ))
        .bind(dataset_id)
        .bind(naive)
        .bind(aware)
        .fetch_optional(&mut *tx)
        .await
        .map_err(EngramError::db_with("datasets.bump_version", dataset_id.to_string()))?
        .ok_or_else(|| EngramError::NotFound {
            entity: "dataset",
            id: dataset_id.to_string(),
        })
    }

    /// Close the open row for an item, returning its `(created_at, data)`.
    ///
    /// `require_live` restricts closing to non-tombstone rows (update/delete
    /// semantics); add closes whatever open row exists, reviving deleted
    /// items.
    async fn close_open_row(
        &self,
        tx: &mut PgConnection,
        dataset_id: Uuid,
        item_id: &str,
        new_version: i64,
        require_live: bool,
    ) -> Result<Option<(DateTime<Utc>, Value)>> {
        let guard = if require_live { " AND is_deleted = FALSE" } else { "" };
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "UPDATE {} SET valid_to = $3, updated_at = $4, updated_at_z = $5 \
             WHERE dataset_id = $1 AND item_id = $2 AND valid_to IS NULL{guard} \
             RETURNING COALESCE(created_at_z, created_at) AS created_at, data",
            self.items_table()
        );
        let row = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(item_id)
            .bind(new_version)
            .bind(naive)
            .bind(aware)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("datasets.close_open_row", item_id))?;
        match row {
            Some(row) => Ok(Some((
                row.try_get("created_at")
                    .map_err(EngramError::db("datasets.close_open_row"))?,
                row.try_get("data")
                    .map_err(EngramError::db("datasets.close_open_row"))?,
            ))),
            None => Ok(None),
        }
    }

    /// Insert the new current row, preserving the logical item's original
    /// creation time across supersessions.
    #[allow(clippy::too_many_arguments)]
    async fn insert_current_row(
        &self,
        tx: &mut PgConnection,
        dataset_id: Uuid,
        item_id: &str,
        data: &Value,
        dataset_version: i64,
        is_deleted: bool,
        created_at: DateTime<Utc>,
    ) -> Result<DatasetItemRow> {
        let row_id = Uuid::new_v4();
        let now = now_micros();
        let (created_naive, created_aware) = ts_pair(created_at);
        let (updated_naive, updated_aware) = ts_pair(now);
        let sql = format!(
            "INSERT INTO {} (row_id, dataset_id, item_id, data, dataset_version, valid_to, is_deleted, created_at, created_at_z, updated_at, updated_at_z) \
             VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $8, $9, $10)",
            self.items_table()
        );
        sqlx::query(&sql)
            .bind(row_id)
            .bind(dataset_id)
            .bind(item_id)
            .bind(data)
            .bind(dataset_version)
            .bind(is_deleted)
            .bind(created_naive)
            .bind(created_aware)
            .bind(updated_naive)
            .bind(updated_aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("datasets.insert_current_row", item_id))?;
        Ok(DatasetItemRow {
            row_id,
            dataset_id,
            item_id: item_id.to_string(),
            data: data.clone(),
            dataset_version,
            valid_to: None,
            is_deleted,
            created_at: created_aware,
            updated_at: updated_aware,
        })
    }

    async fn insert_audit_row(
        &self,
        tx: &mut PgConnection,
        dataset_id: Uuid,
        version: i64,
        change: DatasetChange,
        item_ids: &[String],
    ) -> Result<()> {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "INSERT INTO {} (dataset_id, version, id, change, item_ids, created_at, created_at_z) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.audit_table()
        );
        sqlx::query(&sql)
            .bind(dataset_id)
            .bind(version)
            .bind(Uuid::new_v4())
            .bind(change.as_str())
            .bind(serde_json::to_value(item_ids)?)
            .bind(naive)
            .bind(aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("datasets.insert_audit_row", dataset_id.to_string()))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("datasets.begin"))
    }

    /// Add (or revive) an item as the new current row
    pub async fn add_item(
        &self,
        dataset_id: Uuid,
        item_id: Option<String>,
        data: Value,
    ) -> Result<DatasetItemRow> {
        let item_id = item_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut tx = self.begin().await?;

        let new_version = self.bump_version(&mut *tx, dataset_id).await?;
        // an existing open row (live or tombstone) is superseded
        let closed = self
            .close_open_row(&mut *tx, dataset_id, &item_id, new_version, false)
            .await?;
        let created_at = closed.as_ref().map(|(at, _)| *at).unwrap_or_else(now_micros);
        let row = self
            .insert_current_row(&mut *tx, dataset_id, &item_id, &data, new_version, false, created_at)
            .await?;
        self.insert_audit_row(
            &mut *tx,
            dataset_id,
            new_version,
            DatasetChange::AddItem,
            std::slice::from_ref(&item_id),
        )
        .await?;

        tx.commit().await.map_err(EngramError::db("datasets.add_item"))?;
        Ok(row)
    }

    /// Supersede the current row of a live item with new data
    pub async fn update_item(
        &self,
        dataset_id: Uuid,
        item_id: &str,
        data: Value,
    ) -> Result<DatasetItemRow> {
        let mut tx = self.begin().await?;

        let new_version = self.bump_version(&mut *tx, dataset_id).await?;
        let closed = self
            .close_open_row(&mut *tx, dataset_id, item_id, new_version, true)
            .await?;
        let created_at = match closed {
            Some((at, _)) => at,
            // no open live row: the item is unknown or tombstoned
            None => {
                return Err(EngramError::NotFound {
                    entity: "dataset item",
                    id: item_id.to_string(),
                })
            }
        };
        let row = self
            .insert_current_row(&mut *tx, dataset_id, item_id, &data, new_version, false, created_at)
            .await?;
        self.insert_audit_row(
            &mut *tx,
            dataset_id,
            new_version,
            DatasetChange::UpdateItem,
            &[item_id.to_string()],
        )
        .await?;

        tx.commit().await.map_err(EngramError::db("datasets.update_item"))?;
        Ok(row)
    }

    /// Tombstone a live item: its current row closes and a new open row with
    /// `is_deleted = true` takes its place, keeping the history addressable.
    pub async fn delete_item(&self, dataset_id: Uuid, item_id: &str) -> Result<DatasetItemRow> {
        let mut tx = self.begin().await?;

        let new_version = self.bump_version(&mut *tx, dataset_id).await?;
        let closed = self
            .close_open_row(&mut *tx, dataset_id, item_id, new_version, true)
            .await?;
        let (created_at, data) = match closed {
            Some(pair) => pair,
            None => {
                return Err(EngramError::NotFound {
                    entity: "dataset item",
                    id: item_id.to_string(),
                })
            }
        };
        let row = self
            .insert_current_row(&mut *tx, dataset_id, item_id, &data, new_version, true, created_at)
            .await?;
        self.insert_audit_row(
            &mut *tx,
            dataset_id,
            new_version,
            DatasetChange::DeleteItem,
            &[item_id.to_string()],
        )
        .await?;

        tx.commit().await.map_err(EngramError::db("datasets.delete_item"))?;
        Ok(row)
    }

    /// Insert many items under a single version bump and one audit row
    pub async fn batch_add(
        &self,
        dataset_id: Uuid,
        items: Vec<(Option<String>, Value)>,
    ) -> Result<Vec<DatasetItemRow>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.begin().await?;

        let new_version = self.bump_version(&mut *tx, dataset_id).await?;
        let mut rows = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        for (item_id, data) in items {
            let item_id = item_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let closed = self
                .close_open_row(&mut *tx, dataset_id, &item_id, new_version, false)
                .await?;
            let created_at = closed.as_ref().map(|(at, _)| *at).unwrap_or_else(now_micros);
            rows.push(
                self.insert_current_row(&mut *tx, dataset_id, &item_id, &data, new_version, false, created_at)
                    .await?,
            );
            ids.push(item_id);
        }
        self.insert_audit_row(&mut *tx, dataset_id, new_version, DatasetChange::BatchAdd, &ids)
            .await?;

        tx.commit().await.map_err(EngramError::db("datasets.batch_add"))?;
        debug!(dataset_id = %dataset_id, count = rows.len(), version = new_version, "batch add");
        Ok(rows)
    }

    /// Tombstone many items under a single version bump.
    ///
    /// Unknown or already-deleted ids are skipped rather than failing the
    /// batch; the audit row records only the ids actually tombstoned.
    pub async fn batch_delete(&self, dataset_id: Uuid, item_ids: Vec<String>) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin().await?;

        let new_version = self.bump_version(&mut *tx, dataset_id).await?;
        let mut deleted = Vec::new();
        for item_id in &item_ids {
            let closed = self
                .close_open_row(&mut *tx, dataset_id, item_id, new_version, true)
                .await?;
            if let Some((created_at, data)) = closed {
                self.insert_current_row(&mut *tx, dataset_id, item_id, &data, new_version, true, created_at)
                    .await?;
                deleted.push(item_id.clone());
            }
        }
        self.insert_audit_row(&mut *tx, dataset_id, new_version, DatasetChange::BatchDelete, &deleted)
            .await?;

        tx.commit().await.map_err(EngramError::db("datasets.batch_delete"))?;
        Ok(deleted.len() as u64)
    }

    // -- reads --------------------------------------------------------------

    /// The current (live) row of one item
    pub async fn get_item(&self, dataset_id: Uuid, item_id: &str) -> Result<DatasetItemRow> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM {} \
             WHERE dataset_id = $1 AND item_id = $2 AND valid_to IS NULL AND is_deleted = FALSE",
            self.items_table()
        );
        let row = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(item_id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.get_item", item_id))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "dataset item",
                id: item_id.to_string(),
            })?;
        row_to_item(&row)
    }

    /// Current live items; empty shape on failure
    pub async fn list_items(&self, dataset_id: Uuid, page: PageRequest) -> Page<DatasetItemRow> {
        match self.try_list_items(dataset_id, page).await {
            Ok(result) => result,
            Err(e) => {
                error!(dataset_id = %dataset_id, error = %e, "listing dataset items failed");
                Page::empty()
            }
        }
    }

    async fn try_list_items(
        &self,
        dataset_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<DatasetItemRow>> {
        if page.page < 0 || page.per_page <= 0 {
            return Err(EngramError::InvalidInput(format!(
                "invalid page request: page={}, per_page={}",
                page.page, page.per_page
            )));
        }
        let table = self.items_table();
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} \
             WHERE dataset_id = $1 AND valid_to IS NULL AND is_deleted = FALSE"
        ))
        .bind(dataset_id)
        .fetch_one(self.store.pool())
        .await
        .map_err(EngramError::db_with("datasets.list_items", dataset_id.to_string()))?;

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM {table} \
             WHERE dataset_id = $1 AND valid_to IS NULL AND is_deleted = FALSE \
             ORDER BY item_id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(page.per_page)
            .bind(page.offset())
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.list_items", dataset_id.to_string()))?;
        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>>>()?;
        let has_more = page.offset() + (items.len() as i64) < total;
        Ok(Page {
            items,
            total,
            has_more,
        })
    }

    /// Time-travel read: the dataset's state as of version `v`.
    ///
    /// A row is visible at `v` when it was opened at or before `v` and not
    /// yet closed by `v`: `dataset_version <= v AND (valid_to IS NULL OR
    /// valid_to > v)`, excluding tombstones.
    pub async fn get_items_by_version(
        &self,
        dataset_id: Uuid,
        version: i64,
    ) -> Result<Vec<DatasetItemRow>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM {} \
             WHERE dataset_id = $1 AND dataset_version <= $2 \
               AND (valid_to IS NULL OR valid_to > $2) AND is_deleted = FALSE \
             ORDER BY item_id",
            self.items_table()
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(version)
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.get_items_by_version", dataset_id.to_string()))?;
        rows.iter().map(row_to_item).collect()
    }

    /// Full history of one item, oldest first
    pub async fn get_item_history(
        &self,
        dataset_id: Uuid,
        item_id: &str,
    ) -> Result<Vec<DatasetItemRow>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM {} \
             WHERE dataset_id = $1 AND item_id = $2 ORDER BY dataset_version",
            self.items_table()
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(item_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.get_item_history", item_id))?;
        rows.iter().map(row_to_item).collect()
    }

    /// Audit rows for a dataset, newest first
    pub async fn list_version_audit(&self, dataset_id: Uuid) -> Result<Vec<DatasetVersionAudit>> {
        let sql = format!(
            "SELECT id, dataset_id, version, change, item_ids, \
             COALESCE(created_at_z, created_at) AS created_at \
             FROM {} WHERE dataset_id = $1 ORDER BY version DESC",
            self.audit_table()
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.list_version_audit", dataset_id.to_string()))?;
        rows.iter()
            .map(|row| {
                let change_raw: String = row
                    .try_get("change")
                    .map_err(EngramError::db("datasets.decode"))?;
                let change = DatasetChange::parse(&change_raw).ok_or_else(|| {
                    EngramError::Invariant(format!("unknown dataset change '{change_raw}'"))
                })?;
                let item_ids: Value = row
                    .try_get("item_ids")
                    .map_err(EngramError::db("datasets.decode"))?;
                Ok(DatasetVersionAudit {
                    id: row.try_get("id").map_err(EngramError::db("datasets.decode"))?,
                    dataset_id: row
                        .try_get("dataset_id")
                        .map_err(EngramError::db("datasets.decode"))?,
                    version: row
                        .try_get("version")
                        .map_err(EngramError::db("datasets.decode"))?,
                    change,
                    item_ids: serde_json::from_value(item_ids)?,
                    created_at: row
                        .try_get("created_at")
                        .map_err(EngramError::db("datasets.decode"))?,
                })
            })
            .collect()
    }

    /// Definition versions (the versioned-entity side of a dataset)
    pub async fn list_definition_versions(&self, dataset_id: Uuid) -> Result<Vec<EntityVersion>> {
        let sql = format!(
            "SELECT id, parent_id, parent_kind, version_number, content, changed_fields, change_message, \
             COALESCE(created_at_z, created_at) AS created_at \
             FROM {} WHERE parent_id = $1 AND parent_kind = '{DATASET_KIND}' ORDER BY version_number",
            self.versions_table()
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("datasets.list_definition_versions", dataset_id.to_string()))?;
        rows.iter().map(row_to_version).collect()
    }
}
