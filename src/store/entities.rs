//! Generic versioned-entity pattern
//!
//! A parent row carries identity, status, and metadata but never content;
//! content lives in immutable version snapshots in the shared
//! `engram_entity_versions` table, numbered contiguously from 1 per parent.
//! Prompt blocks and MCP server definitions are the concrete families here;
//! datasets reuse the same version plumbing through their own store.

use crate::error::{EngramError, Result};
use crate::store::{now_micros, ts_pair, PgStore};
use crate::types::{
    merge_metadata, EntityParent, EntityStatus, EntityUpdate, EntityVersion, Metadata,
    Page, PageRequest, PromptBlockContent, ServerDefinitionContent,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use std::marker::PhantomData;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One family of versioned entities
pub trait EntityFamily: Send + Sync {
    /// Discriminator stored in the shared version table
    const KIND: &'static str;
    /// Entity name used in errors
    const ENTITY: &'static str;
    /// Parent table managed by the migration engine
    const PARENT_TABLE: &'static str;
    /// Typed shape of a version's content snapshot
    type Content: Serialize + DeserializeOwned + Send + Sync;
}

/// Versioned prompt blocks
pub struct PromptBlocks;

impl EntityFamily for PromptBlocks {
    const KIND: &'static str = "prompt_block";
    const ENTITY: &'static str = "prompt block";
    const PARENT_TABLE: &'static str = "engram_prompt_blocks";
    type Content = PromptBlockContent;
}

/// Versioned MCP server definitions
pub struct ServerDefinitions;

impl EntityFamily for ServerDefinitions {
    const KIND: &'static str = "server_definition";
    const ENTITY: &'static str = "server definition";
    const PARENT_TABLE: &'static str = "engram_server_definitions";
    type Content = ServerDefinitionContent;
}

/// Inputs for creating a versioned entity
#[derive(Debug, Clone)]
pub struct EntitySpec<C> {
    pub name: String,
    pub author_id: Option<String>,
    pub metadata: Metadata,
    /// Content snapshot for version 1
    pub content: C,
    pub change_message: Option<String>,
}

const PARENT_COLUMNS: &str = "id, name, status, active_version_id, author_id, metadata, \
     COALESCE(created_at_z, created_at) AS created_at, \
     COALESCE(updated_at_z, updated_at) AS updated_at";

const VERSION_COLUMNS: &str =
    "id, parent_id, parent_kind, version_number, content, changed_fields, change_message, \
     COALESCE(created_at_z, created_at) AS created_at";

pub(crate) fn row_to_parent(row: &PgRow, entity: &'static str) -> Result<EntityParent> {
    let status_raw: String = row
        .try_get("status")
        .map_err(EngramError::db("entities.decode"))?;
    let status = EntityStatus::parse(&status_raw)
        .ok_or_else(|| EngramError::Invariant(format!("unknown {entity} status '{status_raw}'")))?;
    let metadata: Value = row
        .try_get("metadata")
        .map_err(EngramError::db("entities.decode"))?;
    let metadata = match metadata {
        Value::Object(map) => map,
        other => {
            return Err(EngramError::Invariant(format!(
                "{entity} metadata is not a JSON object: {other}"
            )))
        }
    };
    Ok(EntityParent {
        id: row.try_get("id").map_err(EngramError::db("entities.decode"))?,
        name: row.try_get("name").map_err(EngramError::db("entities.decode"))?,
        status,
        active_version_id: row
            .try_get("active_version_id")
            .map_err(EngramError::db("entities.decode"))?,
        author_id: row
            .try_get("author_id")
            .map_err(EngramError::db("entities.decode"))?,
        metadata,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("entities.decode"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(EngramError::db("entities.decode"))?,
    })
}

pub(crate) fn row_to_version(row: &PgRow) -> Result<EntityVersion> {
    let changed_fields: Value = row
        .try_get("changed_fields")
        .map_err(EngramError::db("entities.decode"))?;
    let changed_fields: Vec<String> = serde_json::from_value(changed_fields)?;
    Ok(EntityVersion {
        id: row.try_get("id").map_err(EngramError::db("entities.decode"))?,
        parent_id: row
            .try_get("parent_id")
            .map_err(EngramError::db("entities.decode"))?,
        parent_kind: row
            .try_get("parent_kind")
            .map_err(EngramError::db("entities.decode"))?,
        version_number: row
            .try_get("version_number")
            .map_err(EngramError::db("entities.decode"))?,
        content: row
            .try_get("content")
            .map_err(EngramError::db("entities.decode"))?,
        changed_fields,
        change_message: row
            .try_get("change_message")
            .map_err(EngramError::db("entities.decode"))?,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("entities.decode"))?,
    })
}

/// Insert one version snapshot, numbered contiguously after the parent's
/// current highest. Callers must hold the parent row lock.
pub(crate) async fn insert_version(
    conn: &mut PgConnection,
    versions_table: &str,
    parent_id: Uuid,
    parent_kind: &str,
    content: &Value,
    changed_fields: &[String],
    change_message: Option<&str>,
) -> Result<EntityVersion> {
    let next: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM {versions_table} \
         WHERE parent_id = $1 AND parent_kind = $2"
    ))
    .bind(parent_id)
    .bind(parent_kind)
    .fetch_one(&mut *conn)
    .await
    .map_err(EngramError::db_with("entities.insert_version", parent_id.to_string()))?;

    let id = Uuid::new_v4();
    let now = now_micros();
    let (naive, aware) = ts_pair(now);
    let insert = format!(
        "INSERT INTO {versions_table} \
         (id, parent_id, parent_kind, version_number, content, changed_fields, change_message, created_at, created_at_z) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    );
    sqlx::query(&insert)
        .bind(id)
        .bind(parent_id)
        .bind(parent_kind)
        .bind(next)
        .bind(content)
        .bind(serde_json::to_value(changed_fields)?)
        .bind(change_message)
        .bind(naive)
        .bind(aware)
        .execute(&mut *conn)
        .await
        .map_err(EngramError::db_with("entities.insert_version", id.to_string()))?;

    Ok(EntityVersion {
        id,
        parent_id,
        parent_kind: parent_kind.to_string(),
        version_number: next,
        content: content.clone(),
        changed_fields: changed_fields.to_vec(),
        change_message: change_message.map(str::to_string),
        created_at: now,
    })
}

/// Store for one versioned-entity family
pub struct VersionedEntityStore<F: EntityFamily> {
    store: PgStore,
    _family: PhantomData<F>,
}

impl<F: EntityFamily> VersionedEntityStore<F> {
    pub(crate) fn new(store: PgStore) -> Self {
        VersionedEntityStore {
            store,
            _family: PhantomData,
        }
    }

    fn parent_table(&self) -> String {
        self.store.table(F::PARENT_TABLE)
    }

    fn versions_table(&self) -> String {
        self.store.table("engram_entity_versions")
    }

    /// Decode a version's content snapshot into the family's typed shape
    pub fn decode_content(&self, version: &EntityVersion) -> Result<F::Content> {
        Ok(serde_json::from_value(version.content.clone())?)
    }

    /// Create a parent in `draft` plus version 1 from the content snapshot.
    ///
    /// Identity, author, and metadata live only on the parent; the snapshot
    /// holds content fields only. If the version insert fails the orphaned
    /// parent is best-effort deleted — guarded so it only removes a parent
    /// that is still a draft with no active version — and the original error
    /// is re-raised.
    pub async fn create(&self, spec: EntitySpec<F::Content>) -> Result<(EntityParent, EntityVersion)> {
        let id = Uuid::new_v4();
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let insert_parent = format!(
            "INSERT INTO {} (id, name, status, active_version_id, author_id, metadata, created_at, created_at_z, updated_at, updated_at_z) \
             VALUES ($1, $2, $3, NULL, $4, $5, $6, $7, $6, $7)",
            self.parent_table()
        );
        sqlx::query(&insert_parent)
            .bind(id)
            .bind(&spec.name)
            .bind(EntityStatus::Draft.as_str())
            .bind(&spec.author_id)
            .bind(Value::Object(spec.metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.create", id.to_string()))?;

        let content = serde_json::to_value(&spec.content)?;
        let version = match self.create_version_inner(id, &content, &[], spec.change_message.as_deref()).await {
            Ok(version) => version,
            Err(e) => {
                self.cleanup_orphan_draft(id).await;
                return Err(e);
            }
        };

        debug!(kind = F::KIND, id = %id, "versioned entity created");
        Ok((
            EntityParent {
                id,
                name: spec.name,
                status: EntityStatus::Draft,
                active_version_id: None,
                author_id: spec.author_id,
                metadata: spec.metadata,
                created_at: now,
                updated_at: now,
            },
            version,
        ))
    }

    /// Best-effort removal of a draft parent left behind by a failed create.
    /// Never masks the original error.
    async fn cleanup_orphan_draft(&self, id: Uuid) {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND status = $2 AND active_version_id IS NULL",
            self.parent_table()
        );
        match sqlx::query(&sql)
            .bind(id)
            .bind(EntityStatus::Draft.as_str())
            .execute(self.store.pool())
            .await
        {
            Ok(_) => debug!(kind = F::KIND, id = %id, "orphaned draft cleaned up"),
            Err(e) => warn!(kind = F::KIND, id = %id, error = %e, "orphaned draft cleanup failed"),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<EntityParent> {
        let sql = format!(
            "SELECT {PARENT_COLUMNS} FROM {} WHERE id = $1",
            self.parent_table()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.get", id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: F::ENTITY,
                id: id.to_string(),
            })?;
        row_to_parent(&row, F::ENTITY)
    }

    /// Update parent fields.
    ///
    /// Metadata merges shallowly with caller keys winning; scalar fields are
    /// replaced only when supplied; `updated_at` is always bumped. The row is
    /// locked before reading because the merge happens in process.
    pub async fn update(&self, id: Uuid, update: EntityUpdate) -> Result<EntityParent> {
        let table = self.parent_table();
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("entities.update"))?;

        let select = format!("SELECT {PARENT_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("entities.update", id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: F::ENTITY,
                id: id.to_string(),
            })?;
        let current = row_to_parent(&row, F::ENTITY)?;

        let name = update.name.unwrap_or_else(|| current.name.clone());
        let status = update.status.unwrap_or(current.status);
        let author_id = update.author_id.or_else(|| current.author_id.clone());
        let metadata = match &update.metadata {
            Some(patch) => merge_metadata(&current.metadata, patch),
            None => current.metadata.clone(),
        };
        let now = now_micros();
        let (naive, aware) = ts_pair(now);

        let update_sql = format!(
            "UPDATE {table} SET name = $2, status = $3, author_id = $4, metadata = $5, \
             updated_at = $6, updated_at_z = $7 WHERE id = $1"
        );
        sqlx::query(&update_sql)
            .bind(id)
            .bind(&name)
            .bind(status.as_str())
            .bind(&author_id)
            .bind(Value::Object(metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("entities.update", id.to_string()))?;

        tx.commit().await.map_err(EngramError::db("entities.update"))?;

        Ok(EntityParent {
            name,
            status,
            author_id,
            metadata,
            updated_at: now,
            ..current
        })
    }

    /// Append a new immutable version snapshot for an existing parent
    pub async fn create_version(
        &self,
        parent_id: Uuid,
        content: &F::Content,
        changed_fields: Vec<String>,
        change_message: Option<String>,
    ) -> Result<EntityVersion> {
        let content = serde_json::to_value(content)?;
        self.create_version_inner(parent_id, &content, &changed_fields, change_message.as_deref())
            .await
    }

    async fn create_version_inner(
        &self,
        parent_id: Uuid,
        content: &Value,
        changed_fields: &[String],
        change_message: Option<&str>,
    ) -> Result<EntityVersion> {
        let parent_table = self.parent_table();
        let versions_table = self.versions_table();
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("entities.create_version"))?;

        // Parent lock serializes version numbering, keeping numbers
        // contiguous under concurrent writers.
        let locked: Option<Uuid> = sqlx::query_scalar(&format!(
            "SELECT id FROM {parent_table} WHERE id = $1 FOR UPDATE"
        ))
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(EngramError::db_with("entities.create_version", parent_id.to_string()))?;
        if locked.is_none() {
            return Err(EngramError::NotFound {
                entity: F::ENTITY,
                id: parent_id.to_string(),
            });
        }

        let version = insert_version(
            &mut *tx,
            &versions_table,
            parent_id,
            F::KIND,
            content,
            changed_fields,
            change_message,
        )
        .await?;

        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        sqlx::query(&format!(
            "UPDATE {parent_table} SET updated_at = $2, updated_at_z = $3 WHERE id = $1"
        ))
        .bind(parent_id)
        .bind(naive)
        .bind(aware)
        .execute(&mut *tx)
        .await
        .map_err(EngramError::db_with("entities.create_version", parent_id.to_string()))?;

        tx.commit()
            .await
            .map_err(EngramError::db("entities.create_version"))?;
        Ok(version)
    }

    pub async fn get_version(&self, version_id: Uuid) -> Result<EntityVersion> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM {} WHERE id = $1 AND parent_kind = $2",
            self.versions_table()
        );
        let row = sqlx::query(&sql)
            .bind(version_id)
            .bind(F::KIND)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.get_version", version_id.to_string()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "entity version",
                id: version_id.to_string(),
            })?;
        row_to_version(&row)
    }

    /// All versions of one parent, oldest first
    pub async fn list_versions(&self, parent_id: Uuid) -> Result<Vec<EntityVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM {} WHERE parent_id = $1 AND parent_kind = $2 \
             ORDER BY version_number",
            self.versions_table()
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .bind(F::KIND)
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.list_versions", parent_id.to_string()))?;
        rows.iter().map(row_to_version).collect()
    }

    /// Publish a parent, activating the given version (or its newest one).
    ///
    /// The activated version must belong to this parent; activating another
    /// parent's version is rejected as caller error.
    pub async fn publish(&self, id: Uuid, version_id: Option<Uuid>) -> Result<EntityParent> {
        let versions_table = self.versions_table();
        let target: Option<Uuid> = match version_id {
            Some(vid) => sqlx::query_scalar(&format!(
                "SELECT id FROM {versions_table} WHERE id = $1 AND parent_id = $2 AND parent_kind = $3"
            ))
            .bind(vid)
            .bind(id)
            .bind(F::KIND)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.publish", id.to_string()))?,
            None => sqlx::query_scalar(&format!(
                "SELECT id FROM {versions_table} WHERE parent_id = $1 AND parent_kind = $2 \
                 ORDER BY version_number DESC LIMIT 1"
            ))
            .bind(id)
            .bind(F::KIND)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.publish", id.to_string()))?,
        };
        let Some(target) = target else {
            return Err(EngramError::InvalidInput(format!(
                "version {version_id:?} does not belong to {} {id}",
                F::ENTITY
            )));
        };

        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "UPDATE {} SET status = $2, active_version_id = $3, updated_at = $4, updated_at_z = $5 \
             WHERE id = $1",
            self.parent_table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(EntityStatus::Published.as_str())
            .bind(target)
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.publish", id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: F::ENTITY,
                id: id.to_string(),
            });
        }
        self.get(id).await
    }

    /// Move a parent to `archived`. The active version pointer is kept so an
    /// archived entity can still be read at its published content.
    pub async fn archive(&self, id: Uuid) -> Result<EntityParent> {
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "UPDATE {} SET status = $2, updated_at = $3, updated_at_z = $4 WHERE id = $1",
            self.parent_table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(EntityStatus::Archived.as_str())
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("entities.archive", id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: F::ENTITY,
                id: id.to_string(),
            });
        }
        self.get(id).await
    }

    /// Delete a parent and all its versions in one transaction.
    ///
    /// Two explicit statements — versions first, then the parent. The shared
    /// version table has no FK cascade, so this is the only delete path.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("entities.delete"))?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE parent_id = $1 AND parent_kind = $2",
            self.versions_table()
        ))
        .bind(id)
        .bind(F::KIND)
        .execute(&mut *tx)
        .await
        .map_err(EngramError::db_with("entities.delete", id.to_string()))?;

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.parent_table()
        ))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(EngramError::db_with("entities.delete", id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: F::ENTITY,
                id: id.to_string(),
            });
        }

        tx.commit().await.map_err(EngramError::db("entities.delete"))?;
        debug!(kind = F::KIND, id = %id, "versioned entity deleted");
        Ok(())
    }

    /// List parents, most recently updated first; empty shape on failure
    pub async fn list(&self, page: PageRequest) -> Page<EntityParent> {
        match self.try_list(page).await {
            Ok(result) => result,
            Err(e) => {
                error!(kind = F::KIND, error = %e, "listing entities failed");
                Page::empty()
            }
        }
    }

    async fn try_list(&self, page: PageRequest) -> Result<Page<EntityParent>> {
        if page.page < 0 || page.per_page <= 0 {
            return Err(EngramError::InvalidInput(format!(
                "invalid page request: page={}, per_page={}",
                page.page, page.per_page
            )));
        }
        let table = self.parent_table();
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.store.pool())
            .await
            .map_err(EngramError::db("entities.list"))?;
        let sql = format!(
            "SELECT {PARENT_COLUMNS} FROM {table} \
             ORDER BY COALESCE(updated_at_z, updated_at) DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(page.per_page)
            .bind(page.offset())
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db("entities.list"))?;
        let items = rows
            .iter()
            .map(|row| row_to_parent(row, F::ENTITY))
            .collect::<Result<Vec<_>>>()?;
        let has_more = page.offset() + (items.len() as i64) < total;
        Ok(Page {
            items,
            total,
            has_more,
        })
    }
}
