//! Conversational memory: threads and their append-only message logs

use crate::error::{EngramError, Result};
use crate::store::{now_micros, ts_pair, PgStore};
use crate::types::{
    merge_metadata, MemoryScope, Message, MessageRole, MessageStatus, MessageUpdate, Metadata,
    Page, PageRequest, Thread,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, error};
use uuid::Uuid;

/// Inputs for creating a thread
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    /// Caller-assigned id; generated when absent
    pub id: Option<String>,
    pub resource_id: String,
    pub title: Option<String>,
    pub metadata: Metadata,
}

/// Partial thread update; metadata merges shallowly, caller keys win
#[derive(Debug, Clone, Default)]
pub struct ThreadUpdate {
    pub title: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Inputs for appending one message
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub id: Option<String>,
    pub thread_id: String,
    pub role: MessageRole,
    pub content: Value,
    pub status: MessageStatus,
    pub metadata: Metadata,
}

const THREAD_COLUMNS: &str = "id, resource_id, title, metadata, \
     COALESCE(created_at_z, created_at) AS created_at, \
     COALESCE(updated_at_z, updated_at) AS updated_at";

const MESSAGE_COLUMNS: &str = "id, thread_id, resource_id, role, content, status, metadata, \
     COALESCE(created_at_z, created_at) AS created_at, \
     COALESCE(updated_at_z, updated_at) AS updated_at";

fn row_to_thread(row: &PgRow) -> Result<Thread> {
    let metadata: Value = row.try_get("metadata").map_err(EngramError::db("threads.decode"))?;
    let metadata = match metadata {
        Value::Object(map) => map,
        other => {
            return Err(EngramError::Invariant(format!(
                "thread metadata is not a JSON object: {other}"
            )))
        }
    };
    Ok(Thread {
        id: row.try_get("id").map_err(EngramError::db("threads.decode"))?,
        resource_id: row
            .try_get("resource_id")
            .map_err(EngramError::db("threads.decode"))?,
        title: row.try_get("title").map_err(EngramError::db("threads.decode"))?,
        metadata,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("threads.decode"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(EngramError::db("threads.decode"))?,
    })
}

fn row_to_message(row: &PgRow) -> Result<Message> {
    let role_raw: String = row.try_get("role").map_err(EngramError::db("messages.decode"))?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| EngramError::Invariant(format!("unknown message role '{role_raw}'")))?;
    let status_raw: String = row
        .try_get("status")
        .map_err(EngramError::db("messages.decode"))?;
    let status = MessageStatus::parse(&status_raw)
        .ok_or_else(|| EngramError::Invariant(format!("unknown message status '{status_raw}'")))?;
    let metadata: Value = row
        .try_get("metadata")
        .map_err(EngramError::db("messages.decode"))?;
    let metadata = match metadata {
        Value::Object(map) => map,
        other => {
            return Err(EngramError::Invariant(format!(
                "message metadata is not a JSON object: {other}"
            )))
        }
    };
    Ok(Message {
        id: row.try_get("id").map_err(EngramError::db("messages.decode"))?,
        thread_id: row
            .try_get("thread_id")
            .map_err(EngramError::db("messages.decode"))?,
        resource_id: row
            .try_get("resource_id")
            .map_err(EngramError::db("messages.decode"))?,
        role,
        content: row
            .try_get("content")
            .map_err(EngramError::db("messages.decode"))?,
        status,
        metadata,
        created_at: row
            .try_get("created_at")
            .map_err(EngramError::db("messages.decode"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(EngramError::db("messages.decode"))?,
    })
}

/// Store for threads and messages
pub struct ThreadStore {
    store: PgStore,
}

impl ThreadStore {
    pub(crate) fn new(store: PgStore) -> Self {
        ThreadStore { store }
    }

    /// Create a thread, generating an id when the caller supplies none
    pub async fn create_thread(&self, spec: ThreadSpec) -> Result<Thread> {
        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = now_micros();
        let (naive, aware) = ts_pair(now);
        let sql = format!(
            "INSERT INTO {} (id, resource_id, title, metadata, created_at, created_at_z, updated_at, updated_at_z) \
             VALUES ($1, $2, $3, $4, $5, $6, $5, $6)",
            self.store.table("engram_threads")
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(&spec.resource_id)
            .bind(&spec.title)
            .bind(Value::Object(spec.metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(self.store.pool())
            .await
            .map_err(EngramError::db_with("threads.create_thread", id.clone()))?;
        debug!(thread_id = %id, resource_id = %spec.resource_id, "thread created");
        Ok(Thread {
            id,
            resource_id: spec.resource_id,
            title: spec.title,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_thread(&self, id: &str) -> Result<Thread> {
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM {} WHERE id = $1",
            self.store.table("engram_threads")
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(EngramError::db_with("threads.get_thread", id))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "thread",
                id: id.to_string(),
            })?;
        row_to_thread(&row)
    }

    /// Update a thread's title and/or metadata.
    ///
    /// The metadata merge is a read-merge-write, so the row is locked with
    /// `FOR UPDATE` before reading to keep two concurrent merges from
    /// clobbering each other. `updated_at` is always bumped.
    pub async fn update_thread(&self, id: &str, update: ThreadUpdate) -> Result<Thread> {
        let table = self.store.table("engram_threads");
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("threads.update_thread"))?;

        let select = format!("SELECT {THREAD_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("threads.update_thread", id))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "thread",
                id: id.to_string(),
            })?;
        let current = row_to_thread(&row)?;

        let metadata = match &update.metadata {
            Some(patch) => merge_metadata(&current.metadata, patch),
            None => current.metadata.clone(),
        };
        let title = update.title.or(current.title);
        let now = now_micros();
        let (naive, aware) = ts_pair(now);

        let update_sql = format!(
            "UPDATE {table} SET title = $2, metadata = $3, updated_at = $4, updated_at_z = $5 WHERE id = $1"
        );
        sqlx::query(&update_sql)
            .bind(id)
            .bind(&title)
            .bind(Value::Object(metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("threads.update_thread", id))?;

        tx.commit()
            .await
            .map_err(EngramError::db("threads.update_thread"))?;

        Ok(Thread {
            title,
            metadata,
            updated_at: now,
            ..current
        })
    }

    /// Delete a thread, its messages, and its observational-memory record in
    /// one transaction.
    ///
    /// The cascade is explicit. This path touches both the thread row and an
    /// observational-memory row, so the thread lock is taken first.
    pub async fn delete_thread(&self, id: &str) -> Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("threads.delete_thread"))?;

        let lock = format!(
            "SELECT id FROM {} WHERE id = $1 FOR UPDATE",
            self.store.table("engram_threads")
        );
        let locked: Option<String> = sqlx::query_scalar(&lock)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("threads.delete_thread", id))?;
        if locked.is_none() {
            return Err(EngramError::NotFound {
                entity: "thread",
                id: id.to_string(),
            });
        }

        let del_memory = format!(
            "DELETE FROM {} WHERE lookup_key = $1",
            self.store.table("engram_observational_memory")
        );
        sqlx::query(&del_memory)
            .bind(MemoryScope::Thread(id.to_string()).lookup_key())
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("threads.delete_thread", id))?;

        let del_messages = format!(
            "DELETE FROM {} WHERE thread_id = $1",
            self.store.table("engram_messages")
        );
        sqlx::query(&del_messages)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("threads.delete_thread", id))?;

        let del_thread = format!(
            "DELETE FROM {} WHERE id = $1",
            self.store.table("engram_threads")
        );
        let result = sqlx::query(&del_thread)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("threads.delete_thread", id))?;
        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound {
                entity: "thread",
                id: id.to_string(),
            });
        }

        tx.commit()
            .await
            .map_err(EngramError::db("threads.delete_thread"))?;
        debug!(thread_id = %id, "thread deleted");
        Ok(())
    }

    /// Threads for one resource, newest activity first.
    ///
    /// Query failures log and return the empty page shape so a rendering UI
    /// keeps working; mutations never do this.
    pub async fn list_threads_by_resource(
        &self,
        resource_id: &str,
        page: PageRequest,
    ) -> Page<Thread> {
        match self.try_list_threads(resource_id, page).await {
            Ok(result) => result,
            Err(e) => {
                error!(resource_id, error = %e, "listing threads failed");
                Page::empty()
            }
        }
    }

    async fn try_list_threads(&self, resource_id: &str, page: PageRequest) -> Result<Page<Thread>> {
        if page.page < 0 || page.per_page <= 0 {
            return Err(EngramError::InvalidInput(format!(
                "invalid page request: page={}, per_page={}",
                page.page, page.per_page
            )));
        }
        let table = self.store.table("engram_threads");
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE resource_id = $1"
        ))
        .bind(resource_id)
        .fetch_one(self.store.pool())
        .await
        .map_err(EngramError::db_with("threads.list_threads", resource_id))?;

        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM {table} WHERE resource_id = $1 \
             ORDER BY COALESCE(updated_at_z, updated_at) DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(resource_id)
            .bind(page.per_page)
            .bind(page.offset())
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("threads.list_threads", resource_id))?;

        let items = rows
            .iter()
            .map(row_to_thread)
            .collect::<Result<Vec<_>>>()?;
        let has_more = page.offset() + (items.len() as i64) < total;
        Ok(Page {
            items,
            total,
            has_more,
        })
    }

    /// Append messages to their threads' logs in one transaction.
    ///
    /// `resource_id` is denormalized from each message's thread; unknown
    /// thread ids fail the whole batch. Thread `updated_at` is bumped so
    /// recency ordering reflects new messages.
    pub async fn save_messages(&self, specs: Vec<MessageSpec>) -> Result<Vec<Message>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let threads_table = self.store.table("engram_threads");
        let messages_table = self.store.table("engram_messages");

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("messages.save_messages"))?;

        let mut saved = Vec::with_capacity(specs.len());
        for spec in specs {
            let resource_id: String = sqlx::query_scalar(&format!(
                "SELECT resource_id FROM {threads_table} WHERE id = $1"
            ))
            .bind(&spec.thread_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("messages.save_messages", spec.thread_id.clone()))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "thread",
                id: spec.thread_id.clone(),
            })?;

            let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let now = now_micros();
            let (naive, aware) = ts_pair(now);
            let insert = format!(
                "INSERT INTO {messages_table} \
                 (id, thread_id, resource_id, role, content, status, metadata, created_at, created_at_z, updated_at, updated_at_z) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $8, $9)"
            );
            sqlx::query(&insert)
                .bind(&id)
                .bind(&spec.thread_id)
                .bind(&resource_id)
                .bind(spec.role.as_str())
                .bind(&spec.content)
                .bind(spec.status.as_str())
                .bind(Value::Object(spec.metadata.clone()))
                .bind(naive)
                .bind(aware)
                .execute(&mut *tx)
                .await
                .map_err(EngramError::db_with("messages.save_messages", id.clone()))?;

            let touch = format!(
                "UPDATE {threads_table} SET updated_at = $2, updated_at_z = $3 WHERE id = $1"
            );
            sqlx::query(&touch)
                .bind(&spec.thread_id)
                .bind(naive)
                .bind(aware)
                .execute(&mut *tx)
                .await
                .map_err(EngramError::db_with("messages.save_messages", spec.thread_id.clone()))?;

            saved.push(Message {
                id,
                thread_id: spec.thread_id,
                resource_id,
                role: spec.role,
                content: spec.content,
                status: spec.status,
                metadata: spec.metadata,
                created_at: now,
                updated_at: now,
            });
        }

        tx.commit()
            .await
            .map_err(EngramError::db("messages.save_messages"))?;
        debug!(count = saved.len(), "messages saved");
        Ok(saved)
    }

    /// A thread's messages in log order; empty shape on failure
    pub async fn get_messages(&self, thread_id: &str, page: PageRequest) -> Page<Message> {
        match self.try_get_messages(thread_id, page).await {
            Ok(result) => result,
            Err(e) => {
                error!(thread_id, error = %e, "listing messages failed");
                Page::empty()
            }
        }
    }

    async fn try_get_messages(&self, thread_id: &str, page: PageRequest) -> Result<Page<Message>> {
        if page.page < 0 || page.per_page <= 0 {
            return Err(EngramError::InvalidInput(format!(
                "invalid page request: page={}, per_page={}",
                page.page, page.per_page
            )));
        }
        let table = self.store.table("engram_messages");
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE thread_id = $1"
        ))
        .bind(thread_id)
        .fetch_one(self.store.pool())
        .await
        .map_err(EngramError::db_with("messages.get_messages", thread_id))?;

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {table} WHERE thread_id = $1 \
             ORDER BY COALESCE(created_at_z, created_at), id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(thread_id)
            .bind(page.per_page)
            .bind(page.offset())
            .fetch_all(self.store.pool())
            .await
            .map_err(EngramError::db_with("messages.get_messages", thread_id))?;

        let items = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>>>()?;
        let has_more = page.offset() + (items.len() as i64) < total;
        Ok(Page {
            items,
            total,
            has_more,
        })
    }

    /// Latest message timestamps for a resource across all its threads
    pub async fn last_message_at(&self, resource_id: &str) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX(COALESCE(created_at_z, created_at)) FROM {} WHERE resource_id = $1",
            self.store.table("engram_messages")
        );
        sqlx::query_scalar(&sql)
            .bind(resource_id)
            .fetch_one(self.store.pool())
            .await
            .map_err(EngramError::db_with("messages.last_message_at", resource_id))
    }

    /// Update one message.
    ///
    /// Metadata merges shallowly; role and content are replaced only when the
    /// caller supplies them — partial updates never clobber them implicitly.
    pub async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message> {
        let table = self.store.table("engram_messages");
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(EngramError::db("messages.update_message"))?;

        let select = format!("SELECT {MESSAGE_COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EngramError::db_with("messages.update_message", id))?
            .ok_or_else(|| EngramError::NotFound {
                entity: "message",
                id: id.to_string(),
            })?;
        let current = row_to_message(&row)?;

        let role = update.role.unwrap_or(current.role);
        let content = update.content.unwrap_or_else(|| current.content.clone());
        let status = update.status.unwrap_or(current.status);
        let metadata = match &update.metadata {
            Some(patch) => merge_metadata(&current.metadata, patch),
            None => current.metadata.clone(),
        };
        let now = now_micros();
        let (naive, aware) = ts_pair(now);

        let update_sql = format!(
            "UPDATE {table} SET role = $2, content = $3, status = $4, metadata = $5, \
             updated_at = $6, updated_at_z = $7 WHERE id = $1"
        );
        sqlx::query(&update_sql)
            .bind(id)
            .bind(role.as_str())
            .bind(&content)
            .bind(status.as_str())
            .bind(Value::Object(metadata.clone()))
            .bind(naive)
            .bind(aware)
            .execute(&mut *tx)
            .await
            .map_err(EngramError::db_with("messages.update_message", id))?;

        tx.commit()
            .await
            .map_err(EngramError::db("messages.update_message"))?;

        Ok(Message {
            role,
            content,
            status,
            metadata,
            updated_at: now,
            ..current
        })
    }
}
