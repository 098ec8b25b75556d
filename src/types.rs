//! Core data types for the Engram persistence layer
//!
//! This module defines the row-level shapes the domain stores read and write:
//! conversational threads and messages, observational-memory records with
//! their buffered chunks, versioned-entity parents and version snapshots, and
//! the SCD-2 dataset item rows. Every JSONB column maps to an explicit typed
//! structure here; parse failures surface as [`crate::EngramError::MalformedData`]
//! rather than being silently coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// JSON object used for free-form metadata columns
pub type Metadata = Map<String, Value>;

/// Shallow-merge `patch` into `base`: caller keys win, nested objects are
/// replaced wholesale rather than merged.
pub fn merge_metadata(base: &Metadata, patch: &Metadata) -> Metadata {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

// ---------------------------------------------------------------------------
// Threads and messages
// ---------------------------------------------------------------------------

/// A conversational thread
///
/// `resource_id` is denormalized onto the thread so cross-thread queries for
/// one resource never need a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub resource_id: String,
    pub title: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion state of a message row
///
/// Streaming writers insert a `pending` row and finalize it to `completed`;
/// interrupted finalization is how historical duplicate message ids arose,
/// and `completed` rows win during deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Completed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "completed" => Some(MessageStatus::Completed),
            _ => None,
        }
    }
}

/// A message in a thread's append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    /// Denormalized from the thread for resource-scoped scans
    pub resource_id: String,
    pub role: MessageRole,
    /// Structured content parts (text, tool calls, attachments)
    pub content: Value,
    pub status: MessageStatus,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial message update
///
/// Metadata merges shallowly; `role`/`content` are replaced only when the
/// caller supplies them explicitly — there is no wholesale replacement path.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub role: Option<MessageRole>,
    pub content: Option<Value>,
    pub status: Option<MessageStatus>,
    pub metadata: Option<Metadata>,
}

/// Paginated list shape shared by all list/query operations
///
/// List operations that fail return this shape empty instead of propagating,
/// since they typically feed a UI that must keep rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Page {
            items: Vec::new(),
            total: 0,
            has_more: false,
        }
    }
}

/// Pagination arguments (zero-based page index)
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: i64,
    pub per_page: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            page: 0,
            per_page: 40,
        }
    }
}

impl PageRequest {
    pub fn offset(&self) -> i64 {
        self.page * self.per_page
    }
}

// ---------------------------------------------------------------------------
// Versioned entities
// ---------------------------------------------------------------------------

/// Lifecycle status of a versioned-entity parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Draft,
    Published,
    Archived,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Draft => "draft",
            EntityStatus::Published => "published",
            EntityStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(EntityStatus::Draft),
            "published" => Some(EntityStatus::Published),
            "archived" => Some(EntityStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parent record of a versioned entity; never stores content itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityParent {
    pub id: Uuid,
    pub name: String,
    pub status: EntityStatus,
    /// Must reference a version of this same parent when set
    pub active_version_id: Option<Uuid>,
    pub author_id: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable content snapshot of one entity version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityVersion {
    pub id: Uuid,
    pub parent_id: Uuid,
    /// Family discriminator; the version table is shared across families
    pub parent_kind: String,
    /// Contiguous from 1 per parent, never reused
    pub version_number: i64,
    pub content: Value,
    pub changed_fields: Vec<String>,
    pub change_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partial update for a versioned-entity parent
#[derive(Debug, Clone, Default)]
pub struct EntityUpdate {
    pub name: Option<String>,
    pub status: Option<EntityStatus>,
    pub author_id: Option<String>,
    /// Shallow-merged into the existing metadata; caller keys win
    pub metadata: Option<Metadata>,
}

/// Content of a prompt block version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBlockContent {
    pub text: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

/// Content of an MCP server definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinitionContent {
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
}

// ---------------------------------------------------------------------------
// Datasets (SCD-2 items)
// ---------------------------------------------------------------------------

/// Content snapshot of a dataset definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional JSON-schema-style description of item `data` payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_schema: Option<Value>,
}

/// Dataset parent: a versioned entity plus the SCD-2 serialization counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: EntityStatus,
    pub active_version_id: Option<Uuid>,
    pub author_id: Option<String>,
    pub metadata: Metadata,
    /// Bumped exactly once per item mutation; totally orders concurrent
    /// mutations on this dataset
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One SCD-2 row of a dataset item
///
/// Rows sharing `item_id` form the item's history; at most one row has
/// `valid_to = NULL` (the current row). A deleted item keeps a current row as
/// a tombstone (`is_deleted = true`, `valid_to = NULL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetItemRow {
    pub row_id: Uuid,
    pub dataset_id: Uuid,
    pub item_id: String,
    pub data: Value,
    /// Dataset version at which this row was opened
    pub dataset_version: i64,
    /// Dataset version at which this row was closed; `None` while current
    pub valid_to: Option<i64>,
    pub is_deleted: bool,
    /// Creation time of the logical item, preserved across supersessions
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of change recorded by a dataset version audit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetChange {
    AddItem,
    UpdateItem,
    DeleteItem,
    BatchAdd,
    BatchDelete,
}

impl DatasetChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetChange::AddItem => "add_item",
            DatasetChange::UpdateItem => "update_item",
            DatasetChange::DeleteItem => "delete_item",
            DatasetChange::BatchAdd => "batch_add",
            DatasetChange::BatchDelete => "batch_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add_item" => Some(DatasetChange::AddItem),
            "update_item" => Some(DatasetChange::UpdateItem),
            "delete_item" => Some(DatasetChange::DeleteItem),
            "batch_add" => Some(DatasetChange::BatchAdd),
            "batch_delete" => Some(DatasetChange::BatchDelete),
            _ => None,
        }
    }
}

/// Audit row written once per dataset item mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetVersionAudit {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub version: i64,
    pub change: DatasetChange,
    /// Item ids touched by this mutation
    pub item_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Observational memory
// ---------------------------------------------------------------------------

/// Scope of an observational-memory record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum MemoryScope {
    Thread(String),
    Resource(String),
}

impl MemoryScope {
    /// Derived key the record row is looked up by
    pub fn lookup_key(&self) -> String {
        match self {
            MemoryScope::Thread(id) => format!("thread:{id}"),
            MemoryScope::Resource(id) => format!("resource:{id}"),
        }
    }
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.lookup_key())
    }
}

/// One unit of buffered, not-yet-durable observation output
///
/// Immutable once appended; activation consumes whole chunks in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedObservationChunk {
    pub id: Uuid,
    /// Observation cycle that produced this chunk
    pub cycle_id: String,
    pub observations: String,
    /// Token cost of `observations`
    pub token_count: i64,
    /// Messages covered by this chunk
    pub message_ids: Vec<String>,
    /// Token total of the covered raw messages
    pub message_tokens: i64,
    pub last_observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_continuation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
}

/// Durable observational-memory row for one scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationalMemoryRecord {
    pub id: Uuid,
    pub lookup_key: String,
    pub scope: MemoryScope,
    /// Durable observation text; append-only between reflections
    pub active_observations: String,
    /// Bumped once per reflection pass
    pub generation_count: i64,
    /// Ordered, not-yet-activated chunks
    pub buffered_chunks: Vec<BufferedObservationChunk>,
    pub is_buffering: bool,
    pub reflection_pending: bool,
    /// Reflection text accumulated while a reflection pass is pending
    pub buffered_reflection: Option<String>,
    /// Line count of `active_observations` covered by the pending reflection;
    /// lines past this boundary arrived after reflection began
    pub reflection_line_offset: Option<i64>,
    /// Raw message tokens observed into chunks but not yet activated
    pub pending_message_tokens: i64,
    /// Token cost of `active_observations`
    pub observation_token_count: i64,
    pub total_tokens_observed: i64,
    /// Timestamp of the newest activated chunk, never wall clock
    pub last_observed_at: Option<DateTime<Utc>>,
    pub last_buffered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_key_derivation() {
        assert_eq!(
            MemoryScope::Thread("t-9".into()).lookup_key(),
            "thread:t-9"
        );
        assert_eq!(
            MemoryScope::Resource("user-1".into()).lookup_key(),
            "resource:user-1"
        );
    }

    #[test]
    fn test_merge_metadata_caller_keys_win() {
        let base: Metadata = json!({"a": 1, "b": {"x": 1}, "keep": true})
            .as_object()
            .unwrap()
            .clone();
        let patch: Metadata = json!({"a": 2, "b": {"y": 2}})
            .as_object()
            .unwrap()
            .clone();
        let merged = merge_metadata(&base, &patch);
        assert_eq!(merged["a"], json!(2));
        // nested objects are replaced, not deep-merged
        assert_eq!(merged["b"], json!({"y": 2}));
        assert_eq!(merged["keep"], json!(true));
    }

    #[test]
    fn test_chunk_round_trips_through_json() {
        let chunk = BufferedObservationChunk {
            id: Uuid::new_v4(),
            cycle_id: "cycle-1".into(),
            observations: "saw a thing".into(),
            token_count: 12,
            message_ids: vec!["m1".into(), "m2".into()],
            message_tokens: 340,
            last_observed_at: Utc::now(),
            created_at: Utc::now(),
            suggested_continuation: None,
            current_task: Some("triage".into()),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        // absent optionals are omitted entirely, not stored as null
        assert!(value.get("suggested_continuation").is_none());
        let back: BufferedObservationChunk = serde_json::from_value(value).unwrap();
        assert_eq!(back.message_ids, chunk.message_ids);
        assert_eq!(back.current_task.as_deref(), Some("triage"));
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            EntityStatus::Draft,
            EntityStatus::Published,
            EntityStatus::Archived,
        ] {
            assert_eq!(EntityStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EntityStatus::parse("deleted"), None);
        for role in [
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::System,
            MessageRole::Tool,
        ] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
    }
}
