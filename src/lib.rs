//! Engram - Relational Persistence for Agentic Memory
//!
//! A PostgreSQL-backed storage layer for agent-memory platforms:
//! - Self-migrating table engine with idempotent, additive DDL
//! - Identifier truncation honoring the backend's 63-byte limit
//! - Generic parent + immutable-version entity pattern (prompt blocks,
//!   MCP server definitions, dataset definitions)
//! - SCD-2 dataset items with tombstones, time-travel reads, and a
//!   per-dataset version audit trail
//! - Observational memory: chunk buffering, token-budget activation,
//!   and reflection generations
//!
//! # Architecture
//!
//! - **Types**: Core data structures (Thread, Message, Dataset, etc.)
//! - **Schema**: Declarative table catalog and DDL generation
//! - **Migration**: Single-flight schema setup and structural migrations
//! - **Store**: Domain stores sharing one [`store::PgStore`] client
//! - **Factory**: Connect-or-fallback boundary for embedding hosts
//!
//! # Example
//!
//! ```ignore
//! use engram::{PgStore, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StorageConfig::from_env()?;
//!     let store = PgStore::connect(&config).await?;
//!
//!     let threads = store.threads();
//!     let thread = threads
//!         .create_thread(engram::store::threads::ThreadSpec {
//!             id: Some("thread-1".into()),
//!             resource_id: "user-42".into(),
//!             title: Some("Planning session".into()),
//!             metadata: Default::default(),
//!         })
//!         .await?;
//!
//!     println!("created {}", thread.id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod ident;
pub mod migration;
pub mod schema;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::StorageConfig;
pub use error::{EngramError, Result};
pub use factory::{resolve_storage, FallbackStorage, ResolvedStorage, Storage};
pub use migration::{MigrationEngine, MigrationReport};
pub use store::PgStore;
pub use types::{
    BufferedObservationChunk, Dataset, DatasetChange, DatasetItemRow, EntityStatus, EntityVersion,
    MemoryScope, Message, MessageRole, MessageStatus, ObservationalMemoryRecord, Page,
    PageRequest, Thread,
};
