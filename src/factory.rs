//! Storage factory: relational backend with embedded fallback
//!
//! Callers hand over a constructor for their embedded engine and get back
//! whichever backend actually came up. A failed relational connection is not
//! fatal — the process degrades to the embedded engine and carries a
//! user-facing warning explaining what happened and how to fix it.

use crate::config::StorageConfig;
use crate::error::Result;
use crate::store::PgStore;
use async_trait::async_trait;
use tracing::{info, warn};

/// Constructor seam for the embedded fallback engine
#[async_trait]
pub trait FallbackStorage: Sized {
    async fn open_fallback() -> Result<Self>;
}

/// Whichever backend the factory resolved
pub enum Storage<F> {
    Relational(PgStore),
    Embedded(F),
}

impl<F> Storage<F> {
    pub fn is_relational(&self) -> bool {
        matches!(self, Storage::Relational(_))
    }
}

/// Factory result: the live backend plus an optional degradation warning
pub struct ResolvedStorage<F> {
    pub storage: Storage<F>,
    /// Set only when the relational backend was requested but unreachable
    pub warning: Option<String>,
}

/// Connect to the relational backend, falling back to the embedded engine.
///
/// Connection failures surface as a warning on the result rather than an
/// error: agents keep working on the embedded engine while the operator
/// fixes connectivity. Failures from the fallback itself do propagate —
/// with no backend at all there is nothing to degrade to.
pub async fn resolve_storage<F: FallbackStorage>(
    config: &StorageConfig,
) -> Result<ResolvedStorage<F>> {
    match PgStore::connect(config).await {
        Ok(store) => Ok(ResolvedStorage {
            storage: Storage::Relational(store),
            warning: None,
        }),
        Err(err) => {
            let warning = format!(
                "relational storage unavailable ({err}); falling back to the embedded \
                 engine. Data written in this mode stays local. Check that the database \
                 in DATABASE_URL is running and reachable, then restart to reconnect."
            );
            warn!(error = %err, "relational backend unreachable, using embedded fallback");
            let fallback = F::open_fallback().await?;
            info!("embedded fallback storage ready");
            Ok(ResolvedStorage {
                storage: Storage::Embedded(fallback),
                warning: Some(warning),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngramError;

    struct MemoryEngine;

    #[async_trait]
    impl FallbackStorage for MemoryEngine {
        async fn open_fallback() -> Result<Self> {
            Ok(MemoryEngine)
        }
    }

    struct BrokenEngine;

    #[async_trait]
    impl FallbackStorage for BrokenEngine {
        async fn open_fallback() -> Result<Self> {
            Err(EngramError::InvalidInput("embedded engine unavailable".into()))
        }
    }

    fn unreachable_config() -> StorageConfig {
        StorageConfig {
            database_url: "postgres://nobody@127.0.0.1:1/engram".into(),
            schema_name: None,
            max_connections: 1,
            acquire_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_with_warning() {
        let resolved = resolve_storage::<MemoryEngine>(&unreachable_config())
            .await
            .unwrap();
        assert!(!resolved.storage.is_relational());
        let warning = resolved.warning.expect("degraded mode carries a warning");
        assert!(warning.contains("falling back"));
        assert!(warning.contains("DATABASE_URL"));
    }

    #[tokio::test]
    async fn test_fallback_failure_propagates() {
        let result = resolve_storage::<BrokenEngine>(&unreachable_config()).await;
        assert!(result.is_err());
    }
}
