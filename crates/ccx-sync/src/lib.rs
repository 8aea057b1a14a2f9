//! Refresh pipeline: store, reconciler, job controller and scheduler.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

pub mod config;
pub mod controller;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod summary;

pub use config::RefreshConfig;
pub use controller::{ControllerOptions, RefreshController, RefreshError, StartOutcome};
pub use reconcile::{ReconcileFailure, ReconcileResult, Reconciler, DEFAULT_CHUNK_SIZE};
pub use scheduler::maybe_build_scheduler;
pub use store::{
    CountryQuery, CountryStore, MemoryCountryStore, PgCountryStore, SortOrder, StoreError,
    StoreStats, UnknownSortOrder,
};
pub use summary::{ArtifactWriteFailure, SummaryRenderer, SummarySnapshot};

pub const CRATE_NAME: &str = "ccx-sync";

/// Postgres when `DATABASE_URL` is set (migrated on open), otherwise a
/// process-local store that is lost on restart.
pub async fn open_store(config: &RefreshConfig) -> Result<Arc<dyn CountryStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgCountryStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            info!(max_connections = config.db_max_connections, "postgres store ready");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory country store");
            Ok(Arc::new(MemoryCountryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_database_url_opens_memory_store() {
        let store = open_store(&RefreshConfig::default()).await.unwrap();
        assert_eq!(store.stats().await.unwrap().total_countries, 0);
    }
}
