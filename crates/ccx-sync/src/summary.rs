//! Post-refresh summary artifact hook.

use async_trait::async_trait;
use ccx_core::StoredCountry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::store::{CountryStore, StoreError};

pub const DEFAULT_SUMMARY_TOP_N: usize = 5;

/// Everything a renderer needs; read from the store after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummarySnapshot {
    pub total_countries: u64,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub top_countries: Vec<StoredCountry>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ArtifactWriteFailure {
    #[error("reading summary data: {0}")]
    Store(#[from] StoreError),
    #[error("rendering summary: {0}")]
    Render(String),
    #[error(transparent)]
    Write(#[from] anyhow::Error),
}

#[async_trait]
pub trait SummaryRenderer: Send + Sync {
    async fn render(&self, snapshot: &SummarySnapshot) -> Result<(), ArtifactWriteFailure>;
}

pub async fn build_snapshot(
    store: &dyn CountryStore,
    top_n: usize,
) -> Result<SummarySnapshot, ArtifactWriteFailure> {
    let stats = store.stats().await?;
    let top_countries = store.top_by_gdp(top_n).await?;
    Ok(SummarySnapshot {
        total_countries: stats.total_countries,
        last_refreshed_at: stats.last_refreshed_at,
        top_countries,
        generated_at: Utc::now(),
    })
}
