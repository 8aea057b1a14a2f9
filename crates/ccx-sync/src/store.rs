//! Persistence seam for reconciled country rows.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ccx_core::{CountryRecord, StoredCountry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryCountryStore;
pub use postgres::{build_upsert_statement, PgCountryStore, MAX_CHUNK_ROWS, UPSERT_COLUMNS};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("population {0} does not fit the population column")]
    PopulationOverflow(u64),
    #[error("statement rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    GdpDesc,
    GdpAsc,
    NameAsc,
    NameDesc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::GdpDesc => "gdp_desc",
            SortOrder::GdpAsc => "gdp_asc",
            SortOrder::NameAsc => "name_asc",
            SortOrder::NameDesc => "name_desc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sort order `{0}` (expected gdp_desc, gdp_asc, name_asc or name_desc)")]
pub struct UnknownSortOrder(pub String);

impl FromStr for SortOrder {
    type Err = UnknownSortOrder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gdp_desc" => Ok(SortOrder::GdpDesc),
            "gdp_asc" => Ok(SortOrder::GdpAsc),
            "name_asc" => Ok(SortOrder::NameAsc),
            "name_desc" => Ok(SortOrder::NameDesc),
            _ => Err(UnknownSortOrder(s.to_string())),
        }
    }
}

/// Filters for listing countries. Region and currency match case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryQuery {
    pub region: Option<String>,
    pub currency: Option<String>,
    pub sort: Option<SortOrder>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_countries: u64,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CountryStore: Send + Sync {
    /// Insert-or-update every row in one statement, keyed on the case-insensitive
    /// name. Rows carry their own `last_refreshed_at`; the store never stamps.
    /// Returns the number of rows the statement touched.
    async fn upsert_chunk(&self, rows: &[CountryRecord]) -> Result<u64, StoreError>;

    async fn list(&self, query: &CountryQuery) -> Result<Vec<StoredCountry>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<StoredCountry>, StoreError>;

    /// `true` when a row was removed.
    async fn delete_by_name(&self, name: &str) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Highest estimated GDP first; rows without an estimate are excluded.
    async fn top_by_gdp(&self, limit: usize) -> Result<Vec<StoredCountry>, StoreError>;
}
