//! Core domain model for CCX: source shapes, reconciled country rows and refresh job state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub mod derive;

pub use derive::{derive, derive_all, estimate_gdp, DerivedBatch};

pub const CRATE_NAME: &str = "ccx-core";

/// One currency entry as listed by the reference source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawCurrency {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
}

/// Reference source entry, pre-derivation. The upstream dataset omits or nulls
/// fields for a handful of territories; both read as the default. An entry
/// without a name comes through blank and is skipped at derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReference {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub capital: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub population: u64,
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub currencies: Vec<RawCurrency>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Currency code -> rate against `base`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PricingTable {
    #[serde(default)]
    pub base: Option<String>,
    pub rates: HashMap<String, f64>,
}

impl PricingTable {
    pub fn new(base: Option<String>, rates: HashMap<String, f64>) -> Self {
        Self { base, rates }
    }

    pub fn from_pairs<I, K>(base: Option<&str>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            base: base.map(ToString::to_string),
            rates: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Rates that are not finite are treated as missing.
    pub fn rate_for(&self, code: &str) -> Option<f64> {
        self.rates.get(code).copied().filter(|r| r.is_finite())
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Case-insensitive natural key for a country name.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Reconciled unit of storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRecord {
    pub name: String,
    pub capital: String,
    pub region: String,
    pub population: u64,
    pub currency_code: Option<String>,
    pub exchange_rate: Option<f64>,
    pub estimated_gdp: Option<f64>,
    pub flag_url: String,
    pub last_refreshed_at: DateTime<Utc>,
}

impl CountryRecord {
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }
}

/// A persisted country row: the record plus its opaque store identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCountry {
    pub id: i64,
    #[serde(flatten)]
    pub record: CountryRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Process-wide description of the in-flight or most recent refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RefreshJob {
    pub run_id: Option<Uuid>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processed_count: usize,
    pub error: Option<String>,
}

impl RefreshJob {
    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_tolerates_missing_optional_fields() {
        let raw: RawReference = serde_json::from_str(r#"{"name":"Antarctica","population":1000}"#)
            .expect("parse");
        assert_eq!(raw.name, "Antarctica");
        assert!(raw.capital.is_none());
        assert!(raw.currencies.is_empty());
    }

    #[test]
    fn reference_reads_null_fields_as_defaults() {
        let raw: RawReference = serde_json::from_str(
            r#"{"name":"Bouvet Island","population":null,"currencies":null,"capital":null}"#,
        )
        .expect("parse");
        assert_eq!(raw.name, "Bouvet Island");
        assert_eq!(raw.population, 0);
        assert!(raw.currencies.is_empty());
        assert!(raw.capital.is_none());
    }

    #[test]
    fn reference_without_name_parses_blank() {
        let missing: RawReference =
            serde_json::from_str(r#"{"region":"Polar","population":10}"#).expect("parse");
        assert!(missing.name.is_empty());
        let null: RawReference = serde_json::from_str(r#"{"name":null}"#).expect("parse");
        assert!(null.name.is_empty());
    }

    #[test]
    fn normalized_names_ignore_case_and_padding() {
        assert_eq!(normalize_name("  NIGERIA "), normalize_name("Nigeria"));
    }

    #[test]
    fn non_finite_rates_are_missing() {
        let table = PricingTable::from_pairs(Some("USD"), [("NGN", 1600.5), ("XXX", f64::NAN)]);
        assert_eq!(table.rate_for("NGN"), Some(1600.5));
        assert_eq!(table.rate_for("XXX"), None);
        assert_eq!(table.rate_for("EUR"), None);
    }

    #[test]
    fn job_status_serializes_lowercase() {
        let job = RefreshJob::default();
        let json = serde_json::to_value(&job).expect("json");
        assert_eq!(json["status"], "idle");
        assert!(!job.is_running());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
