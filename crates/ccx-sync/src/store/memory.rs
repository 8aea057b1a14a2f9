use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ccx_core::{normalize_name, CountryRecord, StoredCountry};

use super::{CountryQuery, CountryStore, SortOrder, StoreError, StoreStats, MAX_CHUNK_ROWS};

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<StoredCountry>,
    next_id: i64,
    statements: Vec<usize>,
    fail_statement: Option<usize>,
}

/// Process-local store with the same upsert semantics as Postgres.
///
/// Also records the size of every upsert statement it receives and can be told
/// to reject one, which is how reconcile partial-failure behavior is exercised.
#[derive(Debug, Default)]
pub struct MemoryCountryStore {
    state: Mutex<MemoryState>,
}

impl MemoryCountryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject the upsert statement with this zero-based index (counted across the store's lifetime).
    pub fn fail_statement(&self, index: usize) {
        self.lock().fail_statement = Some(index);
    }

    /// Row count of each upsert statement received so far, rejected ones included.
    pub fn statement_sizes(&self) -> Vec<usize> {
        self.lock().statements.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<StoredCountry> {
        self.lock().rows.clone()
    }
}

fn matches_filter(value: Option<&str>, wanted: Option<&str>) -> bool {
    match wanted {
        None => true,
        Some(wanted) => value.is_some_and(|v| v.to_lowercase() == wanted.trim().to_lowercase()),
    }
}

/// Nulls sort last in both directions.
fn compare_gdp(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if descending => b.total_cmp(&a),
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn sort_rows(rows: &mut [StoredCountry], sort: Option<SortOrder>) {
    rows.sort_by(|a, b| {
        let primary = match sort {
            Some(SortOrder::GdpDesc) => compare_gdp(a.record.estimated_gdp, b.record.estimated_gdp, true),
            Some(SortOrder::GdpAsc) => compare_gdp(a.record.estimated_gdp, b.record.estimated_gdp, false),
            Some(SortOrder::NameAsc) => a.record.key().cmp(&b.record.key()),
            Some(SortOrder::NameDesc) => b.record.key().cmp(&a.record.key()),
            None => Ordering::Equal,
        };
        primary.then(a.id.cmp(&b.id))
    });
}

#[async_trait]
impl CountryStore for MemoryCountryStore {
    async fn upsert_chunk(&self, rows: &[CountryRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if rows.len() > MAX_CHUNK_ROWS {
            return Err(StoreError::Rejected(format!(
                "chunk of {} rows exceeds the {MAX_CHUNK_ROWS}-row statement limit",
                rows.len()
            )));
        }
        let mut state = self.lock();
        let statement = state.statements.len();
        state.statements.push(rows.len());
        if state.fail_statement == Some(statement) {
            return Err(StoreError::Rejected(format!("statement {statement} rejected")));
        }

        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            if i64::try_from(row.population).is_err() {
                return Err(StoreError::PopulationOverflow(row.population));
            }
            if !seen.insert(row.key()) {
                return Err(StoreError::Rejected(format!(
                    "statement {statement} touches `{}` twice",
                    row.name
                )));
            }
        }

        for row in rows {
            let key = row.key();
            match state.rows.iter_mut().find(|existing| existing.record.key() == key) {
                Some(existing) => existing.record = row.clone(),
                None => {
                    state.next_id += 1;
                    let id = state.next_id;
                    state.rows.push(StoredCountry {
                        id,
                        record: row.clone(),
                    });
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn list(&self, query: &CountryQuery) -> Result<Vec<StoredCountry>, StoreError> {
        let mut rows = self
            .lock()
            .rows
            .iter()
            .filter(|row| matches_filter(Some(&row.record.region), query.region.as_deref()))
            .filter(|row| matches_filter(row.record.currency_code.as_deref(), query.currency.as_deref()))
            .cloned()
            .collect::<Vec<_>>();
        sort_rows(&mut rows, query.sort);
        Ok(rows)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<StoredCountry>, StoreError> {
        let key = normalize_name(name);
        Ok(self.lock().rows.iter().find(|row| row.record.key() == key).cloned())
    }

    async fn delete_by_name(&self, name: &str) -> Result<bool, StoreError> {
        let key = normalize_name(name);
        let mut state = self.lock();
        let before = state.rows.len();
        state.rows.retain(|row| row.record.key() != key);
        Ok(state.rows.len() < before)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.lock();
        Ok(StoreStats {
            total_countries: state.rows.len() as u64,
            last_refreshed_at: state.rows.iter().map(|row| row.record.last_refreshed_at).max(),
        })
    }

    async fn top_by_gdp(&self, limit: usize) -> Result<Vec<StoredCountry>, StoreError> {
        let mut rows = self
            .lock()
            .rows
            .iter()
            .filter(|row| row.record.estimated_gdp.is_some())
            .cloned()
            .collect::<Vec<_>>();
        sort_rows(&mut rows, Some(SortOrder::GdpDesc));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(name: &str, region: &str, currency: Option<&str>, gdp: Option<f64>) -> CountryRecord {
        CountryRecord {
            name: name.to_string(),
            capital: String::new(),
            region: region.to_string(),
            population: 10,
            currency_code: currency.map(ToString::to_string),
            exchange_rate: gdp.map(|_| 1.0),
            estimated_gdp: gdp,
            flag_url: String::new(),
            last_refreshed_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().unwrap(),
        }
    }

    async fn seeded() -> MemoryCountryStore {
        let store = MemoryCountryStore::new();
        store
            .upsert_chunk(&[
                record("Nigeria", "Africa", Some("NGN"), Some(25_000.0)),
                record("Ghana", "Africa", Some("GHS"), Some(90_000.0)),
                record("Atlantis", "Africa", Some("ATL"), None),
                record("France", "Europe", Some("EUR"), Some(400_000.0)),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn filters_are_case_insensitive() {
        let store = seeded().await;
        let rows = store
            .list(&CountryQuery {
                region: Some("africa".into()),
                currency: Some("ngn".into()),
                sort: None,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.name, "Nigeria");
    }

    #[tokio::test]
    async fn gdp_sort_puts_unpriced_rows_last() {
        let store = seeded().await;
        let rows = store
            .list(&CountryQuery {
                region: Some("Africa".into()),
                sort: Some(SortOrder::GdpDesc),
                ..CountryQuery::default()
            })
            .await
            .unwrap();
        let names = rows.iter().map(|r| r.record.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["Ghana", "Nigeria", "Atlantis"]);

        let rows = store
            .list(&CountryQuery {
                sort: Some(SortOrder::GdpAsc),
                ..CountryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.last().unwrap().record.name, "Atlantis");
    }

    #[tokio::test]
    async fn upsert_keeps_identity_and_replaces_casing() {
        let store = seeded().await;
        let before = store.get_by_name("nigeria").await.unwrap().unwrap();
        store
            .upsert_chunk(&[record("NIGERIA", "Africa", Some("NGN"), Some(1.0))])
            .await
            .unwrap();
        let after = store.get_by_name("Nigeria").await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.record.name, "NIGERIA");
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn rejected_statement_changes_nothing() {
        let store = MemoryCountryStore::new();
        store.fail_statement(0);
        let err = store
            .upsert_chunk(&[record("Chad", "Africa", None, Some(0.0))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.is_empty());
        assert_eq!(store.statement_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn filters_fold_non_ascii_case() {
        let store = MemoryCountryStore::new();
        store
            .upsert_chunk(&[
                record("Wallis et Futuna", "Océanie", Some("XPF"), Some(1.0)),
                record("Fiji", "Oceania", Some("FJD"), Some(2.0)),
            ])
            .await
            .unwrap();
        let rows = store
            .list(&CountryQuery {
                region: Some("OCÉANIE".into()),
                currency: None,
                sort: None,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.name, "Wallis et Futuna");
    }

    #[tokio::test]
    async fn chunk_past_the_statement_limit_is_rejected() {
        let store = MemoryCountryStore::new();
        let rows = (0..=MAX_CHUNK_ROWS)
            .map(|i| record(&format!("Country {i}"), "Europe", None, None))
            .collect::<Vec<_>>();
        let err = store.upsert_chunk(&rows).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.is_empty());
        assert!(store.statement_sizes().is_empty());
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_statement_are_rejected() {
        let store = MemoryCountryStore::new();
        let err = store
            .upsert_chunk(&[
                record("Chad", "Africa", None, None),
                record("CHAD", "Africa", None, None),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_and_top_and_stats() {
        let store = seeded().await;
        let top = store.top_by_gdp(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].record.name, "France");

        assert!(store.delete_by_name(" france ").await.unwrap());
        assert!(!store.delete_by_name("france").await.unwrap());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_countries, 3);
        assert!(stats.last_refreshed_at.is_some());
    }
}
