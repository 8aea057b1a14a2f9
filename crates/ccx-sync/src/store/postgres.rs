use anyhow::Context;
use async_trait::async_trait;
use ccx_core::{CountryRecord, StoredCountry};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use super::{CountryQuery, CountryStore, SortOrder, StoreError, StoreStats};

/// Column order of the multi-row upsert; each row binds exactly these.
pub const UPSERT_COLUMNS: [&str; 9] = [
    "name",
    "capital",
    "region",
    "population",
    "currency_code",
    "exchange_rate",
    "estimated_gdp",
    "flag_url",
    "last_refreshed_at",
];

/// Postgres accepts at most `u16::MAX` bind parameters per statement.
pub const MAX_CHUNK_ROWS: usize = u16::MAX as usize / UPSERT_COLUMNS.len();

const SELECT_COUNTRY: &str = "SELECT id, name, capital, region, population, currency_code, \
     exchange_rate, estimated_gdp, flag_url, last_refreshed_at FROM countries";

/// One `INSERT ... VALUES (..), (..) ON CONFLICT DO UPDATE` for the whole chunk.
///
/// Callers must not pass an empty slice or two rows sharing a natural key;
/// Postgres refuses to touch the same row twice in one statement.
pub fn build_upsert_statement(
    rows: &[CountryRecord],
) -> Result<QueryBuilder<'_, Postgres>, StoreError> {
    if rows.len() > MAX_CHUNK_ROWS {
        return Err(StoreError::Rejected(format!(
            "chunk of {} rows exceeds the {MAX_CHUNK_ROWS}-row statement limit",
            rows.len()
        )));
    }
    let populations = rows
        .iter()
        .map(|row| i64::try_from(row.population).map_err(|_| StoreError::PopulationOverflow(row.population)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO countries ({}) ",
        UPSERT_COLUMNS.join(", ")
    ));
    qb.push_values(rows.iter().zip(populations), |mut b, (row, population)| {
        b.push_bind(row.name.as_str())
            .push_bind(row.capital.as_str())
            .push_bind(row.region.as_str())
            .push_bind(population)
            .push_bind(row.currency_code.as_deref())
            .push_bind(row.exchange_rate)
            .push_bind(row.estimated_gdp)
            .push_bind(row.flag_url.as_str())
            .push_bind(row.last_refreshed_at);
    });

    let updates = UPSERT_COLUMNS
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    qb.push(" ON CONFLICT ((lower(name))) DO UPDATE SET ");
    qb.push(updates);
    Ok(qb)
}

fn order_clause(sort: Option<SortOrder>) -> &'static str {
    match sort {
        Some(SortOrder::GdpDesc) => " ORDER BY estimated_gdp DESC NULLS LAST, id",
        Some(SortOrder::GdpAsc) => " ORDER BY estimated_gdp ASC NULLS LAST, id",
        Some(SortOrder::NameAsc) => " ORDER BY lower(name) ASC, id",
        Some(SortOrder::NameDesc) => " ORDER BY lower(name) DESC, id",
        None => " ORDER BY id",
    }
}

fn country_from_row(row: &PgRow) -> Result<StoredCountry, StoreError> {
    let population: i64 = row.try_get("population")?;
    Ok(StoredCountry {
        id: row.try_get("id")?,
        record: CountryRecord {
            name: row.try_get("name")?,
            capital: row.try_get("capital")?,
            region: row.try_get("region")?,
            population: u64::try_from(population).unwrap_or_default(),
            currency_code: row.try_get("currency_code")?,
            exchange_rate: row.try_get("exchange_rate")?,
            estimated_gdp: row.try_get("estimated_gdp")?,
            flag_url: row.try_get("flag_url")?,
            last_refreshed_at: row.try_get("last_refreshed_at")?,
        },
    })
}

#[derive(Clone)]
pub struct PgCountryStore {
    pool: PgPool,
}

impl PgCountryStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running countries migrations")
    }
}

#[async_trait]
impl CountryStore for PgCountryStore {
    async fn upsert_chunk(&self, rows: &[CountryRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = build_upsert_statement(rows)?;
        let result = qb.build().execute(&self.pool).await?;
        debug!(rows = rows.len(), affected = result.rows_affected(), "upsert statement executed");
        Ok(result.rows_affected())
    }

    async fn list(&self, query: &CountryQuery) -> Result<Vec<StoredCountry>, StoreError> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(SELECT_COUNTRY);
        qb.push(" WHERE TRUE");
        if let Some(region) = query.region.as_deref() {
            qb.push(" AND lower(region) = lower(").push_bind(region).push(")");
        }
        if let Some(currency) = query.currency.as_deref() {
            qb.push(" AND lower(currency_code) = lower(")
                .push_bind(currency)
                .push(")");
        }
        qb.push(order_clause(query.sort));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(country_from_row).collect()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<StoredCountry>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COUNTRY} WHERE lower(name) = lower($1)"))
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(country_from_row).transpose()
    }

    async fn delete_by_name(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM countries WHERE lower(name) = lower($1)")
            .bind(name.trim())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, MAX(last_refreshed_at) AS last_refreshed_at
              FROM countries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let last_refreshed_at: Option<DateTime<Utc>> = row.try_get("last_refreshed_at")?;
        Ok(StoreStats {
            total_countries: u64::try_from(total).unwrap_or_default(),
            last_refreshed_at,
        })
    }

    async fn top_by_gdp(&self, limit: usize) -> Result<Vec<StoredCountry>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COUNTRY} WHERE estimated_gdp IS NOT NULL ORDER BY estimated_gdp DESC, id LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(country_from_row).collect()
    }
}
