//! Source adapter contracts + the gateway that pulls reference and pricing data together.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ccx_core::{PricingTable, RawReference};
use ccx_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ccx-adapters";

pub const DEFAULT_REFERENCE_URL: &str =
    "https://restcountries.com/v2/all?fields=name,capital,region,population,flag,currencies";
pub const DEFAULT_PRICING_URL: &str = "https://open.er-api.com/v6/latest/USD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Reference,
    Pricing,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Reference => f.write_str("reference"),
            SourceKind::Pricing => f.write_str("pricing"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid response format: {0}")]
    Format(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Fetch(err) if err.is_timeout())
    }
}

/// Either source failed or ran past its deadline; the gateway never returns half a snapshot.
#[derive(Debug, Clone, Error)]
#[error("{which_source} source unavailable: {cause}")]
pub struct SourceUnavailable {
    pub which_source: SourceKind,
    pub cause: String,
    pub timed_out: bool,
}

#[async_trait]
pub trait ReferenceSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_reference(&self) -> Result<Vec<RawReference>, SourceError>;
}

#[async_trait]
pub trait PricingSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_pricing(&self) -> Result<PricingTable, SourceError>;
}

/// Wire shape of the exchange-rate service (`open.er-api.com` style).
#[derive(Debug, Clone, Deserialize)]
struct ExchangeRatePayload {
    #[serde(default)]
    result: Option<String>,
    #[serde(default, rename = "error-type")]
    error_type: Option<String>,
    #[serde(default)]
    base_code: Option<String>,
    #[serde(default)]
    rates: Option<HashMap<String, f64>>,
}

pub fn parse_reference_payload(bytes: &[u8]) -> Result<Vec<RawReference>, SourceError> {
    serde_json::from_slice(bytes).map_err(|e| SourceError::Format(format!("reference list: {e}")))
}

pub fn parse_pricing_payload(bytes: &[u8]) -> Result<PricingTable, SourceError> {
    let payload: ExchangeRatePayload = serde_json::from_slice(bytes)
        .map_err(|e| SourceError::Format(format!("pricing payload: {e}")))?;
    if payload.result.as_deref() == Some("error") {
        return Err(SourceError::Format(format!(
            "pricing service reported error: {}",
            payload.error_type.as_deref().unwrap_or("unknown")
        )));
    }
    let rates = payload
        .rates
        .ok_or_else(|| SourceError::Format("pricing payload has no rates".to_string()))?;
    Ok(PricingTable::new(payload.base_code, rates))
}

pub struct RestCountriesSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl RestCountriesSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReferenceSource for RestCountriesSource {
    fn source_id(&self) -> &str {
        "restcountries"
    }

    async fn fetch_reference(&self) -> Result<Vec<RawReference>, SourceError> {
        let resp = self.http.fetch_bytes(self.source_id(), &self.url).await?;
        parse_reference_payload(&resp.body)
    }
}

pub struct ExchangeRateSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl ExchangeRateSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PricingSource for ExchangeRateSource {
    fn source_id(&self) -> &str {
        "exchange-rates"
    }

    async fn fetch_pricing(&self) -> Result<PricingTable, SourceError> {
        let resp = self.http.fetch_bytes(self.source_id(), &self.url).await?;
        parse_pricing_payload(&resp.body)
    }
}

fn read_fixture(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading fixture {}", path.display()))
}

fn parse_fixture<T, F>(path: &Path, parse: F) -> anyhow::Result<T>
where
    F: FnOnce(&[u8]) -> Result<T, SourceError>,
{
    let bytes = read_fixture(path)?;
    parse(&bytes).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

/// Serves a preloaded reference list; used for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureReferenceSource {
    entries: Vec<RawReference>,
}

impl FixtureReferenceSource {
    pub fn new(entries: Vec<RawReference>) -> Self {
        Self { entries }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        parse_fixture(path.as_ref(), parse_reference_payload).map(Self::new)
    }
}

#[async_trait]
impl ReferenceSource for FixtureReferenceSource {
    fn source_id(&self) -> &str {
        "reference-fixture"
    }

    async fn fetch_reference(&self) -> Result<Vec<RawReference>, SourceError> {
        Ok(self.entries.clone())
    }
}

#[derive(Debug, Clone)]
pub struct FixturePricingSource {
    table: PricingTable,
}

impl FixturePricingSource {
    pub fn new(table: PricingTable) -> Self {
        Self { table }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        parse_fixture(path.as_ref(), parse_pricing_payload).map(Self::new)
    }
}

#[async_trait]
impl PricingSource for FixturePricingSource {
    fn source_id(&self) -> &str {
        "pricing-fixture"
    }

    async fn fetch_pricing(&self) -> Result<PricingTable, SourceError> {
        Ok(self.table.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub references: Vec<RawReference>,
    pub pricing: PricingTable,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub reference_url: String,
    pub pricing_url: String,
    pub reference_fixture: Option<PathBuf>,
    pub pricing_fixture: Option<PathBuf>,
    pub timeout: Duration,
    pub user_agent: String,
    pub max_retries: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reference_url: DEFAULT_REFERENCE_URL.to_string(),
            pricing_url: DEFAULT_PRICING_URL.to_string(),
            reference_fixture: None,
            pricing_fixture: None,
            timeout: Duration::from_secs(30),
            user_agent: "ccx-bot/0.1".to_string(),
            max_retries: 0,
        }
    }
}

pub struct SourceGateway {
    reference: Arc<dyn ReferenceSource>,
    pricing: Arc<dyn PricingSource>,
    timeout: Duration,
}

impl SourceGateway {
    pub fn new(
        reference: Arc<dyn ReferenceSource>,
        pricing: Arc<dyn PricingSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            reference,
            pricing,
            timeout,
        }
    }

    /// HTTP sources by default; a configured fixture path replaces the matching remote.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.max_retries,
                ..BackoffPolicy::default()
            },
        })?);

        let reference: Arc<dyn ReferenceSource> = match &config.reference_fixture {
            Some(path) => {
                warn!(path = %path.display(), "using reference fixture instead of remote source");
                Arc::new(FixtureReferenceSource::from_path(path)?)
            }
            None => Arc::new(RestCountriesSource::new(http.clone(), &config.reference_url)),
        };
        let pricing: Arc<dyn PricingSource> = match &config.pricing_fixture {
            Some(path) => {
                warn!(path = %path.display(), "using pricing fixture instead of remote source");
                Arc::new(FixturePricingSource::from_path(path)?)
            }
            None => Arc::new(ExchangeRateSource::new(http, &config.pricing_url)),
        };

        Ok(Self::new(reference, pricing, config.timeout))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch both datasets concurrently. The first failure wins and the sibling
    /// future is dropped, so a failed gateway call holds no in-flight request.
    pub async fn fetch_all(&self) -> Result<SourceSnapshot, SourceUnavailable> {
        let reference = bounded(
            SourceKind::Reference,
            self.timeout,
            self.reference.fetch_reference(),
        );
        let pricing = bounded(SourceKind::Pricing, self.timeout, self.pricing.fetch_pricing());

        let (references, pricing) = tokio::try_join!(reference, pricing)?;
        info!(
            reference_source = self.reference.source_id(),
            pricing_source = self.pricing.source_id(),
            references = references.len(),
            rates = pricing.len(),
            "sources fetched"
        );
        Ok(SourceSnapshot {
            references,
            pricing,
        })
    }
}

async fn bounded<T, F>(which: SourceKind, timeout: Duration, fut: F) -> Result<T, SourceUnavailable>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SourceUnavailable {
            which_source: which,
            timed_out: err.is_timeout(),
            cause: err.to_string(),
        }),
        Err(_) => Err(SourceUnavailable {
            which_source: which,
            cause: format!("timed out after {}ms", timeout.as_millis()),
            timed_out: true,
        }),
    }
}
