//! Derivation of reconciled country rows from reference + pricing data.
//!
//! Everything here is pure; randomness comes from the caller's RNG so a refresh
//! draws a fresh multiplier per record while tests can seed it.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::{CountryRecord, PricingTable, RawReference};

pub const GDP_MULTIPLIER_MIN: u32 = 1000;
pub const GDP_MULTIPLIER_MAX: u32 = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedBatch {
    pub records: Vec<CountryRecord>,
    /// References dropped because they carried no usable name.
    pub skipped: usize,
}

/// `population * U(1000, 2000) / rate`; zero when either input leaves nothing to price.
pub fn estimate_gdp<R: Rng>(population: u64, rate: f64, rng: &mut R) -> f64 {
    if population == 0 || rate <= 0.0 {
        return 0.0;
    }
    let multiplier = rng.gen_range(GDP_MULTIPLIER_MIN..=GDP_MULTIPLIER_MAX);
    population as f64 * f64::from(multiplier) / rate
}

/// Join one reference entry with its pricing entry.
///
/// Only the first listed currency is considered. No currency prices to `0`;
/// a currency the pricing table does not know leaves both rate and estimate null.
pub fn derive<R: Rng>(
    reference: &RawReference,
    pricing: &PricingTable,
    now: DateTime<Utc>,
    rng: &mut R,
) -> CountryRecord {
    let currency_code = reference
        .currencies
        .first()
        .and_then(|c| c.code.as_deref())
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(ToString::to_string);

    let (exchange_rate, estimated_gdp) = match currency_code.as_deref() {
        None => (None, Some(0.0)),
        Some(code) => match pricing.rate_for(code) {
            Some(rate) => (Some(rate), Some(estimate_gdp(reference.population, rate, rng))),
            None => (None, None),
        },
    };

    CountryRecord {
        name: reference.name.trim().to_string(),
        capital: reference.capital.clone().unwrap_or_default(),
        region: reference.region.clone().unwrap_or_default(),
        population: reference.population,
        currency_code,
        exchange_rate,
        estimated_gdp,
        flag_url: reference.flag.clone().unwrap_or_default(),
        last_refreshed_at: now,
    }
}

pub fn derive_all<R: Rng>(
    references: &[RawReference],
    pricing: &PricingTable,
    now: DateTime<Utc>,
    rng: &mut R,
) -> DerivedBatch {
    let mut records = Vec::with_capacity(references.len());
    let mut skipped = 0usize;
    for reference in references {
        if reference.name.trim().is_empty() {
            skipped += 1;
            continue;
        }
        records.push(derive(reference, pricing, now, rng));
    }
    DerivedBatch { records, skipped }
}
