//! SVG summary card written to the artifact cache after each successful refresh.

use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use ccx_storage::ArtifactStore;
use ccx_sync::{ArtifactWriteFailure, SummaryRenderer, SummarySnapshot};
use tracing::debug;

pub const SUMMARY_ARTIFACT: &str = "summary.svg";

struct SummaryRow {
    rank: usize,
    name: String,
    gdp: String,
    y: usize,
}

#[derive(Template)]
#[template(path = "summary.svg", escape = "html")]
struct SummaryTemplate {
    total_countries: u64,
    last_refreshed: String,
    top_n: usize,
    rows: Vec<SummaryRow>,
    generated_at: String,
}

/// `1234567.891` -> `$1,234,567.89`.
pub fn format_gdp(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}${grouped}.{cents}")
}

pub fn render_summary_svg(snapshot: &SummarySnapshot) -> Result<String, askama::Error> {
    let rows = snapshot
        .top_countries
        .iter()
        .enumerate()
        .map(|(i, country)| SummaryRow {
            rank: i + 1,
            name: country.record.name.clone(),
            gdp: country
                .record
                .estimated_gdp
                .map(format_gdp)
                .unwrap_or_else(|| "N/A".to_string()),
            y: 290 + i * 35,
        })
        .collect::<Vec<_>>();

    SummaryTemplate {
        total_countries: snapshot.total_countries,
        last_refreshed: snapshot
            .last_refreshed_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "Never".to_string()),
        top_n: rows.len(),
        rows,
        generated_at: snapshot.generated_at.to_rfc3339(),
    }
    .render()
}

pub struct SvgSummaryRenderer {
    artifacts: Arc<ArtifactStore>,
}

impl SvgSummaryRenderer {
    pub fn new(artifacts: Arc<ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl SummaryRenderer for SvgSummaryRenderer {
    async fn render(&self, snapshot: &SummarySnapshot) -> Result<(), ArtifactWriteFailure> {
        let svg = render_summary_svg(snapshot).map_err(|e| ArtifactWriteFailure::Render(e.to_string()))?;
        let stored = self.artifacts.store_bytes(SUMMARY_ARTIFACT, svg.as_bytes()).await?;
        debug!(
            path = %stored.absolute_path.display(),
            bytes = stored.byte_size,
            unchanged = stored.unchanged,
            "summary artifact stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccx_core::{CountryRecord, StoredCountry};
    use chrono::{TimeZone, Utc};

    fn country(id: i64, name: &str, gdp: Option<f64>) -> StoredCountry {
        StoredCountry {
            id,
            record: CountryRecord {
                name: name.to_string(),
                capital: String::new(),
                region: "Europe".into(),
                population: 1,
                currency_code: None,
                exchange_rate: None,
                estimated_gdp: gdp,
                flag_url: String::new(),
                last_refreshed_at: Utc.with_ymd_and_hms(2026, 10, 19, 7, 5, 0).single().unwrap(),
            },
        }
    }

    fn snapshot(top: Vec<StoredCountry>) -> SummarySnapshot {
        SummarySnapshot {
            total_countries: 250,
            last_refreshed_at: Some(Utc.with_ymd_and_hms(2026, 10, 19, 7, 5, 0).single().unwrap()),
            top_countries: top,
            generated_at: Utc.with_ymd_and_hms(2026, 10, 19, 7, 6, 0).single().unwrap(),
        }
    }

    #[test]
    fn gdp_is_grouped_with_two_decimals() {
        assert_eq!(format_gdp(0.0), "$0.00");
        assert_eq!(format_gdp(999.999), "$1,000.00");
        assert_eq!(format_gdp(1_234_567.891), "$1,234,567.89");
        assert_eq!(format_gdp(-12_345.5), "-$12,345.50");
    }

    #[test]
    fn svg_lists_totals_and_ranked_countries() {
        let svg = render_summary_svg(&snapshot(vec![
            country(1, "United States", Some(25_000_000_000_000.0)),
            country(2, "China", Some(17_000_000_000_000.0)),
        ]))
        .unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("Total Countries: 250"));
        assert!(svg.contains("Last Refreshed: 2026-10-19 07:05:00 UTC"));
        assert!(svg.contains("1. United States - $25,000,000,000,000.00"));
        assert!(svg.contains("2. China"));
        assert!(!svg.contains("No priced countries yet"));
    }

    #[test]
    fn names_are_escaped_for_xml() {
        let svg = render_summary_svg(&snapshot(vec![country(1, "Trinidad & <Tobago>", Some(1.0))])).unwrap();
        assert!(svg.contains("Trinidad &amp; &lt;Tobago&gt;"));
    }

    #[test]
    fn empty_store_still_renders() {
        let mut empty = snapshot(vec![]);
        empty.last_refreshed_at = None;
        let svg = render_summary_svg(&empty).unwrap();
        assert!(svg.contains("Last Refreshed: Never"));
        assert!(svg.contains("No priced countries yet"));
    }

    #[tokio::test]
    async fn renderer_writes_through_the_artifact_store() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path()));
        let renderer = SvgSummaryRenderer::new(artifacts.clone());

        renderer.render(&snapshot(vec![country(1, "Ghana", Some(5.0))])).await.unwrap();

        let stored = artifacts.read_artifact(SUMMARY_ARTIFACT).await.unwrap().unwrap();
        assert!(String::from_utf8(stored.bytes).unwrap().contains("1. Ghana - $5.00"));
        assert_eq!(stored.content_hash.len(), 64);
    }
}
