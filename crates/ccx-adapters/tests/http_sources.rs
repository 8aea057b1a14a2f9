use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Json, Router};
use ccx_adapters::{
    ExchangeRateSource, PricingSource, ReferenceSource, RestCountriesSource, SourceError, SourceGateway,
    SourceKind,
};
use ccx_storage::{HttpClientConfig, HttpFetcher};
use serde_json::json;
use tokio::net::TcpListener;

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn fetcher(timeout: Duration) -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some("ccx-test".into()),
            ..Default::default()
        })
        .expect("fetcher"),
    )
}

fn upstream() -> Router {
    Router::new()
        .route(
            "/v2/all",
            get(|| async {
                Json(json!([
                    {"name": "Nigeria", "capital": "Abuja", "region": "Africa", "population": 206139589,
                     "flag": "https://flagcdn.com/ng.svg", "currencies": [{"code": "NGN"}]},
                    {"name": "Ghana", "capital": "Accra", "region": "Africa", "population": 31072940,
                     "flag": "https://flagcdn.com/gh.svg", "currencies": [{"code": "GHS"}]}
                ]))
            }),
        )
        .route(
            "/v6/latest/USD",
            get(|| async { Json(json!({"result": "success", "base_code": "USD", "rates": {"NGN": 1600.23, "GHS": 15.3}})) }),
        )
        .route(
            "/broken",
            get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"rates": {}}))
            }),
        )
}

#[tokio::test]
async fn http_sources_fetch_and_parse() {
    let base = serve(upstream()).await;
    let http = fetcher(Duration::from_secs(5));

    let reference = RestCountriesSource::new(http.clone(), format!("{base}/v2/all"));
    let pricing = ExchangeRateSource::new(http, format!("{base}/v6/latest/USD"));

    let countries = reference.fetch_reference().await.expect("reference");
    assert_eq!(countries.len(), 2);
    assert_eq!(countries[0].name, "Nigeria");

    let table = pricing.fetch_pricing().await.expect("pricing");
    assert_eq!(table.rate_for("GHS"), Some(15.3));
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let base = serve(upstream()).await;
    let pricing = ExchangeRateSource::new(fetcher(Duration::from_secs(5)), format!("{base}/broken"));
    let err = pricing.fetch_pricing().await.expect_err("502");
    assert!(matches!(err, SourceError::Fetch(_)));
    assert!(err.to_string().contains("502"));
}

#[tokio::test]
async fn gateway_over_http_fails_when_pricing_hangs() {
    let base = serve(upstream()).await;
    let http = fetcher(Duration::from_secs(10));
    let gateway = SourceGateway::new(
        Arc::new(RestCountriesSource::new(http.clone(), format!("{base}/v2/all"))),
        Arc::new(ExchangeRateSource::new(http, format!("{base}/slow"))),
        Duration::from_millis(200),
    );
    let err = gateway.fetch_all().await.expect_err("timeout");
    assert_eq!(err.which_source, SourceKind::Pricing);
    assert!(err.timed_out);
}
