//! Axum JSON API for the country refresh service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ccx_adapters::SourceGateway;
use ccx_core::{RefreshJob, StoredCountry};
use ccx_storage::ArtifactStore;
use ccx_sync::{
    maybe_build_scheduler, open_store, CountryQuery, CountryStore, RefreshConfig,
    RefreshController, SortOrder, StartOutcome, StoreStats,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub mod error;
pub mod summary;

pub use error::ApiError;
pub use summary::{format_gdp, render_summary_svg, SvgSummaryRenderer, SUMMARY_ARTIFACT};

pub const CRATE_NAME: &str = "ccx-web";
pub const API_PREFIX: &str = "/api/v1";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CountryStore>,
    pub controller: Arc<RefreshController>,
    pub artifacts: Arc<ArtifactStore>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CountryStore>,
        controller: Arc<RefreshController>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            store,
            controller,
            artifacts,
        }
    }

    /// Store, source gateway, artifact cache and controller wired from configuration.
    pub async fn from_config(config: &RefreshConfig) -> anyhow::Result<Self> {
        let store = open_store(config).await?;
        let artifacts = Arc::new(ArtifactStore::open_writable(config.cache_dir.clone()).await?);
        let gateway = Arc::new(SourceGateway::from_config(&config.gateway).context("building source gateway")?);
        let renderer = Arc::new(SvgSummaryRenderer::new(artifacts.clone()));
        let controller = Arc::new(RefreshController::new(
            gateway,
            store.clone(),
            renderer,
            config.controller_options(),
        ));
        Ok(Self::new(store, controller, artifacts))
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub refresh: RefreshConfig,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("CCX_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("CCX_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            refresh: RefreshConfig::from_env(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CountriesParams {
    region: Option<String>,
    currency: Option<String>,
    sort: Option<String>,
}

impl CountriesParams {
    fn into_query(self) -> Result<CountryQuery, ApiError> {
        let present = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let sort = match present(self.sort) {
            Some(raw) => Some(
                raw.parse::<SortOrder>()
                    .map_err(|err| ApiError::Validation(json!({ "sort": err.to_string() })))?,
            ),
            None => None,
        };
        Ok(CountryQuery {
            region: present(self.region),
            currency: present(self.currency),
            sort,
        })
    }
}

#[derive(Debug, Serialize)]
struct RefreshStatusBody {
    is_running: bool,
    #[serde(flatten)]
    job: RefreshJob,
}

/// `/` and `/health` at the root, everything else under [`API_PREFIX`].
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status_handler))
        .route("/countries", get(list_countries_handler))
        .route("/countries/refresh", post(refresh_handler))
        .route("/countries/refresh/status", get(refresh_status_handler))
        .route("/countries/image", get(summary_image_handler))
        .route(
            "/countries/{name}",
            get(get_country_handler).delete(delete_country_handler),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .nest(API_PREFIX, api)
        .layer(cors)
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config.refresh).await?;
    // held for the lifetime of the server
    let _scheduler = maybe_build_scheduler(&config.refresh, state.controller.clone()).await?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn index_handler() -> Json<Value> {
    Json(json!({
        "message": "Country Currency & Exchange API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "refresh": "POST /api/v1/countries/refresh",
            "refresh_status": "GET /api/v1/countries/refresh/status",
            "countries": "GET /api/v1/countries",
            "country": "GET /api/v1/countries/{name}",
            "delete": "DELETE /api/v1/countries/{name}",
            "status": "GET /api/v1/status",
            "image": "GET /api/v1/countries/image",
            "health": "GET /health"
        }
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<StartOutcome>) {
    (StatusCode::ACCEPTED, Json(state.controller.start()))
}

async fn refresh_status_handler(State(state): State<Arc<AppState>>) -> Json<RefreshStatusBody> {
    let job = state.controller.status();
    Json(RefreshStatusBody {
        is_running: job.is_running(),
        job,
    })
}

async fn list_countries_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CountriesParams>,
) -> Result<Json<Vec<StoredCountry>>, ApiError> {
    let query = params.into_query()?;
    Ok(Json(state.store.list(&query).await?))
}

async fn get_country_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<StoredCountry>, ApiError> {
    state
        .store
        .get_by_name(&name)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("Country not found"))
}

async fn delete_country_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_by_name(&name).await? {
        return Err(ApiError::NotFound("Country not found"));
    }
    info!(name = %name, "country deleted");
    Ok(Json(json!({ "message": format!("Country '{name}' deleted successfully") })))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

async fn summary_image_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let artifact = state
        .artifacts
        .read_artifact(SUMMARY_ARTIFACT)
        .await?
        .ok_or(ApiError::NotFound("Summary image not found"))?;
    let etag = format!("\"{}\"", artifact.content_hash);

    let cached = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag));
    if cached {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (header::ETAG, etag),
        ],
        artifact.bytes,
    )
        .into_response())
}
