//! Read-only JSON API over the tender store for dashboards and exports.

use std::path::PathBuf;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tivs_core::{TenderId, TenderItem};
use tivs_storage::{query::MAX_PER_PAGE, Partition, StoreError, TenderDetail, TenderQuery, TenderStore};
use tivs_sync::report::read_run_report;
use tivs_sync::SyncConfig;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tivs-web";

#[derive(Clone)]
pub struct AppState {
    pub store: TenderStore,
    pub reports_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(store: TenderStore) -> Self {
        Self {
            store,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }
}

/// Failures as callers see them: a status and a short message, never the
/// underlying storage error for server-side faults.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownPortal(_) | StoreError::PortalNotFound(_) | StoreError::UnknownRun(_) => {
                Self::not_found(err.to_string())
            }
            other => {
                error!(error = %other, "store read failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    scope: Partition,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<u32>,
}

impl LimitParams {
    fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_PER_PAGE)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/tenders", get(tenders_handler))
        .route("/api/tenders/{id}", get(tender_detail_handler))
        .route("/api/search", get(search_handler))
        .route("/api/portals", get(portals_handler))
        .route("/api/portals/health", get(portal_health_handler))
        .route("/api/portals/{slug}/runs", get(portal_runs_handler))
        .route("/api/runs/{id}", get(run_handler))
        .route("/api/runs/{id}/report", get(run_report_handler))
        .route("/api/backups", get(backups_handler))
        .route("/api/integrity", get(integrity_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "serving tender api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = config.open_store().await?;
    let listener = TcpListener::bind(&config.bind_addr).await?;
    serve(listener, AppState::new(store).with_reports_dir(&config.reports_dir)).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn tenders_handler(
    State(state): State<AppState>,
    Query(query): Query<TenderQuery>,
) -> ApiResult<tivs_storage::Page<TenderItem>> {
    Ok(Json(state.store.list_tenders(&query).await?))
}

async fn tender_detail_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<TenderId>,
) -> ApiResult<TenderDetail> {
    let detail = state
        .store
        .tender_detail(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("tender {id} not found")))?;
    Ok(Json(detail))
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<TenderItem>> {
    if params.q.trim().is_empty() {
        return Err(ApiError::bad_request("query parameter `q` is required"));
    }
    let limit = params.limit.unwrap_or(50).clamp(1, MAX_PER_PAGE);
    Ok(Json(state.store.search(&params.q, params.scope, limit).await?))
}

async fn portals_handler(State(state): State<AppState>) -> ApiResult<Vec<tivs_core::Portal>> {
    Ok(Json(state.store.list_portals().await?))
}

async fn portal_health_handler(State(state): State<AppState>) -> ApiResult<Vec<tivs_storage::PortalHealth>> {
    Ok(Json(state.store.portal_health().await?))
}

async fn portal_runs_handler(
    State(state): State<AppState>,
    AxumPath(slug): AxumPath<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<tivs_core::ScrapeRun>> {
    let portal = state.store.get_portal(&slug).await?;
    Ok(Json(state.store.runs_for_portal(portal.id, params.limit_or(20)).await?))
}

async fn run_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<tivs_core::RunId>,
) -> ApiResult<tivs_core::ScrapeRun> {
    Ok(Json(state.store.get_run(id).await?))
}

async fn run_report_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<tivs_core::RunId>,
) -> ApiResult<tivs_sync::RunReport> {
    let Some(dir) = &state.reports_dir else {
        return Err(ApiError::not_found("run reports are not enabled"));
    };
    read_run_report(dir, id)
        .await
        .map(Json)
        .map_err(|_| ApiError::not_found(format!("no report for run {id}")))
}

async fn backups_handler(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<tivs_core::BackupRecord>> {
    Ok(Json(state.store.backup_records(params.limit_or(50)).await?))
}

async fn integrity_handler(State(state): State<AppState>) -> ApiResult<tivs_storage::IntegrityReport> {
    Ok(Json(state.store.verify_integrity().await?))
}
