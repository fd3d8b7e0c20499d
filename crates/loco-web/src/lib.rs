//! Axum JSON API over the loco cache.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use loco_core::{CollectionCounts, LocoSummary, RefreshStatus};
use loco_sync::{RefreshCoordinator, SummaryAssembler, SyncError};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "loco-web";

pub const API_NAME: &str = "Loco Data Summary API";
pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("LOCO_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8001);
        let cors_origins = parse_origins(&std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".into()));
        Self { port, cors_origins }
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    if origins.iter().any(|o| o == "*") {
        Vec::new()
    } else {
        origins
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RefreshCoordinator>,
    pub assembler: SummaryAssembler,
}

impl AppState {
    pub fn new(coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            assembler: SummaryAssembler::new(coordinator.clone()),
            coordinator,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    RefreshFailed(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Sync(err @ SyncError::NotFound { .. }) => (StatusCode::NOT_FOUND, err.to_string()),
            ApiError::Sync(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::RefreshFailed(err) => {
                error!(error = %err, "manual refresh failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Refresh failed: {err}"),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub counts: CollectionCounts,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub suggestions: Vec<String>,
}

pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().max_age(Duration::from_secs(600));
    if origins.is_empty() {
        return cors.allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = origin.as_str(), "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    // Credentials cannot be combined with wildcard methods or headers.
    cors.allow_origin(allowed)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn app(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api", get(root_handler))
        .route("/api/", get(root_handler))
        .route("/api/loco/{loco_no}", get(loco_summary_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/status", get(status_handler))
        .route("/api/search/{partial}", get(search_handler))
        .layer(build_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": API_NAME, "version": API_VERSION }))
}

async fn loco_summary_handler(
    State(state): State<AppState>,
    Path(loco_no): Path<String>,
) -> Result<Json<LocoSummary>, ApiError> {
    Ok(Json(state.assembler.get_summary(&loco_no).await?))
}

async fn refresh_handler(State(state): State<AppState>) -> Result<Json<RefreshResponse>, ApiError> {
    let counts = state
        .coordinator
        .refresh_all()
        .await
        .map_err(ApiError::RefreshFailed)?;
    Ok(Json(RefreshResponse {
        status: "success",
        message: "Data refreshed successfully",
        counts,
        refreshed_at: state.coordinator.last_refresh().await,
    }))
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<RefreshStatus>, ApiError> {
    Ok(Json(state.coordinator.status().await?))
}

async fn search_handler(
    State(state): State<AppState>,
    Path(partial): Path<String>,
) -> Result<Json<SearchResponse>, ApiError> {
    let suggestions = state.assembler.search(&partial).await?;
    Ok(Json(SearchResponse { suggestions }))
}

/// Bind, run one initial refresh, then serve until the process stops.
///
/// A failed initial refresh is logged and left for the next read to retry.
pub async fn serve(config: WebConfig, coordinator: Arc<RefreshCoordinator>) -> anyhow::Result<()> {
    info!("starting {API_NAME}");
    match coordinator.refresh_all().await {
        Ok(_) => info!("initial data refresh completed"),
        Err(err) => error!(error = %err, "initial data refresh failed"),
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(AppState::new(coordinator), &config.cors_origins)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use loco_adapters::CsvDirectorySource;
    use loco_storage::MemoryRecordStore;
    use loco_sync::ManualClock;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn fixtures_dir() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sheets")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn coordinator_for(dir: PathBuf) -> Arc<RefreshCoordinator> {
        Arc::new(
            RefreshCoordinator::new(
                Arc::new(CsvDirectorySource::new(dir)),
                Arc::new(MemoryRecordStore::new()),
            )
            .with_clock(Arc::new(ManualClock::new(t0()))),
        )
    }

    fn fixture_app() -> Router {
        app(AppState::new(coordinator_for(fixtures_dir())), &[])
    }

    async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn root_reports_name_and_version() {
        let (status, body) = send(fixture_app(), Method::GET, "/api/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Loco Data Summary API", "version": "1.0.0"}));
    }

    #[tokio::test]
    async fn loco_summary_returns_joined_record() {
        let (status, body) = send(fixture_app(), Method::GET, "/api/loco/27865.0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loco_no"], "27865");
        assert_eq!(body["schedules"].as_array().unwrap().len(), 2);
        assert_eq!(body["failures"].as_array().unwrap().len(), 1);
        assert!(!body["details"].as_array().unwrap().is_empty());
        assert!(body["details"]
            .as_array()
            .unwrap()
            .iter()
            .all(|d| d["field"] != "Type" && d["field"] != "Loco No."));
        assert_eq!(body["last_updated"], "2026-02-24T12:00:00Z");
    }

    #[tokio::test]
    async fn unknown_loco_is_404_with_detail() {
        let (status, body) = send(fixture_app(), Method::GET, "/api/loco/00000.0").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"detail": "No data found for loco number: 00000"}));
    }

    #[tokio::test]
    async fn status_moves_from_pending_to_active() {
        let app = fixture_app();
        let (_, before) = send(app.clone(), Method::GET, "/api/status").await;
        assert_eq!(before["status"], "pending");
        assert!(before["last_refresh"].is_null());
        assert_eq!(before["records_count"]["loco_data"], 0);

        let (status, refreshed) = send(app.clone(), Method::POST, "/api/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refreshed["status"], "success");
        assert_eq!(refreshed["message"], "Data refreshed successfully");
        assert_eq!(refreshed["counts"]["loco_data"], 4);
        assert_eq!(refreshed["refreshed_at"], "2026-02-24T12:00:00Z");

        let (_, after) = send(app, Method::GET, "/api/status").await;
        assert_eq!(after["status"], "active");
        assert_eq!(after["next_refresh"], "2026-02-24T18:00:00Z");
        assert_eq!(after["records_count"], refreshed["counts"]);
    }

    #[tokio::test]
    async fn refresh_failure_is_500_with_detail() {
        let missing = tempfile::tempdir().unwrap();
        let app = app(AppState::new(coordinator_for(missing.path().to_path_buf())), &[]);
        let (status, body) = send(app, Method::POST, "/api/refresh").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Refresh failed: "));
        assert!(detail.contains("Loco_list"));
    }

    #[tokio::test]
    async fn read_path_refresh_failure_is_500_without_prefix() {
        let missing = tempfile::tempdir().unwrap();
        let app = app(AppState::new(coordinator_for(missing.path().to_path_buf())), &[]);
        for uri in ["/api/loco/1", "/api/search/1"] {
            let (status, body) = send(app.clone(), Method::GET, uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
            let detail = body["detail"].as_str().unwrap();
            assert!(!detail.starts_with("Refresh failed"), "{detail}");
            assert!(detail.contains("Loco_list"), "{detail}");
        }
    }

    #[tokio::test]
    async fn search_with_blank_query_matches_nothing() {
        let (status, body) = send(fixture_app(), Method::GET, "/api/search/%20").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"suggestions": []}));
    }

    #[tokio::test]
    async fn search_returns_sorted_suggestions() {
        let (status, body) = send(fixture_app(), Method::GET, "/api/search/278").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"suggestions": ["27801", "27865", "28278", "31278"]}));
    }

    #[tokio::test]
    async fn cors_allows_any_origin_by_default() {
        let resp = fixture_app()
            .oneshot(
                Request::builder()
                    .uri("/api/")
                    .header(header::ORIGIN, "http://example.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn cors_with_explicit_origins_allows_credentials() {
        let origins = parse_origins("http://a.test, http://b.test");
        assert_eq!(origins, vec!["http://a.test", "http://b.test"]);
        let app = app(AppState::new(coordinator_for(fixtures_dir())), &origins);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/")
                    .header(header::ORIGIN, "http://b.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let headers = resp.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://b.test");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn wildcard_origin_means_any() {
        assert!(parse_origins("*").is_empty());
        assert!(parse_origins("http://a.test,*").is_empty());
        assert!(parse_origins(" , ").is_empty());
    }
}
