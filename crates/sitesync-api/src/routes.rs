use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sitesync_core::models::{SyncResult, SyncRunLog};
use sitesync_core::sync::SyncNodeStatus;
use sitesync_core::transport::wire::{
    ChangesQuery, ChangesResponse, HealthResponse, PushBatchRequest, PushBatchResponse,
    PushRecordRequest, PushRecordResponse, ReceiveRequest,
};
use sitesync_core::util::parse_timestamp;
use sitesync_core::SyncService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{caller_server_id, extract_api_key, keys_match};
use crate::error::AppError;

const DEFAULT_LOG_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    api_key: Arc<str>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, api_key: &str) -> Self {
        Self {
            service,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/changes/{table}", get(changes))
        .route("/sync/records/{table}", post(push_record))
        .route("/sync/batch/{table}", post(push_batch))
        .route("/sync/receive/{table}", post(receive))
        .route("/sync/trigger", post(trigger))
        .route("/sync/status", get(status))
        .route("/sync/logs", get(logs))
        .route("/sync/auto/start", post(start_auto_sync))
        .route("/sync/auto/stop", post(stop_auto_sync))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/sync/health", get(health))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        server_id: state.service.server_id().to_string(),
    })
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = extract_api_key(request.headers())?;
    if !keys_match(&state.api_key, provided) {
        tracing::warn!(
            path = %request.uri().path(),
            caller = caller_server_id(request.headers()).as_deref().unwrap_or("unknown"),
            "Rejected request with invalid api key"
        );
        return Err(AppError::unauthorized("Invalid api key"));
    }
    Ok(next.run(request).await)
}

async fn changes(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<ChangesQuery>,
    headers: HeaderMap,
) -> Result<Json<ChangesResponse>, AppError> {
    let since = match query.since.as_deref().map(str::trim) {
        None | Some("") => DateTime::<Utc>::UNIX_EPOCH,
        Some(value) => parse_timestamp(value)
            .ok_or_else(|| AppError::bad_request(format!("Invalid since timestamp '{value}'")))?,
    };
    let requester = query.server_id.or_else(|| caller_server_id(&headers));

    let records = state
        .service
        .ingestor()
        .changes_since(&table, since, requester.as_deref())
        .await?;
    tracing::debug!(
        endpoint = "changes",
        table = %table,
        records = records.len(),
        requester = requester.as_deref().unwrap_or("none"),
        "Served change feed"
    );
    Ok(Json(ChangesResponse {
        records,
        timestamp: Utc::now(),
    }))
}

async fn push_record(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(request): Json<PushRecordRequest>,
) -> Result<(StatusCode, Json<PushRecordResponse>), AppError> {
    let ingest_status = state
        .service
        .ingestor()
        .ingest(&table, request.record)
        .await?;
    let status = if ingest_status.is_applied() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    tracing::debug!(
        endpoint = "records",
        table = %table,
        status = ?ingest_status,
        "Stored pushed record"
    );
    Ok((
        status,
        Json(PushRecordResponse {
            status: ingest_status,
        }),
    ))
}

async fn push_batch(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(request): Json<PushBatchRequest>,
) -> Result<Json<PushBatchResponse>, AppError> {
    let results = state
        .service
        .ingestor()
        .ingest_batch(&table, request.records)
        .await?;
    let response = PushBatchResponse::from_results(results);
    tracing::info!(
        endpoint = "batch",
        table = %table,
        applied = response.applied,
        conflicts = response.conflicts,
        failed = response.failed,
        "Stored pushed batch"
    );
    Ok(Json(response))
}

async fn receive(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(request): Json<ReceiveRequest>,
) -> Result<Json<SyncResult>, AppError> {
    let result = state
        .service
        .synchronizer()
        .apply_remote(&table, request.records)
        .await?;
    tracing::info!(
        endpoint = "receive",
        table = %table,
        records = result.records_processed,
        conflicts = result.conflicts.len(),
        "Applied received records"
    );
    Ok(Json(result))
}

/// The cycle runs on its own task so a client hanging up does not abandon it
async fn trigger(State(state): State<AppState>) -> Result<Json<SyncRunLog>, AppError> {
    let orchestrator = Arc::clone(state.service.orchestrator());
    let log = tokio::spawn(async move { orchestrator.perform_sync().await })
        .await
        .map_err(|error| AppError::Internal(format!("sync cycle task failed: {error}")))?;
    Ok(Json(log))
}

async fn status(State(state): State<AppState>) -> Result<Json<SyncNodeStatus>, AppError> {
    Ok(Json(state.service.orchestrator().status().await?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<SyncRunLog>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(state.service.orchestrator().recent_logs(limit).await?))
}

#[derive(Debug, Deserialize)]
struct AutoSyncRequest {
    interval_minutes: u64,
}

#[derive(Debug, Serialize)]
struct AutoSyncResponse {
    auto_sync_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_minutes: Option<u64>,
}

async fn start_auto_sync(
    State(state): State<AppState>,
    Json(request): Json<AutoSyncRequest>,
) -> Result<Json<AutoSyncResponse>, AppError> {
    let orchestrator = state.service.orchestrator();
    orchestrator.start_auto_sync(request.interval_minutes)?;
    Ok(Json(AutoSyncResponse {
        auto_sync_enabled: true,
        interval_minutes: orchestrator.auto_sync_interval(),
    }))
}

async fn stop_auto_sync(State(state): State<AppState>) -> Json<AutoSyncResponse> {
    state.service.orchestrator().stop_auto_sync();
    Json(AutoSyncResponse {
        auto_sync_enabled: false,
        interval_minutes: None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use sitesync_core::config::SyncConfig;
    use sitesync_core::db::Database;
    use sitesync_core::models::ChangeRecord;
    use sitesync_core::transport::wire::{BatchRecordResult, IngestStatus, API_KEY_HEADER};
    use sitesync_core::transport::{SyncTransport, TransportError};
    use tower::ServiceExt;

    use super::*;

    const SCHEMA: &str = "
        CREATE TABLE marks (
            id INTEGER PRIMARY KEY,
            score INTEGER,
            created_at TEXT,
            updated_at TEXT NOT NULL,
            server_id TEXT
        );
    ";

    /// Remote that is reachable, holds nothing and accepts every push
    struct QuietRemote {
        pull_delay: Duration,
    }

    #[async_trait]
    impl SyncTransport for QuietRemote {
        async fn pull(
            &self,
            _table: &str,
            _since: DateTime<Utc>,
            _server_id: &str,
        ) -> Result<Vec<ChangeRecord>, TransportError> {
            tokio::time::sleep(self.pull_delay).await;
            Ok(Vec::new())
        }

        async fn push_one(
            &self,
            _table: &str,
            _record: &ChangeRecord,
        ) -> Result<IngestStatus, TransportError> {
            Ok(IngestStatus::Inserted)
        }

        async fn push_chunk(
            &self,
            _table: &str,
            records: &[ChangeRecord],
        ) -> Result<Vec<BatchRecordResult>, TransportError> {
            Ok(records
                .iter()
                .map(|record| BatchRecordResult {
                    id: record.id(),
                    status: IngestStatus::Inserted,
                    error: None,
                })
                .collect())
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    async fn test_router() -> Router {
        test_router_with(Duration::ZERO).await
    }

    async fn test_router_with(pull_delay: Duration) -> Router {
        let map = HashMap::from([
            ("SYNC_REMOTE_URL", "http://site-a.local"),
            ("SYNC_API_KEY", "secret"),
            ("SYNC_SERVER_ID", "central"),
        ]);
        let config =
            SyncConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        let database = Database::open_in_memory().await.unwrap();
        database.connection().execute_batch(SCHEMA).await.unwrap();
        let remote = Arc::new(QuietRemote { pull_delay });
        let service = SyncService::with_transport(database, remote, &config)
            .await
            .unwrap();
        app_router(AppState::new(Arc::new(service), "secret"))
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(API_KEY_HEADER, "secret");
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn push_body(record: Value) -> Value {
        json!({"record": record, "timestamp": "2024-03-02T09:00:00Z"})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_is_public_and_other_routes_need_the_key() {
        let router = test_router().await;

        let response = router
            .clone()
            .oneshot(Request::get("/sync/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["server_id"], "central");

        let missing = router
            .clone()
            .oneshot(Request::get("/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = router
            .clone()
            .oneshot(
                Request::get("/sync/status")
                    .header(API_KEY_HEADER, "guess")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pushed_record_is_stored_and_stale_copy_conflicts() {
        let router = test_router().await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/sync/records/marks",
            Some(push_body(json!({"id": 7, "score": 16, "server_id": "site-b",
                                  "updated_at": "2024-03-02T08:00:00Z"}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "inserted"}));

        let (status, body) = send(
            &router,
            Method::POST,
            "/sync/records/marks",
            Some(push_body(json!({"id": 7, "score": 14, "server_id": "site-a",
                                  "updated_at": "2024-03-01T08:00:00Z"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({"status": "conflict"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_feed_excludes_requester_origin() {
        let router = test_router().await;
        send(
            &router,
            Method::POST,
            "/sync/records/marks",
            Some(push_body(json!({"id": 1, "score": 10, "server_id": "site-a",
                                  "updated_at": "2024-03-02T08:00:00Z"}))),
        )
        .await;

        let (status, body) = send(
            &router,
            Method::GET,
            "/sync/changes/marks?since=2024-03-01T00:00:00Z&server_id=site-a",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"], json!([]));

        let (_, body) = send(
            &router,
            Method::GET,
            "/sync/changes/marks?since=2024-03-01T00:00:00Z&server_id=site-b",
            None,
        )
        .await;
        assert_eq!(body["records"].as_array().unwrap().len(), 1);
        assert_eq!(body["records"][0]["server_id"], "site-a");
        assert!(body["records"][0]["checksum"].is_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_input_and_unknown_tables_are_client_errors() {
        let router = test_router().await;

        let (status, _) = send(&router, Method::GET, "/sync/changes/payments", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) =
            send(&router, Method::GET, "/sync/changes/marks?since=yesterday", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("since"));

        let (status, _) = send(
            &router,
            Method::POST,
            "/sync/records/marks",
            Some(push_body(json!({"score": 3}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_reports_per_record_outcomes() {
        let router = test_router().await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/sync/batch/marks",
            Some(json!({
                "records": [
                    {"id": 1, "score": 10, "updated_at": "2024-03-01T08:00:00Z", "server_id": "site-a"},
                    {"score": 11},
                ],
                "timestamp": "2024-03-01T09:00:00Z",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied"], 1);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["results"][0]["status"], "inserted");
        assert_eq!(body["results"][1]["status"], "failed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_applies_through_the_synchronizer() {
        let router = test_router().await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/sync/receive/marks",
            Some(json!({"records": [
                {"id": 3, "score": 18, "updated_at": "2024-03-01T08:00:00Z", "server_id": "site-a"},
            ]})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records_processed"], 1);
        assert_eq!(body["conflicts"], json!([]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn triggered_cycle_finishes_after_client_hangs_up() {
        let router = test_router_with(Duration::from_millis(200)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            send(&router, Method::POST, "/sync/trigger", None),
        )
        .await;
        assert!(abandoned.is_err());

        let mut logs = Value::Null;
        for _ in 0..100 {
            (_, logs) = send(&router, Method::GET, "/sync/logs", None).await;
            if !logs.as_array().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["status"], "PARTIAL");

        let (_, node) = send(&router, Method::GET, "/sync/status", None).await;
        assert_eq!(node["sync_in_progress"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_then_logs_and_status() {
        let router = test_router().await;

        let (status, run) = send(&router, Method::POST, "/sync/trigger", None).await;
        assert_eq!(status, StatusCode::OK);
        // Only `marks` exists here, every other tier table is unknown
        assert_eq!(run["status"], "PARTIAL");

        let (_, logs) = send(&router, Method::GET, "/sync/logs?limit=5", None).await;
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["id"], run["id"]);

        let (_, node) = send(&router, Method::GET, "/sync/status", None).await;
        assert_eq!(node["last_sync_status"], "PARTIAL");
        assert_eq!(node["is_online"], true);
        assert_eq!(node["sync_in_progress"], false);
        assert_eq!(node["server_id"], "central");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_sync_can_be_started_and_stopped() {
        let router = test_router().await;

        let (status, _) = send(
            &router,
            Method::POST,
            "/sync/auto/start",
            Some(json!({"interval_minutes": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &router,
            Method::POST,
            "/sync/auto/start",
            Some(json!({"interval_minutes": 30})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"auto_sync_enabled": true, "interval_minutes": 30}));

        let (_, node) = send(&router, Method::GET, "/sync/status", None).await;
        assert_eq!(node["auto_sync_enabled"], true);

        let (_, body) = send(&router, Method::POST, "/sync/auto/stop", None).await;
        assert_eq!(body, json!({"auto_sync_enabled": false}));
    }
}
