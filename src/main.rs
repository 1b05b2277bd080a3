mod cancel;
mod config;
mod http;
mod jobs;
mod llm;
mod mapping;
mod metrics;
mod models;
mod pipeline;
mod prompts;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cancel::CancelToken;
use config::AppConfig;
use jobs::{JobError, JobInfo, JobQueue};
use llm::{FallbackClient, FallbackSettings, LlmError, OpenAiCompatibleBackend};
use mapping::{FieldMapper, MappingError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, ApplyMappingsRequest, ApplyMappingsResponse, BatchResponse, EnhanceRequest,
    GenerateRequest, InferMappingsRequest, InferMappingsResponse, OverridesRequest,
    OverridesResponse,
};
use pipeline::{EnhanceError, Pipeline, PipelineConfig, TaskOutput};
use prompts::Task;
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "listing.api", "server crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = AppConfig::from_env()?;
    info!(
        target = "listing.api",
        base_url = %config.llm.base_url,
        default_model = %config.llm.default_model,
        fallbacks = config.llm.fallback_models.len(),
        max_retries = config.llm.max_retries,
        concurrency = config.enhance.concurrency,
        "configuration loaded"
    );

    let backend = Arc::new(OpenAiCompatibleBackend::new(&config.llm, &config.http));
    let llm = FallbackClient::new(
        backend,
        FallbackSettings {
            fallback_models: config.llm.fallback_models.clone(),
            max_retries: config.llm.max_retries,
            retry_delay: config.llm.retry_delay,
        },
    );
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState::new(&config, llm, prometheus_handle);
    let app = router(state, config.server.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    info!(target = "listing.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    mapper: FieldMapper,
    queue: JobQueue,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    max_batch_records: usize,
    batch_deadline: Option<Duration>,
}

impl AppState {
    fn new(config: &AppConfig, llm: FallbackClient, prometheus_handle: PrometheusHandle) -> Self {
        let pipeline = Pipeline::new(
            llm.clone(),
            PipelineConfig {
                default_model: config.llm.default_model.clone(),
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
                concurrency: config.enhance.concurrency,
            },
        );
        let mapper = FieldMapper::new(llm, config.llm.default_model.clone());
        let (queue, _worker) = JobQueue::spawn(
            pipeline.clone(),
            config.server.queue_capacity,
            config.server.job_retention,
            config.enhance.batch_deadline,
        );
        let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or_else(|_| json!({"openapi": "3.0.3"}));
        Self {
            pipeline,
            mapper,
            queue,
            openapi: Arc::new(openapi),
            prometheus_handle,
            metrics_key: config.server.metrics_key.clone(),
            max_batch_records: config.enhance.max_batch_records,
            batch_deadline: config.enhance.batch_deadline,
        }
    }

    fn request_token(&self) -> CancelToken {
        match self.batch_deadline {
            Some(limit) => CancelToken::never().with_deadline(Instant::now() + limit),
            None => CancelToken::never(),
        }
    }

    fn check_batch_size(&self, records: usize) -> Result<(), AppError> {
        if records > self.max_batch_records {
            return Err(AppError::Invalid(format!(
                "batch has {records} records, the limit is {}",
                self.max_batch_records
            )));
        }
        Ok(())
    }
}

fn router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/enhance", post(enhance))
        .route("/enhance/field", post(enhance_field))
        .nest(
            "/mappings",
            Router::new()
                .route("/infer", post(infer_mappings))
                .route("/apply", post(apply_mappings)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/enhance", post(enqueue_enhance_job))
                .route("/{id}", get(get_job_status).delete(cancel_job)),
        )
        .route("/records/overrides", post(apply_overrides))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "template_version": prompts::TEMPLATE_VERSION,
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Enhance a batch of product records for one marketplace.
///
/// - Method: `POST`
/// - Path: `/enhance`
/// - Body: `EnhanceRequest`
/// - Response: `BatchResponse`, one result per input record in input order.
///   Per-record failures are reported inline, never as an HTTP error.
async fn enhance(
    State(state): State<AppState>,
    Json(payload): Json<EnhanceRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    crate::metrics::inc_requests("/enhance");
    state.check_batch_size(payload.records.len())?;
    info!(
        target = "listing.api",
        records = payload.records.len(),
        marketplace = %payload.marketplace,
        "enhance invoked"
    );
    let response = state.pipeline.run(payload, &state.request_token()).await;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    task: Task,
    #[serde(flatten)]
    output: TaskOutput,
}

/// Generate content for a single task (title, bullets, category...) without
/// running the full enhancement.
async fn enhance_field(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    crate::metrics::inc_requests("/enhance/field");
    let output = state
        .pipeline
        .generate(
            payload.task,
            &payload.record,
            &payload.marketplace,
            &payload.model,
            &state.request_token(),
        )
        .await?;
    Ok(Json(GenerateResponse {
        task: payload.task,
        output,
    }))
}

async fn infer_mappings(
    State(state): State<AppState>,
    Json(payload): Json<InferMappingsRequest>,
) -> Result<Json<InferMappingsResponse>, AppError> {
    crate::metrics::inc_requests("/mappings/infer");
    let mappings = state
        .mapper
        .infer_mappings(&payload.headers, &payload.sample_rows, &state.request_token())
        .await?;
    Ok(Json(InferMappingsResponse { mappings }))
}

async fn apply_mappings(
    State(state): State<AppState>,
    Json(payload): Json<ApplyMappingsRequest>,
) -> Result<Json<ApplyMappingsResponse>, AppError> {
    crate::metrics::inc_requests("/mappings/apply");
    state.check_batch_size(payload.rows.len())?;
    let records = mapping::apply_mappings(&payload.mappings, &payload.rows);
    Ok(Json(ApplyMappingsResponse { records }))
}

async fn apply_overrides(Json(payload): Json<OverridesRequest>) -> Json<OverridesResponse> {
    crate::metrics::inc_requests("/records/overrides");
    Json(pipeline::apply_overrides(payload.results, payload.overrides))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_enhance_job(
    State(state): State<AppState>,
    Json(payload): Json<EnhanceRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/enhance");
    state.check_batch_size(payload.records.len())?;
    let id = state.queue.enqueue(payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let id = parse_job_id(&id)?;
    state
        .queue
        .get(id)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    crate::metrics::inc_requests("/jobs/cancel");
    let id = parse_job_id(&id)?;
    state
        .queue
        .cancel(id)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::Invalid("invalid_job_id".into()))
}

#[derive(Debug)]
enum AppError {
    Invalid(String),
    NotFound(&'static str),
    Upstream(String),
    Cancelled,
    Internal(String),
}

impl From<EnhanceError> for AppError {
    fn from(err: EnhanceError) -> Self {
        match err {
            EnhanceError::UnsupportedTask(_) => AppError::Invalid(err.to_string()),
            EnhanceError::Cancelled => AppError::Cancelled,
            EnhanceError::Llm(_) | EnhanceError::Parse(_) => AppError::Upstream(err.to_string()),
            EnhanceError::Template(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<MappingError> for AppError {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::NoHeaders => AppError::Invalid(err.to_string()),
            MappingError::Llm(LlmError::Cancelled) => AppError::Cancelled,
            MappingError::Llm(_) | MappingError::Malformed(_) => {
                AppError::Upstream(err.to_string())
            }
            MappingError::Template(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Invalid(detail) => (StatusCode::BAD_REQUEST, "invalid_input", Some(detail)),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", Some(what.to_string())),
            AppError::Upstream(detail) => (StatusCode::BAD_GATEWAY, "upstream_failed", Some(detail)),
            AppError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled", None),
            AppError::Internal(detail) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(detail))
            }
        };
        if status.is_server_error() {
            warn!(target = "listing.api", status = status.as_u16(), error, detail = ?detail, "request failed");
        }
        let payload = ApiError {
            error: error.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{ScriptedBackend, server_error};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_config(max_batch_records: usize, metrics_key: Option<&str>) -> AppConfig {
        let mut config = AppConfig::from_lookup(|key: &str| match key {
            "LLM_API_KEY" => Some("sk-test".to_string()),
            "LLM_FALLBACK_MODELS" => Some("anthropic/claude-3.5-sonnet".to_string()),
            "LLM_RETRY_DELAY_MS" => Some("1".to_string()),
            _ => None,
        })
        .expect("config");
        config.enhance.max_batch_records = max_batch_records;
        config.server.metrics_key = metrics_key.map(str::to_string);
        config
    }

    fn app_with(backend: ScriptedBackend, config: &AppConfig) -> Router {
        let llm = FallbackClient::new(
            backend.into_arc(),
            FallbackSettings {
                fallback_models: config.llm.fallback_models.clone(),
                max_retries: config.llm.max_retries,
                retry_delay: config.llm.retry_delay,
            },
        );
        let handle = PrometheusBuilder::new().build_recorder().handle();
        router(AppState::new(config, llm, handle), 1024 * 1024)
    }

    fn app(backend: ScriptedBackend) -> Router {
        app_with(backend, &test_config(10, None))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = app(ScriptedBackend::always("{}"))
            .oneshot(get("/health"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_is_served_as_json() {
        let response = app(ScriptedBackend::always("{}"))
            .oneshot(get("/openapi.json"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await;
        assert!(doc["paths"]["/enhance"].is_object());
    }

    #[tokio::test]
    async fn enhance_returns_result_per_record() {
        let backend = ScriptedBackend::always(
            "{\"title\": \"Ergonomic Office Chair\", \"bullet_points\": [\"a\", \"b\"]}",
        );
        let response = app(backend)
            .oneshot(post_json(
                "/enhance",
                json!({
                    "records": [
                        {"product_id": "SKU-1", "title": "Chair", "price": 129.0},
                        {"product_id": "SKU-2", "title": "Desk"}
                    ],
                    "marketplace": "amazon",
                    "model": "claude"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["marketplace"], "Amazon");
        assert_eq!(body["model"], "anthropic/claude-3.5-sonnet");
        assert_eq!(body["enhanced_count"], 2);
        assert_eq!(body["results"][0]["record"]["product_id"], "SKU-1");
        assert_eq!(body["results"][0]["record"]["title"], "Ergonomic Office Chair");
        assert_eq!(body["results"][0]["record"]["price"], 129.0);
        assert_eq!(body["results"][1]["record"]["product_id"], "SKU-2");
    }

    #[tokio::test]
    async fn enhance_reports_failures_inline() {
        let backend = ScriptedBackend::new(|_| Err(server_error()));
        let response = app(backend)
            .oneshot(post_json(
                "/enhance",
                json!({"records": [{"product_id": "1", "title": "Lamp"}]}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["failed_count"], 1);
        assert_eq!(body["results"][0]["enhanced"], false);
        assert_eq!(body["results"][0]["record"]["title"], "Lamp");
        assert!(body["results"][0]["error"].is_string());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let records: Vec<Value> = (0..3)
            .map(|i| json!({"product_id": format!("{i}"), "title": "x"}))
            .collect();
        let response = app_with(ScriptedBackend::always("{}"), &test_config(2, None))
            .oneshot(post_json("/enhance", json!({ "records": records })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_input");
    }

    #[tokio::test]
    async fn field_generation_returns_task_output() {
        let backend = ScriptedBackend::always("{\"brand\": \"Acme\", \"confidence\": 0.5}");
        let response = app(backend)
            .oneshot(post_json(
                "/enhance/field",
                json!({
                    "record": {"product_id": "1", "title": "Acme anvil"},
                    "task": "brand"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"task": "brand", "kind": "suggestion", "value": "Acme", "confidence": 0.5})
        );
    }

    #[tokio::test]
    async fn field_generation_rejects_batch_tasks() {
        let response = app(ScriptedBackend::always("{}"))
            .oneshot(post_json(
                "/enhance/field",
                json!({
                    "record": {"product_id": "1", "title": "x"},
                    "task": "listing_enhancement"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mapping_inference_round_trip() {
        let backend = ScriptedBackend::always(
            &json!({
                "column_mappings": [
                    {"original_column": "prod_sku", "standard_field": "sku", "confidence": 0.9},
                    {"original_column": "foobar", "standard_field": "nonsense", "confidence": 0.4}
                ]
            })
            .to_string(),
        );
        let response = app(backend)
            .oneshot(post_json(
                "/mappings/infer",
                json!({
                    "headers": ["prod_sku", "foobar"],
                    "sample_rows": [{"prod_sku": "A1", "foobar": "?"}]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["mappings"][0]["standard_field"], "sku");
        assert_eq!(body["mappings"][1]["standard_field"], "unmapped");
    }

    #[tokio::test]
    async fn mapping_inference_upstream_failure_is_bad_gateway() {
        let backend = ScriptedBackend::new(|_| Err(server_error()));
        let response = app(backend)
            .oneshot(post_json(
                "/mappings/infer",
                json!({"headers": ["a"], "sample_rows": []}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"], "upstream_failed");
    }

    #[tokio::test]
    async fn mapping_inference_without_headers_is_bad_request() {
        let response = app(ScriptedBackend::always("{}"))
            .oneshot(post_json("/mappings/infer", json!({"headers": []})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn apply_mappings_builds_records() {
        let response = app(ScriptedBackend::always("{}"))
            .oneshot(post_json(
                "/mappings/apply",
                json!({
                    "mappings": [
                        {"original_column": "Name", "standard_field": "title", "confidence": 1.0, "notes": ""},
                        {"original_column": "Cost", "standard_field": "price", "confidence": 1.0, "notes": ""}
                    ],
                    "rows": [{"Name": "Chair", "Cost": "$19.99"}]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["records"][0]["title"], "Chair");
        assert_eq!(body["records"][0]["price"], 19.99);
        assert_eq!(body["records"][0]["product_id"], "row-1");
    }

    #[tokio::test]
    async fn overrides_mark_results_edited() {
        let response = app(ScriptedBackend::always("{}"))
            .oneshot(post_json(
                "/records/overrides",
                json!({
                    "results": [{
                        "record": {"product_id": "1", "title": "Old"},
                        "enhanced": true,
                        "timestamp": "2024-05-01T12:00:00Z"
                    }],
                    "overrides": [
                        {"product_id": "1", "fields": {"title": "New"}},
                        {"product_id": "9", "fields": {"title": "Ghost"}}
                    ]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["results"][0]["record"]["title"], "New");
        assert_eq!(body["results"][0]["edited"], true);
        assert_eq!(body["unmatched"], json!(["9"]));
    }

    #[tokio::test]
    async fn job_lifecycle_over_http() {
        let app = app(ScriptedBackend::always("{\"title\": \"Job title\"}"));
        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs/enhance",
                json!({"records": [{"product_id": "1", "title": "x"}]}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = body_json(response).await["job_id"]
            .as_str()
            .expect("job id")
            .to_string();

        let mut state = Value::Null;
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(get(&format!("/jobs/{job_id}")))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            state = body_json(response).await;
            if state["state"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state["state"], "completed");
        assert_eq!(state["result"]["results"][0]["record"]["title"], "Job title");
    }

    #[tokio::test]
    async fn job_ids_are_validated() {
        let app = app(ScriptedBackend::always("{}"));
        let bad = app
            .clone()
            .oneshot(get("/jobs/not-a-uuid"))
            .await
            .expect("response");
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/jobs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_require_key_when_configured() {
        let app = app_with(ScriptedBackend::always("{}"), &test_config(10, Some("s3cret")));
        let denied = app
            .clone()
            .oneshot(get("/metrics"))
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .header("X-Metrics-Key", "s3cret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
