//! REST surface under `/api/v1`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router as HttpRouter,
};
use gateway_resilience::retry_async_if;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::ab_test::{AbTestController, CloseReport};
use crate::error::{GatewayError, Result};
use crate::model::*;
use crate::router::{RouteOutcome, Router};
use crate::status::StatusManager;
use crate::store::RecordStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub router: Router,
    pub status: StatusManager,
    pub ab_tests: AbTestController,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
}

impl GatewayError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ConcurrencyConflict(_) | GatewayError::FeedbackAlreadySet(_) => StatusCode::CONFLICT,
            GatewayError::PredictorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PredictorTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() { tracing::warn!(error = %self, kind = self.kind(), "request failed"); }
        (status, Json(self.body())).into_response()
    }
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self { GatewayError::InvalidRequest(rejection.body_text()) }
}

/// `Json` whose rejections answer with the gateway error body.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(GatewayError))]
struct ApiJson<T>(T);

pub fn routes(state: Arc<AppState>) -> HttpRouter {
    let api = HttpRouter::new()
        .route("/endpoints", get(list_endpoints))
        .route("/endpoints/:id", get(get_endpoint))
        .route("/model_versions", get(list_model_versions))
        .route("/model_versions/:id", get(get_model_version))
        .route("/statuses", get(list_statuses).post(create_status))
        .route("/requests", get(list_requests))
        .route("/requests/:id", get(get_request).put(put_feedback))
        .route("/abtests", get(list_ab_tests).post(open_ab_test))
        .route("/abtests/:id", get(get_ab_test))
        .route("/:endpoint_name/predict", post(predict))
        .route("/stop_ab_test/:id", post(stop_ab_test));
    HttpRouter::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFilter {
    pub endpoint_id: Option<EndpointId>,
    pub model_version_id: Option<ModelVersionId>,
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Endpoint>>> {
    Ok(Json(state.store.endpoints().await?))
}

async fn get_endpoint(State(state): State<Arc<AppState>>, Path(id): Path<EndpointId>) -> Result<Json<Endpoint>> {
    state.store.endpoint(id).await?.map(Json).ok_or_else(|| GatewayError::not_found("endpoint", id))
}

#[derive(Debug, Serialize)]
pub struct ModelVersionView {
    #[serde(flatten)]
    pub model_version: ModelVersion,
    pub current_status: Option<Status>,
}

async fn view(state: &AppState, mv: ModelVersion) -> Result<ModelVersionView> {
    let current_status = state.status.current(mv.id).await?.map(|s| s.status);
    Ok(ModelVersionView { model_version: mv, current_status })
}

async fn list_model_versions(State(state): State<Arc<AppState>>, Query(filter): Query<ListFilter>) -> Result<Json<Vec<ModelVersionView>>> {
    let mut out = Vec::new();
    for mv in state.store.model_versions(filter.endpoint_id).await? {
        out.push(view(&state, mv).await?);
    }
    Ok(Json(out))
}

async fn get_model_version(State(state): State<Arc<AppState>>, Path(id): Path<ModelVersionId>) -> Result<Json<ModelVersionView>> {
    let mv = state.store.model_version(id).await?.ok_or_else(|| GatewayError::not_found("model version", id))?;
    Ok(Json(view(&state, mv).await?))
}

async fn list_statuses(State(state): State<Arc<AppState>>, Query(filter): Query<ListFilter>) -> Result<Json<Vec<StatusRecord>>> {
    Ok(Json(state.store.status_history(filter.model_version_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
    pub created_by: String,
    pub model_version_id: ModelVersionId,
}

async fn create_status(State(state): State<Arc<AppState>>, ApiJson(body): ApiJson<StatusBody>) -> Result<(StatusCode, Json<StatusRecord>)> {
    let new = NewStatus::new(body.model_version_id, body.status.parse()?, body.created_by);
    let status = &state.status;
    let record = retry_async_if(|| status.set_active(new.clone()), state.retry_attempts, state.retry_delay, GatewayError::is_retryable).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_requests(State(state): State<Arc<AppState>>, Query(filter): Query<ListFilter>) -> Result<Json<Vec<RequestLog>>> {
    Ok(Json(state.store.requests(filter.model_version_id).await?))
}

async fn get_request(State(state): State<Arc<AppState>>, Path(id): Path<RequestId>) -> Result<Json<RequestLog>> {
    state.store.request(id).await?.map(Json).ok_or_else(|| GatewayError::not_found("request", id))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub feedback: String,
}

async fn put_feedback(State(state): State<Arc<AppState>>, Path(id): Path<RequestId>, ApiJson(body): ApiJson<FeedbackBody>) -> Result<Json<RequestLog>> {
    Ok(Json(state.store.set_feedback(id, body.feedback).await?))
}

async fn list_ab_tests(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AbTest>>> {
    Ok(Json(state.ab_tests.list().await?))
}

async fn get_ab_test(State(state): State<Arc<AppState>>, Path(id): Path<AbTestId>) -> Result<Json<AbTest>> {
    Ok(Json(state.ab_tests.get(id).await?))
}

async fn open_ab_test(State(state): State<Arc<AppState>>, ApiJson(body): ApiJson<NewAbTest>) -> Result<(StatusCode, Json<AbTest>)> {
    Ok((StatusCode::CREATED, Json(state.ab_tests.open_test(body).await?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    pub status: Option<String>,
    pub version: Option<String>,
}

async fn predict(
    State(state): State<Arc<AppState>>,
    Path(endpoint_name): Path<String>,
    Query(query): Query<PredictQuery>,
    ApiJson(payload): ApiJson<Value>,
) -> Result<Json<RouteOutcome>> {
    let status = match query.status.as_deref() {
        Some(s) => s.parse()?,
        None => Status::Production,
    };
    Ok(Json(state.router.route(&endpoint_name, status, query.version.as_deref(), payload).await?))
}

async fn stop_ab_test(State(state): State<Arc<AppState>>, Path(id): Path<AbTestId>) -> Result<Json<CloseReport>> {
    let ab_tests = &state.ab_tests;
    let report = retry_async_if(|| ab_tests.close_test(id), state.retry_attempts, state.retry_delay, GatewayError::is_retryable).await?;
    Ok(Json(report))
}
