//! JSON transport for the formation and compliance operations.
//!
//! Every response is wrapped as `{ "success": true, "data": ... }` or
//! `{ "success": false, "error": { kind, message, correlation_id, retryable } }`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use charter_core::{
    ApplicationError, CalendarId, CalendarRequest, CalendarService, ComplianceMonitor, EntityInfo,
    InterfaceError, StepId, WorkflowId, WorkflowOrchestrator,
};

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub calendars: Arc<CalendarService>,
    pub monitor: Arc<ComplianceMonitor>,
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    correlation_id: String,
    retryable: bool,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

/// An application failure tagged with the request's correlation id.
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        let kind = error.kind().as_str();
        let retryable = error.is_retryable();
        let interface = error.into_interface(correlation_id);
        let status = match &interface {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &interface {
            // Internal details stay in the logs.
            InterfaceError::Internal { .. } => interface.user_message().to_string(),
            InterfaceError::BadRequest { message, .. }
            | InterfaceError::NotFound { message, .. }
            | InterfaceError::Conflict { message, .. }
            | InterfaceError::ServiceUnavailable { message, .. } => message.clone(),
        };

        if status.is_server_error() {
            warn!(
                event_name = "api.request.failed",
                correlation_id,
                kind,
                error = %interface,
                "request failed"
            );
        }

        Self {
            status,
            body: ErrorBody {
                kind,
                message,
                correlation_id: interface.correlation_id().to_string(),
                retryable,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorEnvelope { success: false, error: self.body })).into_response()
    }
}

type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(Envelope { success: true, data })))
}

fn created<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::CREATED, Json(Envelope { success: true, data })))
}

/// Honors a caller-supplied `x-correlation-id`, otherwise mints one.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", post(create_workflow))
        .route("/v1/workflows/{id}", get(get_workflow))
        .route("/v1/workflows/{id}/next", get(next_steps))
        .route("/v1/workflows/{id}/progress", get(workflow_progress))
        .route("/v1/workflows/{id}/steps/{step_id}/execute", post(execute_step))
        .route("/v1/calendars", post(generate_calendar))
        .route("/v1/calendars/{id}", get(get_calendar))
        .route("/v1/calendars/{id}/extend", post(extend_calendar))
        .route("/v1/calendars/{id}/monitor", post(monitor_calendar))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(entity): Json<EntityInfo>,
) -> ApiResult<charter_core::WorkflowInstance> {
    let cid = correlation_id(&headers);
    let instance = state
        .orchestrator
        .create_workflow(entity, &cid)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    created(instance)
}

async fn get_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<charter_core::WorkflowInstance> {
    let cid = correlation_id(&headers);
    let instance = state
        .orchestrator
        .workflow_status(&WorkflowId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    ok(instance)
}

#[derive(Debug, Serialize)]
struct NextSteps {
    actionable: Vec<StepId>,
    retryable: Vec<StepId>,
}

async fn next_steps(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<NextSteps> {
    let cid = correlation_id(&headers);
    let workflow_id = WorkflowId(id);
    let actionable = state
        .orchestrator
        .next_actionable_steps(&workflow_id)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    let retryable = state
        .orchestrator
        .retryable_steps(&workflow_id)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    ok(NextSteps { actionable, retryable })
}

async fn workflow_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<charter_core::ProgressSnapshot> {
    let cid = correlation_id(&headers);
    let snapshot = state
        .orchestrator
        .progress(&WorkflowId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    ok(snapshot)
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    input: serde_json::Value,
}

async fn execute_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, step_id)): Path<(String, String)>,
    body: Option<Json<ExecuteBody>>,
) -> ApiResult<charter_core::StepResult> {
    let cid = correlation_id(&headers);
    let input = body.map(|Json(body)| body.input).unwrap_or_default();
    let result = state
        .orchestrator
        .execute_step(&WorkflowId(id), &StepId(step_id), input, &cid)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    info!(
        event_name = "api.step.executed",
        correlation_id = %cid,
        workflow_id = %result.workflow_id,
        step_id = %result.step_id,
        status = result.status.as_str(),
        "step executed over http"
    );
    ok(result)
}

// ---------------------------------------------------------------------------
// Calendars
// ---------------------------------------------------------------------------

async fn generate_calendar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CalendarRequest>,
) -> ApiResult<charter_core::ComplianceCalendar> {
    let cid = correlation_id(&headers);
    let calendar = state
        .calendars
        .generate_calendar(request, Utc::now(), &cid)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    created(calendar)
}

async fn get_calendar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<charter_core::ComplianceCalendar> {
    let cid = correlation_id(&headers);
    let calendar = state
        .calendars
        .get_calendar(&CalendarId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    ok(calendar)
}

#[derive(Debug, Deserialize)]
struct ExtendBody {
    #[serde(default = "default_extend_years")]
    years: u32,
}

fn default_extend_years() -> u32 {
    1
}

async fn extend_calendar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ExtendBody>>,
) -> ApiResult<charter_core::ComplianceCalendar> {
    let cid = correlation_id(&headers);
    let years = body.map(|Json(body)| body.years).unwrap_or_else(default_extend_years);
    let calendar = state
        .calendars
        .extend_calendar(&CalendarId(id), years, Utc::now(), &cid)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    ok(calendar)
}

#[derive(Debug, Default, Deserialize)]
struct MonitorQuery {
    as_of: Option<NaiveDate>,
}

/// `as_of` dates are evaluated at noon UTC.
fn evaluation_time(as_of: Option<NaiveDate>) -> DateTime<Utc> {
    as_of
        .and_then(|date| date.and_hms_opt(12, 0, 0))
        .map(|moment| moment.and_utc())
        .unwrap_or_else(Utc::now)
}

async fn monitor_calendar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MonitorQuery>,
) -> ApiResult<charter_core::ComplianceReport> {
    let cid = correlation_id(&headers);
    let report = state
        .monitor
        .monitor(&CalendarId(id), evaluation_time(query.as_of), &cid)
        .await
        .map_err(|error| ApiError::from_application(error, &cid))?;
    ok(report)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use charter_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use charter_db::{connect_with_settings, migrations};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;
    use crate::bootstrap::build_state;

    async fn test_app(dir: &tempfile::TempDir) -> Router {
        let url = format!("sqlite://{}", dir.path().join("api.db").display());
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(url.clone()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config");
        let pool = connect_with_settings(&url, 2, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        router(build_state(&config, pool).expect("state"))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-correlation-id", "req-test");
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response =
            app.clone().oneshot(request.body(body).expect("request")).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn workflow_routes_drive_a_formation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(&dir).await;

        let (status, created) = send(
            &app,
            "POST",
            "/v1/workflows",
            Some(json!({ "entity_name": "Harbor Lane LLC", "jurisdiction": "DE" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        assert_eq!(created["success"], true);
        let id = created["data"]["id"].as_str().expect("workflow id").to_string();

        let (status, blocked) =
            send(&app, "POST", &format!("/v1/workflows/{id}/steps/formation_filing/execute"), None)
                .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(blocked["success"], false);
        assert_eq!(blocked["error"]["kind"], "dependency_not_satisfied");
        assert_eq!(blocked["error"]["correlation_id"], "req-test");
        assert_eq!(blocked["error"]["retryable"], false);

        let (status, executed) =
            send(&app, "POST", &format!("/v1/workflows/{id}/steps/name_check/execute"), None)
                .await;
        assert_eq!(status, StatusCode::OK, "{executed}");
        assert_eq!(executed["data"]["status"], "completed");

        let (status, progress) =
            send(&app, "GET", &format!("/v1/workflows/{id}/progress"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(progress["data"]["progress"].as_u64().expect("progress") > 0);

        let (_, next) = send(&app, "GET", &format!("/v1/workflows/{id}/next"), None).await;
        assert_eq!(next["data"]["actionable"][0], "registered_agent");
    }

    #[tokio::test]
    async fn unknown_jurisdiction_is_a_bad_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(&dir).await;

        let (status, body) = send(
            &app,
            "POST",
            "/v1/workflows",
            Some(json!({ "entity_name": "Nowhere LLC", "jurisdiction": "ZZ" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "validation_error");
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(&dir).await;

        let (status, body) = send(&app, "GET", "/v1/workflows/wf_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");

        let (status, _) = send(&app, "POST", "/v1/calendars/cal_missing/monitor", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn calendar_routes_generate_and_monitor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(&dir).await;

        let (status, created) = send(
            &app,
            "POST",
            "/v1/calendars",
            Some(json!({
                "entity_ref": "ent-api-wy",
                "entity_name": "Prairie Goods LLC",
                "jurisdiction": "WY",
                "formation_date": "2024-03-10",
                "horizon_years": 2
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        let id = created["data"]["id"].as_str().expect("calendar id").to_string();

        let (status, fetched) = send(&app, "GET", &format!("/v1/calendars/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["data"]["covers_through_year"], 2025);

        let (status, report) =
            send(&app, "POST", &format!("/v1/calendars/{id}/monitor?as_of=2025-02-19"), None).await;
        assert_eq!(status, StatusCode::OK, "{report}");
        assert_eq!(report["data"]["status"], "action_required");
        assert_eq!(report["data"]["upcoming"].as_array().expect("upcoming").len(), 2);
        let covered = report["data"]["extended_through_year"].as_i64().unwrap_or(2025);

        let (status, extended) =
            send(&app, "POST", &format!("/v1/calendars/{id}/extend"), Some(json!({ "years": 1 })))
                .await;
        assert_eq!(status, StatusCode::OK, "{extended}");
        assert_eq!(extended["data"]["covers_through_year"], covered + 1);
    }

    #[tokio::test]
    async fn oversized_horizons_are_bad_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(&dir).await;

        let (status, body) = send(
            &app,
            "POST",
            "/v1/calendars",
            Some(json!({
                "entity_ref": "ent-api-far",
                "jurisdiction": "WY",
                "formation_date": "2024-03-10",
                "horizon_years": 20000
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(body["error"]["kind"], "validation_error");

        let (status, created) = send(
            &app,
            "POST",
            "/v1/calendars",
            Some(json!({
                "entity_ref": "ent-api-far",
                "jurisdiction": "WY",
                "formation_date": "2024-03-10",
                "horizon_years": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        let id = created["data"]["id"].as_str().expect("calendar id").to_string();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/calendars/{id}/extend"),
            Some(json!({ "years": u32::MAX })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    }
}
