//! REST API handlers.
//!
//! Each handler delegates to the `Operator` and wraps the result in the
//! `ApiResponse` envelope.

use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::ApiState;
use crate::error::OperatorError;
use crate::object::{ApplyOutcome, Object, ObjectKind};

/// Response wrapper for consistent API format.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

impl IntoResponse for OperatorError {
    fn into_response(self) -> Response {
        error_response(&self.to_string(), self.status_code()).into_response()
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// ── Objects ────────────────────────────────────────────────────

/// POST /api/v1/apply
pub async fn apply(
    State(state): State<ApiState>,
    body: Result<Json<Object>, JsonRejection>,
) -> Response {
    let Json(object) = match body {
        Ok(b) => b,
        Err(e) => return OperatorError::InvalidSpec(e.body_text()).into_response(),
    };
    match state.operator.apply(object) {
        Ok(result) => {
            let status = if result.outcome == ApplyOutcome::Created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, ApiResponse::ok(result)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// GET /api/v1/{kind}
pub async fn list(State(state): State<ApiState>, Path(kind): Path<String>) -> Response {
    let result = kind
        .parse::<ObjectKind>()
        .and_then(|kind| state.operator.list(kind));
    match result {
        Ok(items) => ApiResponse::ok(items).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/v1/{kind}/{namespace}/{name}
pub async fn get(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let result = kind
        .parse::<ObjectKind>()
        .and_then(|kind| state.operator.get(kind, &key(&namespace, &name)));
    match result {
        Ok(object) => ApiResponse::ok(object).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/v1/{kind}/{namespace}/{name}/describe
pub async fn describe(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let result = kind
        .parse::<ObjectKind>()
        .and_then(|kind| state.operator.describe(kind, &key(&namespace, &name)));
    match result {
        Ok(object) => ApiResponse::ok(object).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/v1/{kind}/{namespace}/{name}
pub async fn delete(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let result = kind
        .parse::<ObjectKind>()
        .and_then(|kind| state.operator.delete(kind, &key(&namespace, &name)));
    match result {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct WatchParams {
    pub since: Option<String>,
    /// Seconds; defaults to 30.
    pub timeout: Option<u64>,
}

/// GET /api/v1/{kind}/{namespace}/{name}/watch?since=&timeout=
pub async fn watch(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Query(params): Query<WatchParams>,
) -> Response {
    let kind = match kind.parse::<ObjectKind>() {
        Ok(k) => k,
        Err(e) => return e.into_response(),
    };
    let timeout = Duration::from_secs(params.timeout.unwrap_or(30));
    match state
        .operator
        .watch(kind, &key(&namespace, &name), params.since.as_deref(), timeout)
        .await
    {
        Ok(event) => ApiResponse::ok(event).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let statuses = state.operator.statuses().unwrap_or_default();
    let body = shoal_metrics::render_prometheus(&statuses);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Operator;
    use shoal_controller::WorkQueue;
    use shoal_proxy::{BalanceStrategy, EndpointRegistry, Ingress, ServiceRouter};
    use shoal_state::{HealthConfig, InstanceTemplate, StateStore, WorkloadSpec};
    use std::sync::Arc;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let router = Arc::new(ServiceRouter::new(EndpointRegistry::new(), BalanceStrategy::RoundRobin));
        let operator = Operator::new(store, Arc::new(WorkQueue::new()), Arc::new(Ingress::new(router)));
        ApiState { operator }
    }

    fn test_workload(min: u32, max: u32) -> WorkloadSpec {
        WorkloadSpec {
            namespace: "default".into(),
            name: "api".into(),
            min_replicas: min,
            max_replicas: max,
            template: InstanceTemplate {
                command: "api-server".into(),
                args: vec![],
                port: 8080,
                resources: Default::default(),
                env: Default::default(),
                config: None,
            },
            instance_template_hash: String::new(),
            rollout: Default::default(),
            scaling: Default::default(),
            health: HealthConfig::default(),
            generation: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn path(kind: &str) -> Path<(String, String, String)> {
        Path((kind.to_string(), "default".to_string(), "api".to_string()))
    }

    #[tokio::test]
    async fn list_workloads_empty() {
        let resp = list(State(test_state()), Path("workload".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn apply_and_get_workload() {
        let state = test_state();
        let resp = apply(State(state.clone()), Ok(Json(Object::Workload(test_workload(1, 3))))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = apply(State(state.clone()), Ok(Json(Object::Workload(test_workload(1, 3))))).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get(State(state), path("workload")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn apply_invalid_is_unprocessable() {
        let resp = apply(State(test_state()), Ok(Json(Object::Workload(test_workload(4, 2))))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn get_nonexistent_workload() {
        let resp = get(State(test_state()), path("workload")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_kind_is_not_found() {
        let resp = get(State(test_state()), path("pods")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_nonexistent_route() {
        let resp = delete(State(test_state()), path("route")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        apply(State(state.clone()), Ok(Json(Object::Workload(test_workload(2, 3))))).await;
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
