//! shoal-api: operator REST API for Shoal.
//!
//! Provides axum route handlers for applying, reading, describing,
//! deleting, and watching workloads, config versions, and routes.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/apply` | Create or update an object (body tagged by `kind`) |
//! | GET | `/api/v1/{kind}` | List objects of a kind |
//! | GET | `/api/v1/{kind}/{ns}/{name}` | Get an object (workloads include status) |
//! | DELETE | `/api/v1/{kind}/{ns}/{name}` | Delete an object |
//! | GET | `/api/v1/{kind}/{ns}/{name}/describe` | Object plus related state |
//! | GET | `/api/v1/{kind}/{ns}/{name}/watch` | Long-poll for a change (`since`, `timeout`) |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/healthz` | Liveness |
//!
//! Errors use HTTP 404 (NotFound), 409 (Conflict), 422 (InvalidSpec),
//! and 500.

pub mod error;
pub mod handlers;
pub mod object;
pub mod operator;

use axum::Router;
use axum::routing::{get, post};

pub use error::{OperatorError, OperatorResult, exit_code_for_status};
pub use handlers::ApiResponse;
pub use object::{
    ApplyOutcome, ApplyResult, ConfigDescription, Object, ObjectKind, RouteDescription, WatchEvent,
    WorkloadDescription, WorkloadView,
};
pub use operator::{Operator, fingerprint};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub operator: Operator,
}

/// Build the complete API router (REST + metrics + health).
pub fn build_router(operator: Operator) -> Router {
    let api_state = ApiState { operator };

    let api_routes = Router::new()
        .route("/apply", post(handlers::apply))
        .route("/{kind}", get(handlers::list))
        .route("/{kind}/{namespace}/{name}", get(handlers::get).delete(handlers::delete))
        .route("/{kind}/{namespace}/{name}/describe", get(handlers::describe))
        .route("/{kind}/{namespace}/{name}/watch", get(handlers::watch))
        .with_state(api_state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(api_state))
        .route("/healthz", get(handlers::healthz))
}
