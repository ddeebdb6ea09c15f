//! Routing error types.

use thiserror::Error;

/// Errors surfaced to the caller of the router.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The workload has no healthy endpoints right now.
    #[error("service unavailable: no healthy endpoints for {0}")]
    ServiceUnavailable(String),

    /// No ingress rule matches the host and path.
    #[error("no route for host {host:?} path {path:?}")]
    NotFound { host: String, path: String },
}

impl RouteError {
    /// HTTP status the proxy answers with.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            RouteError::ServiceUnavailable(_) => http::StatusCode::SERVICE_UNAVAILABLE,
            RouteError::NotFound { .. } => http::StatusCode::NOT_FOUND,
        }
    }
}

pub type RouteResult<T> = Result<T, RouteError>;
