//! Operator-facing error kinds and their HTTP / exit code mapping.

use axum::http::StatusCode;
use thiserror::Error;

use shoal_config::ConfigError;
use shoal_state::StateError;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's generation is stale; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OperatorError::NotFound(_) => StatusCode::NOT_FOUND,
            OperatorError::Conflict(_) => StatusCode::CONFLICT,
            OperatorError::InvalidSpec(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OperatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn exit_code(&self) -> i32 {
        exit_code_for_status(self.status_code())
    }
}

/// Process exit code `shoalctl` uses for an API response status.
pub fn exit_code_for_status(status: StatusCode) -> i32 {
    match status {
        s if s.is_success() => 0,
        StatusCode::NOT_FOUND => 3,
        StatusCode::CONFLICT => 4,
        StatusCode::UNPROCESSABLE_ENTITY => 5,
        _ => 1,
    }
}

impl From<StateError> for OperatorError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(key) => OperatorError::NotFound(key),
            StateError::Conflict { .. } => OperatorError::Conflict(e.to_string()),
            StateError::InvalidSpec(msg) => OperatorError::InvalidSpec(msg),
            other => OperatorError::Internal(other.to_string()),
        }
    }
}

impl From<ConfigError> for OperatorError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::State(inner) => inner.into(),
            ConfigError::RetriesExhausted { .. } => OperatorError::Conflict(e.to_string()),
        }
    }
}

pub type OperatorResult<T> = Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_map_to_operator_kinds() {
        let conflict: OperatorError = StateError::Conflict {
            key: "default/web".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(conflict.exit_code(), 4);

        let invalid: OperatorError = StateError::InvalidSpec("min > max".into()).into();
        assert_eq!(invalid.exit_code(), 5);

        let missing: OperatorError = StateError::NotFound("default/web".into()).into();
        assert_eq!(missing.exit_code(), 3);

        let io: OperatorError = StateError::Write("disk full".into()).into();
        assert_eq!(io.exit_code(), 1);
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_code_for_status(StatusCode::OK), 0);
        assert_eq!(exit_code_for_status(StatusCode::CREATED), 0);
        assert_eq!(exit_code_for_status(StatusCode::BAD_GATEWAY), 1);
    }
}
