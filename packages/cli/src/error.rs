use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use stagehand_engine::{trim_daemon_noise, EngineError};
use stagehand_runtime::{ExecutorError, RegistryError};

/// Error type all handlers return. Everything maps onto the wire contract:
/// non-2xx responses carry `{"error_msg": "..."}`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error_msg: String,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Backend(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error_msg: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyExists(_) => AppError::AlreadyExists(err.to_string()),
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
        }
    }
}

impl From<ExecutorError> for AppError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::NotFound(_) => AppError::NotFound(err.to_string()),
            ExecutorError::MissingId | ExecutorError::InvalidConfig(_) => {
                AppError::BadRequest(err.to_string())
            }
            ExecutorError::AlreadyExists(_) => AppError::AlreadyExists(err.to_string()),
            ExecutorError::Abandoned => AppError::Backend(err.to_string()),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Backend(trim_daemon_noise(&err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_conflicts_map_to_bad_request() {
        let err: AppError = RegistryError::AlreadyExists("S1".to_string()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("already exist"));
    }

    #[test]
    fn unknown_ids_map_to_not_found() {
        let err: AppError = ExecutorError::NotFound("st1".to_string()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn daemon_noise_is_trimmed_from_backend_errors() {
        let err: AppError = EngineError::Pull(
            "Error response from daemon: pull access denied".to_string(),
        )
        .into();
        assert!(!err.to_string().contains("Error response from daemon"));
        assert!(err.to_string().contains("pull access denied"));
    }
}
