//! Error handling for the control API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::MigrateError;

/// API error: an HTTP status plus the structured body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error flag.
    pub error: bool,
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Run phase the error came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Run, table, query, file or backup the error is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: true,
                code: code.to_string(),
                message: message.into(),
                phase: None,
                identifier: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.body.identifier = Some(identifier.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.body.phase = Some(phase.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<MigrateError> for ApiError {
    fn from(err: MigrateError) -> Self {
        let message = err.to_string();
        match err {
            MigrateError::Validation(_) | MigrateError::Config(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
            }
            MigrateError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            MigrateError::Conflict(id) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message).with_identifier(id)
            }
            MigrateError::InvalidState(_) => ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", message),
            MigrateError::Operation { unit, .. } => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "OPERATION_FAILED", message).with_identifier(unit)
            }
            MigrateError::Timeout { scope, .. } => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", message).with_identifier(scope)
            }
            MigrateError::Connection(_) | MigrateError::Pool { .. } | MigrateError::Store(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", message)
            }
            MigrateError::History(_) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "HISTORY_ERROR", message),
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (MigrateError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (MigrateError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (MigrateError::Conflict("run".into()), StatusCode::CONFLICT),
            (MigrateError::InvalidState("x".into()), StatusCode::CONFLICT),
            (MigrateError::History("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_conflict_names_active_run() {
        let err = ApiError::from(MigrateError::Conflict("abc".into()));
        let json = serde_json::to_value(&err.body).unwrap();
        assert_eq!(json["code"], "CONFLICT");
        assert_eq!(json["identifier"], "abc");
        assert!(json.get("phase").is_none());
    }
}
