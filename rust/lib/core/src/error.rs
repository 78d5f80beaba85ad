use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Clients match on these,
// never on the human-readable message string.

/// Stable error code constants.
///
/// Clients should match on `code` from `{"code": "NOT_FOUND", "message": "..."}`.
pub mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const UPSTREAM: &str = "UPSTREAM_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
}

/// Field-level context attached to conflicts and validation failures, so a
/// UI can point at the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Input field, e.g. `id`, `groups`, `company`.
    pub field: String,
    /// Domain code, e.g. `already-exist`, `last-member-of-group`.
    pub code: String,
    /// Offending value.
    pub value: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} '{}'", self.field, self.code, self.value)
    }
}

// ── ServiceError ────────────────────────────────────────────────────

/// Unified service error type at the boundary.
///
/// Each variant maps to a stable error code (see [`error_code`]) and an
/// HTTP status code. Field-level variants add a `details` object:
///
/// ```json
/// {"code": "CONFLICT", "message": "id: already-exist 'jdoe'",
///  "details": {"field": "id", "code": "already-exist", "value": "jdoe"}}
/// ```
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Unknown identifier, or an entity the caller may not see. HTTP 404.
    #[error("{0}")]
    NotFound(String),

    /// State conflict on a given field. HTTP 409.
    #[error("{0}")]
    Conflict(FieldError),

    /// Input data is invalid. HTTP 400.
    #[error("{0}")]
    Validation(FieldError),

    /// Authenticated but lacks required permission. HTTP 403.
    #[error("{0}")]
    PermissionDenied(String),

    /// The directory server failed. HTTP 502.
    #[error("{0}")]
    Upstream(String),

    /// Storage backend failure. HTTP 500.
    #[error("{0}")]
    Storage(String),

    /// Unexpected internal error. HTTP 500.
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => error_code::NOT_FOUND,
            ServiceError::Conflict(_) => error_code::CONFLICT,
            ServiceError::Validation(_) => error_code::VALIDATION_FAILED,
            ServiceError::PermissionDenied(_) => error_code::PERMISSION_DENIED,
            ServiceError::Upstream(_) => error_code::UPSTREAM,
            ServiceError::Storage(_) => error_code::STORAGE_ERROR,
            ServiceError::Internal(_) => error_code::INTERNAL,
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Field context, when the error carries one.
    pub fn details(&self) -> Option<&FieldError> {
        match self {
            ServiceError::Conflict(d) | ServiceError::Validation(d) => Some(d),
            _ => None,
        }
    }

    fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.error_code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            body["details"] = serde_json::json!(details);
        }
        body
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.body();
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> FieldError {
        FieldError::new("id", "already-exist", "jdoe")
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(ServiceError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::Conflict(field()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ServiceError::Validation(field()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::PermissionDenied("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ServiceError::Upstream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ServiceError::Storage("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ServiceError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(ServiceError::NotFound("x".into()).error_code(), "NOT_FOUND");
        assert_eq!(ServiceError::Conflict(field()).error_code(), "CONFLICT");
        assert_eq!(ServiceError::Validation(field()).error_code(), "VALIDATION_FAILED");
        assert_eq!(ServiceError::Upstream("x".into()).error_code(), "UPSTREAM_ERROR");
    }

    #[test]
    fn field_details_in_body() {
        let body = ServiceError::Conflict(field()).body();
        assert_eq!(body["code"], "CONFLICT");
        assert_eq!(body["message"], "id: already-exist 'jdoe'");
        assert_eq!(body["details"]["field"], "id");
        assert_eq!(body["details"]["code"], "already-exist");
        assert_eq!(body["details"]["value"], "jdoe");

        let body = ServiceError::NotFound("unknown-id".into()).body();
        assert!(body.get("details").is_none());
    }

    #[test]
    fn json_response_status() {
        let resp = ServiceError::NotFound("unknown-id: user 'x'".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
