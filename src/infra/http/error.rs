use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::repos::RepoError;
use crate::cache::CacheError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const DUPLICATE: &str = "duplicate";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const INVALID_PATTERN: &str = "invalid_pattern";
    pub const DB_TIMEOUT: &str = "db_timeout";
    pub const REPO: &str = "repo_error";
    pub const UNAVAILABLE: &str = "unavailable";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    source: &'static str,
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            source,
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(source: &'static str, message: &'static str, hint: Option<String>) -> Self {
        Self::new(
            source,
            StatusCode::BAD_REQUEST,
            codes::BAD_REQUEST,
            message,
            hint,
        )
    }

    pub fn not_found(source: &'static str, message: &'static str) -> Self {
        Self::new(source, StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    pub fn unavailable(source: &'static str, hint: impl Into<String>) -> Self {
        Self::new(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            codes::UNAVAILABLE,
            "Dependency unavailable",
            Some(hint.into()),
        )
    }

    /// Map a config store failure onto a consistent response.
    pub fn from_repo(source: &'static str, err: RepoError) -> Self {
        match err {
            RepoError::Duplicate { constraint } => Self::new(
                source,
                StatusCode::CONFLICT,
                codes::DUPLICATE,
                "Duplicate record",
                Some(constraint),
            ),
            RepoError::NotFound => Self::not_found(source, "Resource not found"),
            RepoError::InvalidInput { message } => Self::new(
                source,
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                Some(message),
            ),
            RepoError::Timeout => Self::new(
                source,
                StatusCode::SERVICE_UNAVAILABLE,
                codes::DB_TIMEOUT,
                "Database timeout",
                None,
            ),
            RepoError::Persistence(message) => Self::new(
                source,
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REPO,
                "Persistence error",
                Some(message),
            ),
        }
    }

    pub fn from_cache(source: &'static str, err: CacheError) -> Self {
        match err {
            CacheError::InvalidPattern { .. } => Self::new(
                source,
                StatusCode::BAD_REQUEST,
                codes::INVALID_PATTERN,
                "Invalid invalidation pattern",
                Some(err.to_string()),
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = format!(
            "{}: {}",
            self.code,
            self.hint.as_deref().unwrap_or(self.message)
        );
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(self.source, self.status, detail).attach(&mut response);
        response
    }
}
