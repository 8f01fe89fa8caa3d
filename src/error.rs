use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode, Json};
use serde_json::json;
use thiserror::Error;

/// Errors returned by the reference backend's HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict("row violates a table constraint")
            }
            other => AppError::Database(other.to_string()),
        }
    }
}

/// Input refused before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("list name cannot be empty")]
    EmptyName,
    #[error("task content cannot be empty")]
    EmptyContent,
}

/// Failure of a key-value byte store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Failure of a persistence call. The optimistic local change is never rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("network error: {0}")]
    Network(String),
    #[error("not authorized")]
    Unauthorized,
    #[error("rejected by remote store: {0}")]
    Validation(String),
    #[error("remote store error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("local storage error: {0}")]
    Storage(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PersistError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PersistError::Decode(err.to_string())
        } else {
            PersistError::Network(err.to_string())
        }
    }
}

impl From<StorageError> for PersistError {
    fn from(err: StorageError) -> Self {
        PersistError::Storage(err.to_string())
    }
}

/// Failure of an authentication call; surfaced inline, the session stays signed out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("{0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("session is no longer valid")]
    Unauthorized,
    #[error("remote sync is not configured")]
    NotConfigured,
    #[error("session storage error: {0}")]
    Storage(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}
