//! Error types for the artifact cache server

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use blob_store::BlobStoreError;
use serde_json::json;

/// Startup and process-level errors
#[derive(Debug)]
pub enum CacheServerError {
    Io(Box<std::io::Error>),
    Database(sqlx::Error),
    Remote(nexus_client::NexusError),
    Config(String),
}

impl fmt::Display for CacheServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheServerError::Io(err) => write!(f, "IO error: {}", err),
            CacheServerError::Database(err) => write!(f, "Database error: {}", err),
            CacheServerError::Remote(err) => write!(f, "Remote tier error: {}", err),
            CacheServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheServerError::Io(err) => Some(err.as_ref()),
            CacheServerError::Database(err) => Some(err),
            CacheServerError::Remote(err) => Some(err),
            CacheServerError::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for CacheServerError {
    fn from(err: std::io::Error) -> Self {
        CacheServerError::Io(Box::new(err))
    }
}

impl From<sqlx::Error> for CacheServerError {
    fn from(err: sqlx::Error) -> Self {
        CacheServerError::Database(err)
    }
}

impl From<BlobStoreError> for CacheServerError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::Io(err) => CacheServerError::Io(err),
            other => CacheServerError::Config(other.to_string()),
        }
    }
}

impl From<nexus_client::NexusError> for CacheServerError {
    fn from(err: nexus_client::NexusError) -> Self {
        CacheServerError::Remote(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for CacheServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        CacheServerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheServerError>;

/// Request error that converts to an HTTP response with an `{"error": ...}` body
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotReserved(i64),
    AlreadyComplete { id: i64, key: String },
    Internal(String),
    Database(sqlx::Error),
    Storage(BlobStoreError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "{}", msg),
            AppError::NotReserved(id) => write!(f, "cache {}: not reserved", id),
            AppError::AlreadyComplete { id, key } => {
                write!(f, "cache {} {:?}: already complete", id, key)
            }
            AppError::Internal(msg) => write!(f, "{}", msg),
            AppError::Database(err) => write!(f, "database: {}", err),
            AppError::Storage(err) => write!(f, "storage: {}", err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) | AppError::NotReserved(_) | AppError::AlreadyComplete { .. } => {
                tracing::debug!(error = %self, "Rejected request");
                StatusCode::BAD_REQUEST
            }
            AppError::Internal(_) | AppError::Database(_) | AppError::Storage(_) => {
                tracing::error!(error = %self, "Internal server error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e)
    }
}

impl From<BlobStoreError> for AppError {
    fn from(e: BlobStoreError) -> Self {
        AppError::Storage(e)
    }
}
