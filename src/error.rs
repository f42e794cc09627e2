//! Error types for the measurement upload server.
//!
//! This module defines a unified error handling system using `thiserror`.
//! All errors are converted to appropriate HTTP responses automatically.
//!
//! # Error Categories
//!
//! - **Client errors (4xx)**: Invalid metadata, unknown sessions, duplicates
//! - **Server errors (5xx)**: Backend failures, I/O errors, inconsistencies
//!
//! # Example
//!
//! ```rust,ignore
//! use crate::error::{AppError, Result};
//!
//! fn check_device_id(id: &str) -> Result<()> {
//!     if id.len() != 36 {
//!         return Err(AppError::invalid_metadata("deviceId"));
//!     }
//!     Ok(())
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
///
/// This enum represents all possible errors that can occur in the application.
/// Each variant is mapped to an appropriate HTTP status code.
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // Client Errors (4xx)
    // -------------------------------------------------------------------------
    /// Missing or invalid metadata envelope field
    #[error("Invalid metadata: {0}")]
    InvalidMetaData(String),

    /// Content-Range header does not match the protocol grammar
    #[error("Invalid Content-Range: {0}")]
    InvalidContentRange(String),

    /// Chunk payload exceeds the configured ceiling
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// No upload session is bound to the requested identifier
    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    /// The referenced measurement does not exist
    #[error("Measurement not found: {0}")]
    MeasurementNotFound(String),

    /// The (device, measurement, file type) slot is already taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Authentication required
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // -------------------------------------------------------------------------
    // Server Errors (5xx)
    // -------------------------------------------------------------------------
    /// The temp file length disagrees with the acknowledged range after a write
    #[error("Content range not matching file size: {0}")]
    ContentRangeNotMatchingFileSize(String),

    /// More than one stored object matches a dedup query; operators must reconcile
    #[error("Duplicate records in database: {0}")]
    DuplicatesInDatabase(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local metadata index error
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// MongoDB error
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Cloud blob API error
    #[error("Cloud upload error: {0}")]
    CloudUpload(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    // -------------------------------------------------------------------------
    // Convenience constructors
    // -------------------------------------------------------------------------

    /// Create an invalid metadata error
    pub fn invalid_metadata<S: Into<String>>(msg: S) -> Self {
        Self::InvalidMetaData(msg.into())
    }

    /// Create an invalid content range error
    pub fn invalid_content_range<S: Into<String>>(msg: S) -> Self {
        Self::InvalidContentRange(msg.into())
    }

    /// Create a payload too large error
    pub fn payload_too_large<S: Into<String>>(msg: S) -> Self {
        Self::PayloadTooLarge(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found<S: Into<String>>(msg: S) -> Self {
        Self::SessionNotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a cloud upload error
    pub fn cloud_upload<S: Into<String>>(msg: S) -> Self {
        Self::CloudUpload(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 4xx Client Errors
            Self::InvalidMetaData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidContentRange(_) => StatusCode::UNPROCESSABLE_ENTITY,
            // An oversized chunk is a protocol violation, not a transport
            // hiccup, hence 422 rather than 413
            Self::PayloadTooLarge(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::MeasurementNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,

            // 5xx Server Errors
            Self::ContentRangeNotMatchingFileSize(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DuplicatesInDatabase(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Mongo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CloudUpload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// Error response body sent to clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Add status code to the response
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status.as_u16());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log server errors
        if self.is_server_error() {
            tracing::error!(error = %self, "Server error occurred");
        } else {
            tracing::debug!(error = %self, "Client error occurred");
        }

        let error_type = match &self {
            Self::InvalidMetaData(_) => "invalid_metadata",
            Self::InvalidContentRange(_) => "invalid_content_range",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::SessionNotFound(_) => "session_not_found",
            Self::MeasurementNotFound(_) => "measurement_not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ContentRangeNotMatchingFileSize(_) => "content_range_mismatch",
            Self::DuplicatesInDatabase(_) => "duplicates_in_database",
            Self::Internal(_) => "internal_error",
            Self::Io(_) => "io_error",
            Self::Database(_) => "database_error",
            Self::Mongo(_) => "database_error",
            Self::CloudUpload(_) => "cloud_upload_error",
            Self::Config(_) => "config_error",
        };

        // For server errors, don't expose internal details to clients. The
        // duplicates case keeps its specific body so operators can spot it.
        let message = match &self {
            Self::DuplicatesInDatabase(msg) => {
                format!("More than one stored object matches: {}", msg)
            }
            _ if self.is_server_error() => {
                "An internal error occurred. Please try again later.".to_string()
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse::new(error_type, message).with_status(status);

        (status, Json(body)).into_response()
    }
}

// -------------------------------------------------------------------------
// Error conversions from external crates
// -------------------------------------------------------------------------

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidMetaData(format!("Invalid UUID: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::CloudUpload(err.to_string())
    }
}
