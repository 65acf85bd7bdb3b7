use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Domain failures raised by the quota ledger, the upload coordinator and
/// the document pipeline.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage quota exceeded: requested {requested} bytes, {remaining} bytes remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },
    #[error("chunk metadata conflicts with upload `{file_identifier}`: {reason}")]
    SessionMismatch {
        file_identifier: String,
        reason: String,
    },
    #[error("upload `{0}` has expired")]
    SessionExpired(String),
    #[error("file `{filename}` is corrupted: {reason}")]
    FileCorrupted { filename: String, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("reservation {0} is not known to the quota ledger")]
    InvalidReservation(String),
    #[error("unsupported file format `{0}`")]
    Unsupported(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("folder {folder_id} still holds {documents} documents and {folders} folders")]
    FolderNotEmpty {
        folder_id: i64,
        documents: i64,
        folders: i64,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Stable code reported to clients and in batch failure lists.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ServiceError::SessionMismatch { .. } => "SESSION_MISMATCH",
            ServiceError::SessionExpired(_) => "SESSION_EXPIRED",
            ServiceError::FileCorrupted { .. } => "FILE_CORRUPTED",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidReservation(_) => "INVALID_RESERVATION",
            ServiceError::Unsupported(_) => "UNSUPPORTED_FORMAT",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::FolderNotEmpty { .. } => "FOLDER_NOT_EMPTY",
            ServiceError::Sqlx(_) | ServiceError::Io(_) => "STORAGE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            ServiceError::SessionMismatch { .. }
            | ServiceError::Conflict(_)
            | ServiceError::FolderNotEmpty { .. } => StatusCode::CONFLICT,
            ServiceError::SessionExpired(_) => StatusCode::GONE,
            ServiceError::FileCorrupted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Unsupported(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::InvalidReservation(_)
            | ServiceError::Sqlx(_)
            | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A lightweight wrapper for errors leaving the HTTP layer.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg)
    }

    /// Shortcut for 401 when the caller identity header is missing.
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        if err.status().is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError::new(err.status(), err.code(), err.to_string())
    }
}

impl From<axum::extract::multipart::MultipartError> for AppError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        AppError::bad_request(format!("malformed multipart body: {}", err))
    }
}
