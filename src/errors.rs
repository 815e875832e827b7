use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),
    /// Request body failed its schema; one entry per violation.
    #[error("VALIDATION_FAILED: {}", .0.join("; "))]
    InvalidFields(Vec<String>),
    #[error("UNAUTHENTICATED: {0}")]
    Unauthenticated(String),
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status the error handler answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidFields(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthenticated(_) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message without the variant prefix, as shown to API clients.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidFields(_) => "Validation error",
            Self::Validation(message)
            | Self::Unauthenticated(message)
            | Self::Forbidden(message)
            | Self::NotFound(message)
            | Self::Io(message)
            | Self::Internal(message) => message,
        }
    }

    pub fn details(&self) -> Option<&[String]> {
        match self {
            Self::InvalidFields(details) => Some(details),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Validation(format!("invalid configuration file: {}", value))
    }
}

pub type AppResult<T> = Result<T, AppError>;
