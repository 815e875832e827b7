use crate::errors::AppError;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub const API_VERSION: &str = "v4";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub version: &'static str,
    pub result: EnvelopeResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeResult {
    pub success: bool,
    pub status: u16,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub total_count: usize,
}

/// Correlation id of a request: the caller's `x-request-id`, else a new one.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn wrap_response(request_id: &str, content: Value, total_count: Option<usize>, status: StatusCode) -> Envelope {
    Envelope {
        id: request_id.to_string(),
        version: API_VERSION,
        result: EnvelopeResult {
            success: status.is_success(),
            status: status.as_u16(),
            content,
            metadata: total_count.map(|total_count| EnvelopeMetadata { total_count }),
        },
    }
}

/// Success response with the envelope as body.
pub struct Wrapped {
    pub request_id: String,
    pub status: StatusCode,
    pub content: Value,
    pub total_count: Option<usize>,
}

impl Wrapped {
    pub fn new(request_id: String, status: StatusCode, content: impl Serialize) -> Result<Self, ApiError> {
        let content = serde_json::to_value(content).map_err(|error| ApiError::new(request_id.clone(), error.into()))?;
        Ok(Self {
            request_id,
            status,
            content,
            total_count: Some(1),
        })
    }

    pub fn list<T: Serialize>(request_id: String, items: &[T]) -> Result<Self, ApiError> {
        let mut wrapped = Self::new(request_id, StatusCode::OK, items)?;
        wrapped.total_count = Some(items.len());
        Ok(wrapped)
    }
}

impl IntoResponse for Wrapped {
    fn into_response(self) -> Response {
        let envelope = wrap_response(&self.request_id, self.content, self.total_count, self.status);
        (self.status, Json(envelope)).into_response()
    }
}

/// Error carried to the centralized responder together with the request id.
#[derive(Debug)]
pub struct ApiError {
    pub request_id: String,
    pub error: AppError,
}

impl ApiError {
    pub fn new(request_id: String, error: AppError) -> Self {
        Self { request_id, error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let message = if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, error = %self.error, "request failed");
            "Internal server error".to_string()
        } else {
            tracing::debug!(request_id = %self.request_id, error = %self.error, "request rejected");
            self.error.message().to_string()
        };

        let mut content = json!({ "message": message });
        if let Some(details) = self.error.details() {
            content["details"] = json!(details);
        }
        let envelope = wrap_response(&self.request_id, content, None, status);
        (status, Json(envelope)).into_response()
    }
}
