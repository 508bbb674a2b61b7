use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_core::error::{self, ApiError};

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// No owner id resolvable from body or headers (401)
    Unauthorized { message: String },
    /// Model id not present in the catalog (400)
    UnknownModel { model: String },
    /// Model is known but no provider is configured for it (400)
    ModelNotConfigured { model: String, provider: String },
    /// Resource does not exist (404)
    NotFound { resource: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: Some("user_id".to_string()),
                    received: None,
                    request_id,
                    docs_hint: Some(
                        "Pass the owner id in the request body as 'user_id' or in the \
                         'x-user-id' header. Body values take precedence."
                            .to_string(),
                    ),
                },
            ),
            AppError::UnknownModel { model } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::UNKNOWN_MODEL.to_string(),
                    message: format!("Unknown model '{}'", model),
                    field: Some("model".to_string()),
                    received: Some(serde_json::Value::String(model)),
                    request_id,
                    docs_hint: Some(
                        "Use one of the catalog model ids, e.g. 'claude-3-5-sonnet', \
                         'gpt-4o-mini', 'qwen3-32b'."
                            .to_string(),
                    ),
                },
            ),
            AppError::ModelNotConfigured { model, provider } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::MODEL_NOT_CONFIGURED.to_string(),
                    message: format!(
                        "Model '{}' requires the '{}' provider, which is not configured",
                        model, provider
                    ),
                    field: Some("model".to_string()),
                    received: Some(serde_json::Value::String(model)),
                    request_id,
                    docs_hint: Some(
                        "Set the provider's API key in the server environment, or select \
                         a model from a configured provider."
                            .to_string(),
                    ),
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{} not found", resource),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                },
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<crate::chat::store::StoreError> for AppError {
    fn from(err: crate::chat::store::StoreError) -> Self {
        use crate::chat::store::StoreError;
        match err {
            StoreError::Database(err) => AppError::Database(err),
            StoreError::Serialize(err) => AppError::Internal(err.to_string()),
        }
    }
}
