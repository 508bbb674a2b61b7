//! HTTP surface: one module per resource, each exporting a `router()`.

pub mod chats;
pub mod health;
pub mod models;
pub mod turns;

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::AppError;

/// Parse an optional UUID-valued header. Absent is fine; present-but-garbage
/// is a validation error, not a silent fallback.
pub(crate) fn header_uuid(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = value.to_str().map_err(|_| AppError::Validation {
        message: format!("Header '{name}' is not valid UTF-8"),
        field: Some(name.to_string()),
        received: None,
        docs_hint: None,
    })?;
    let id = Uuid::parse_str(text).map_err(|_| AppError::Validation {
        message: format!("Header '{name}' is not a valid UUID"),
        field: Some(name.to_string()),
        received: Some(serde_json::Value::String(text.to_string())),
        docs_hint: None,
    })?;
    Ok(Some(id))
}

/// Resolve the request owner. The body value wins over the `x-user-id`
/// header; a request with neither is unauthorized.
pub(crate) fn require_owner(
    body_user: Option<Uuid>,
    headers: &HeaderMap,
) -> Result<Uuid, AppError> {
    if let Some(id) = body_user {
        return Ok(id);
    }
    header_uuid(headers, "x-user-id")?.ok_or_else(|| AppError::Unauthorized {
        message: "No owner id on the request".to_string(),
    })
}
