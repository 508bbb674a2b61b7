use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response — designed for agents and UI clients alike.
/// Every error carries enough information for the caller to understand
/// what went wrong and how to fix it.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "unauthorized")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const UNKNOWN_MODEL: &str = "unknown_model";
    pub const MODEL_NOT_CONFIGURED: &str = "model_not_configured";
    pub const UNSUPPORTED_TRANSPORT: &str = "unsupported_transport";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
