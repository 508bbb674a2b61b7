//! The model capability: given a transcript and a tool catalog, produce an
//! event stream. The orchestration loop only ever sees this interface;
//! provider-specific request shaping lives behind it.

pub mod openai_compat;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use parley_mcp::ToolDescriptor;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::AppError;
use parley_core::chat::ConversationMessage;

/// One invocation of the model: the running transcript plus the full merged
/// tool catalog.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Provider-side model name (the catalog's `api_version`).
    pub model: String,
    pub system: String,
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolDescriptor>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// What a model step emits while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A raw token fragment. May contain reasoning markers; extraction
    /// happens downstream in the driver.
    TextDelta(String),
    ToolCall(ToolCallRequest),
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("malformed provider output: {0}")]
    Malformed(String),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

/// Provider-agnostic completion capability.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_step(&self, request: StepRequest) -> Result<ModelStream, ModelError>;
}

impl std::fmt::Debug for dyn ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ModelProvider")
    }
}

/// Catalog entry for a selectable model.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelInfo {
    /// Id clients select with (body `model` / `x-selected-model` header).
    pub id: &'static str,
    /// Provider label the id routes to.
    pub provider: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Provider-side model name sent on the wire.
    #[serde(skip)]
    pub api_version: &'static str,
}

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet";

/// The selectable model catalog. Ids are stable client-facing names;
/// `api_version` tracks the provider's current snapshot.
pub fn model_catalog() -> &'static [ModelInfo] {
    &[
        ModelInfo {
            id: "gpt-4",
            provider: "openai",
            name: "GPT-4",
            description: "Most capable GPT-4 model for complex tasks requiring advanced reasoning.",
            api_version: "gpt-4",
        },
        ModelInfo {
            id: "gpt-4-turbo",
            provider: "openai",
            name: "GPT-4 Turbo",
            description: "Faster and more efficient version of GPT-4 with extended context.",
            api_version: "gpt-4-turbo",
        },
        ModelInfo {
            id: "gpt-4o",
            provider: "openai",
            name: "GPT-4o",
            description: "Latest GPT-4 Omni model with multimodal capabilities.",
            api_version: "gpt-4o",
        },
        ModelInfo {
            id: "gpt-4o-mini",
            provider: "openai",
            name: "GPT-4o Mini",
            description: "Smaller, faster version of GPT-4o with good performance.",
            api_version: "gpt-4o-mini",
        },
        ModelInfo {
            id: "claude-3-5-sonnet",
            provider: "anthropic",
            name: "Claude 3.5 Sonnet",
            description: "Most intelligent Claude model with excellent reasoning and coding capabilities.",
            api_version: "claude-3-5-sonnet-20241022",
        },
        ModelInfo {
            id: "claude-3-5-haiku",
            provider: "anthropic",
            name: "Claude 3.5 Haiku",
            description: "Fast and efficient Claude model for quick tasks.",
            api_version: "claude-3-5-haiku-20241022",
        },
        ModelInfo {
            id: "claude-3-opus",
            provider: "anthropic",
            name: "Claude 3 Opus",
            description: "Most powerful Claude 3 model for complex reasoning tasks.",
            api_version: "claude-3-opus-20240229",
        },
        ModelInfo {
            id: "gemini-1.5-pro",
            provider: "google",
            name: "Gemini 1.5 Pro",
            description: "Google's most capable model with large context window.",
            api_version: "gemini-1.5-pro",
        },
        ModelInfo {
            id: "gemini-1.5-flash",
            provider: "google",
            name: "Gemini 1.5 Flash",
            description: "Fast and efficient Gemini model for quick responses.",
            api_version: "gemini-1.5-flash",
        },
        ModelInfo {
            id: "qwen3-32b",
            provider: "groq",
            name: "Qwen 3 32B",
            description: "Alibaba's Qwen 32B with strong reasoning and coding capabilities. Streams deliberation in <think> markers.",
            api_version: "qwen/qwen3-32b",
        },
        ModelInfo {
            id: "kimi-k2",
            provider: "groq",
            name: "Kimi K2",
            description: "Moonshot AI's Kimi K2 with a good balance of capabilities.",
            api_version: "moonshotai/kimi-k2-instruct",
        },
        ModelInfo {
            id: "llama4",
            provider: "groq",
            name: "Llama 4",
            description: "Meta's Llama 4 Scout with a good balance of capabilities.",
            api_version: "meta-llama/llama-4-scout-17b-16e-instruct",
        },
        ModelInfo {
            id: "grok-3-mini",
            provider: "xai",
            name: "Grok 3 Mini",
            description: "xAI's Grok 3 Mini with strong reasoning and coding capabilities.",
            api_version: "grok-3-mini-latest",
        },
    ]
}

pub fn catalog_entry(model_id: &str) -> Option<&'static ModelInfo> {
    model_catalog().iter().find(|info| info.id == model_id)
}

/// Maps provider labels to live capability implementations. Built once at
/// startup from the environment; shared read-only across requests.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default_model: String,
}

impl ProviderRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    /// Register providers for which the environment carries credentials.
    /// OpenAI-compatible endpoints (openai, groq, xai) share one adapter.
    pub fn from_env() -> Self {
        let default_model =
            std::env::var("PARLEY_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let mut registry = Self::new(default_model);

        let endpoints: [(&str, &str, &str, &str); 3] = [
            ("openai", "OPENAI_API_KEY", "OPENAI_BASE_URL", "https://api.openai.com/v1"),
            ("groq", "GROQ_API_KEY", "GROQ_BASE_URL", "https://api.groq.com/openai/v1"),
            ("xai", "XAI_API_KEY", "XAI_BASE_URL", "https://api.x.ai/v1"),
        ];
        for (label, key_var, url_var, default_url) in endpoints {
            if let Ok(api_key) = std::env::var(key_var) {
                let base_url =
                    std::env::var(url_var).unwrap_or_else(|_| default_url.to_string());
                registry = registry.with_provider(
                    label,
                    Arc::new(openai_compat::OpenAiCompatProvider::new(base_url, api_key)),
                );
                tracing::info!(provider = label, "model provider configured");
            }
        }
        registry
    }

    pub fn with_provider(
        mut self,
        label: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Self {
        self.providers.insert(label.into(), provider);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Resolve a client-facing model id to its provider implementation.
    /// Configuration errors here reject the turn before any tool-server
    /// connection is attempted.
    pub fn resolve(
        &self,
        model_id: &str,
    ) -> Result<(Arc<dyn ModelProvider>, &'static ModelInfo), AppError> {
        let info = catalog_entry(model_id).ok_or_else(|| AppError::UnknownModel {
            model: model_id.to_string(),
        })?;
        let provider =
            self.providers
                .get(info.provider)
                .ok_or_else(|| AppError::ModelNotConfigured {
                    model: model_id.to_string(),
                    provider: info.provider.to_string(),
                })?;
        Ok((Arc::clone(provider), info))
    }
}
