//! Descriptor resolution: declarative server config in, connection recipe
//! out. Pure — no network I/O happens here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single `key`/`value` pair, as chat clients send headers and env vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Transport a tool server is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Sse,
    Subprocess,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Declarative description of one tool server, supplied per request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerDescriptor {
    #[serde(default)]
    pub url: Option<String>,
    /// Accepts `type` too, the name hosted chat configs historically used.
    #[serde(alias = "type")]
    pub kind: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<KeyValuePair>,
    #[serde(default)]
    pub headers: Vec<KeyValuePair>,
}

impl ServerDescriptor {
    /// Display label for logs: the url when present, otherwise the command.
    pub fn label(&self) -> &str {
        self.url
            .as_deref()
            .or(self.command.as_deref())
            .unwrap_or("<unnamed>")
    }
}

/// Wire protocol of a resolved recipe. Subprocess never appears here —
/// resolution rejects it before a recipe exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeKind {
    Http,
    Sse,
}

/// Everything the client layer needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecipe {
    pub kind: RecipeKind,
    pub url: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Subprocess-backed servers are long-lived and owned by the external
    /// supervisor; the per-turn path never spawns or supervises processes.
    #[error(
        "subprocess transport is not supported here; register '{command}' with the tool-server supervisor instead"
    )]
    SubprocessUnsupported { command: String },
    #[error("descriptor with kind '{kind}' requires a url")]
    MissingUrl { kind: TransportKind },
    #[error("subprocess descriptor requires a command")]
    MissingCommand,
}

/// Resolve a descriptor into a connection recipe.
///
/// Header pairs are flattened into a name→value map; duplicate keys are
/// last-write-wins. Pairs with an empty key are dropped.
pub fn resolve(descriptor: &ServerDescriptor) -> Result<ConnectionRecipe, TransportError> {
    match descriptor.kind {
        TransportKind::Http | TransportKind::Sse => {
            let url = descriptor
                .url
                .clone()
                .filter(|u| !u.is_empty())
                .ok_or(TransportError::MissingUrl {
                    kind: descriptor.kind,
                })?;
            let kind = match descriptor.kind {
                TransportKind::Http => RecipeKind::Http,
                _ => RecipeKind::Sse,
            };
            Ok(ConnectionRecipe {
                kind,
                url,
                headers: flatten_headers(&descriptor.headers),
            })
        }
        TransportKind::Subprocess => {
            let command = descriptor
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or(TransportError::MissingCommand)?;
            Err(TransportError::SubprocessUnsupported { command })
        }
    }
}

fn flatten_headers(pairs: &[KeyValuePair]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for pair in pairs {
        if pair.key.is_empty() {
            continue;
        }
        headers.insert(pair.key.clone(), pair.value.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: TransportKind, url: Option<&str>) -> ServerDescriptor {
        ServerDescriptor {
            url: url.map(String::from),
            kind,
            command: None,
            args: Vec::new(),
            env: Vec::new(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn resolves_http_descriptor() {
        let recipe = resolve(&descriptor(TransportKind::Http, Some("https://tools.example/mcp")))
            .unwrap();
        assert_eq!(recipe.kind, RecipeKind::Http);
        assert_eq!(recipe.url, "https://tools.example/mcp");
        assert!(recipe.headers.is_empty());
    }

    #[test]
    fn resolves_sse_descriptor() {
        let recipe =
            resolve(&descriptor(TransportKind::Sse, Some("https://tools.example/sse"))).unwrap();
        assert_eq!(recipe.kind, RecipeKind::Sse);
    }

    #[test]
    fn duplicate_headers_are_last_write_wins() {
        let mut d = descriptor(TransportKind::Http, Some("https://tools.example/mcp"));
        d.headers = vec![
            KeyValuePair {
                key: "authorization".to_string(),
                value: "Bearer old".to_string(),
            },
            KeyValuePair {
                key: "x-trace".to_string(),
                value: "1".to_string(),
            },
            KeyValuePair {
                key: "authorization".to_string(),
                value: "Bearer new".to_string(),
            },
            KeyValuePair {
                key: "".to_string(),
                value: "dropped".to_string(),
            },
        ];
        let recipe = resolve(&d).unwrap();
        assert_eq!(recipe.headers.len(), 2);
        assert_eq!(recipe.headers["authorization"], "Bearer new");
    }

    #[test]
    fn http_without_url_is_rejected() {
        let err = resolve(&descriptor(TransportKind::Http, None)).unwrap_err();
        assert!(matches!(err, TransportError::MissingUrl { .. }));
    }

    #[test]
    fn subprocess_is_forwarded_to_the_supervisor_not_resolved() {
        let mut d = descriptor(TransportKind::Subprocess, None);
        d.command = Some("mcp-server-filesystem".to_string());
        let err = resolve(&d).unwrap_err();
        assert!(matches!(err, TransportError::SubprocessUnsupported { .. }));
        assert!(err.to_string().contains("supervisor"));
    }

    #[test]
    fn subprocess_without_command_violates_the_descriptor_invariant() {
        let err = resolve(&descriptor(TransportKind::Subprocess, None)).unwrap_err();
        assert!(matches!(err, TransportError::MissingCommand));
    }

    #[test]
    fn kind_deserializes_from_lowercase_wire_names() {
        let d: ServerDescriptor = serde_json::from_str(
            r#"{"url": "https://tools.example/mcp", "kind": "sse"}"#,
        )
        .unwrap();
        assert_eq!(d.kind, TransportKind::Sse);
        assert!(d.headers.is_empty());
    }

    #[test]
    fn kind_accepts_the_legacy_type_field_name() {
        let d: ServerDescriptor = serde_json::from_str(
            r#"{"url": "https://tools.example/mcp", "type": "http"}"#,
        )
        .unwrap();
        assert_eq!(d.kind, TransportKind::Http);
    }
}
