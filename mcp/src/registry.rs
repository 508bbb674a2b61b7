//! The per-turn tool namespace.
//!
//! Every connected server's catalog is flattened into one name-keyed map.
//! Collisions are not errors: the tool from the later server in descriptor
//! order overwrites the earlier one, which makes the descriptor list an
//! override mechanism and its ordering part of the contract. The registry
//! is never mutated once the completion loop starts.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::client::{McpError, ToolDescriptor, ToolOutcome, ToolServer};

struct RegisteredTool {
    server: Arc<dyn ToolServer>,
    descriptor: ToolDescriptor,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// List every server's tools concurrently and fold the catalogs together
    /// in input order. A server whose listing fails contributes zero tools;
    /// that is logged, not fatal.
    pub async fn merge(servers: &[Arc<dyn ToolServer>]) -> ToolRegistry {
        let listings = futures_util::future::join_all(
            servers.iter().map(|server| server.list_tools()),
        )
        .await;

        let mut tools = HashMap::new();
        for (server, listing) in servers.iter().zip(listings) {
            match listing {
                Ok(descriptors) => {
                    tracing::debug!(
                        server = server.label(),
                        count = descriptors.len(),
                        "tool catalog merged"
                    );
                    for descriptor in descriptors {
                        let replaced = tools.insert(
                            descriptor.name.clone(),
                            RegisteredTool {
                                server: Arc::clone(server),
                                descriptor,
                            },
                        );
                        if let Some(replaced) = replaced {
                            tracing::debug!(
                                tool = replaced.descriptor.name,
                                winner = server.label(),
                                loser = replaced.server.label(),
                                "tool name collision, later server wins"
                            );
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        server = server.label(),
                        error = %error,
                        "tool listing failed, contributing zero tools"
                    );
                }
            }
        }

        ToolRegistry { tools }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// The merged catalog, for handing to the model capability.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| tool.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Label of the server a tool resolves to, if registered.
    pub fn owner(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(|tool| tool.server.label())
    }

    /// Dispatch a call to the owning server. An unregistered name is an
    /// `Rpc` method-not-found error, shaped like a server would report it.
    pub async fn call(&self, name: &str, args: Value) -> Result<ToolOutcome, McpError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(McpError::Rpc {
                code: -32601,
                message: format!("Unknown tool: {name}"),
            });
        };
        tool.server.call_tool(name, args).await
    }
}
