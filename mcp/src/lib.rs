//! MCP client runtime for Parley.
//!
//! A conversation turn arrives with a list of declarative server
//! descriptors. This crate turns those into live JSON-RPC clients for the
//! duration of exactly one turn:
//!
//! - [`transport`] resolves a descriptor into a connection recipe without
//!   doing any I/O,
//! - [`client`] speaks JSON-RPC 2.0 (`initialize`, `tools/list`,
//!   `tools/call`) over HTTP and SSE transports,
//! - [`pool`] opens clients concurrently, isolates per-server failures, and
//!   guarantees exactly-once teardown no matter how the turn ends,
//! - [`registry`] merges every client's tool catalog into one flat
//!   name-keyed namespace with deterministic collision semantics.
//!
//! Nothing in here is shared across requests: pools and registries are built
//! fresh per turn and torn down with it.

pub mod client;
pub mod pool;
pub mod registry;
pub mod transport;

pub use client::{McpClient, McpError, ToolDescriptor, ToolOutcome, ToolServer};
pub use pool::{ClientPool, ConnectFailure, PoolConfig};
pub use registry::ToolRegistry;
pub use transport::{
    ConnectionRecipe, KeyValuePair, RecipeKind, ServerDescriptor, TransportError, TransportKind,
};
