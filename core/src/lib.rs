//! Shared types for Parley: conversation messages and their parts, chat
//! sessions, and the structured API error envelope.
//!
//! Everything here is wire-level — the same serde shapes are used in request
//! bodies, the SSE event stream, and the persisted `messages` JSONB column,
//! so part ordering round-trips through storage unchanged.

pub mod chat;
pub mod error;
