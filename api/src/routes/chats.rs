use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router, routing::get};
use chrono::Utc;
use parley_core::chat::ChatSession;
use uuid::Uuid;

use super::require_owner;
use crate::chat::store::ChatStore;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chats", get(list_chats))
        .route("/v1/chats/{id}", get(get_chat).delete(delete_chat))
}

/// All of the caller's sessions, newest activity first.
#[utoipa::path(
    get,
    path = "/v1/chats",
    params(("x-user-id" = String, Header, description = "Owner id")),
    responses(
        (status = 200, description = "Sessions owned by the caller", body = Vec<ChatSession>),
        (status = 401, description = "No owner id on the request")
    ),
    tag = "chats"
)]
pub async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSession>>, AppError> {
    let owner = require_owner(None, &headers)?;
    let sessions = ChatStore::new(state.db.clone())
        .list_sessions(owner)
        .await?;
    Ok(Json(sessions))
}

/// One session with its full transcript. An id that does not exist yet
/// returns an empty shell rather than a 404, so a client can render a
/// fresh conversation before its first turn is persisted.
#[utoipa::path(
    get,
    path = "/v1/chats/{id}",
    params(
        ("id" = Uuid, Path, description = "Session id"),
        ("x-user-id" = String, Header, description = "Owner id")
    ),
    responses(
        (status = 200, description = "The session", body = ChatSession),
        (status = 401, description = "No owner id on the request")
    ),
    tag = "chats"
)]
pub async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ChatSession>, AppError> {
    let owner = require_owner(None, &headers)?;
    let session = ChatStore::new(state.db.clone())
        .get_session(id, owner)
        .await?;
    let now = Utc::now();
    Ok(Json(session.unwrap_or(ChatSession {
        id,
        owner_id: owner,
        messages: Vec::new(),
        created_at: now,
        updated_at: now,
    })))
}

#[utoipa::path(
    delete,
    path = "/v1/chats/{id}",
    params(
        ("id" = Uuid, Path, description = "Session id"),
        ("x-user-id" = String, Header, description = "Owner id")
    ),
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, description = "No such session for this owner"),
        (status = 401, description = "No owner id on the request")
    ),
    tag = "chats"
)]
pub async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let owner = require_owner(None, &headers)?;
    let deleted = ChatStore::new(state.db.clone())
        .delete_session(id, owner)
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound {
            resource: "Chat session".to_string(),
        })
    }
}
