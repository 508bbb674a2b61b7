//! Session persistence. One row per conversation; the transcript lives in a
//! jsonb column and is reconciled whole at turn boundaries rather than
//! appended incrementally, so a crashed turn can never leave a half-written
//! message behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::chat::{ChatSession, ConversationMessage};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transcript serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where a finished turn's transcript goes. The driver only depends on this
/// seam, which keeps the orchestration loop testable without a database.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn reconcile(
        &self,
        chat_id: Uuid,
        owner_id: Uuid,
        messages: &[ConversationMessage],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    owner_id: Uuid,
    messages: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_session(self) -> Result<ChatSession, StoreError> {
        let messages: Vec<ConversationMessage> = serde_json::from_value(self.messages)?;
        Ok(ChatSession {
            id: self.id,
            owner_id: self.owner_id,
            messages,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct ChatStore {
    pool: PgPool,
}

impl ChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the session row if it does not exist yet. Runs before the turn
    /// streams so a concurrent listing already sees the conversation.
    pub async fn ensure_session(&self, chat_id: Uuid, owner_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_sessions (id, owner_id, messages) \
             VALUES ($1, $2, '[]'::jsonb) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(chat_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest-first session listing for one owner.
    pub async fn list_sessions(&self, owner_id: Uuid) -> Result<Vec<ChatSession>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, owner_id, messages, created_at, updated_at \
             FROM chat_sessions WHERE owner_id = $1 \
             ORDER BY updated_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    pub async fn get_session(
        &self,
        chat_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<ChatSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, owner_id, messages, created_at, updated_at \
             FROM chat_sessions WHERE id = $1 AND owner_id = $2",
        )
        .bind(chat_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Returns whether a row was actually deleted.
    pub async fn delete_session(&self, chat_id: Uuid, owner_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1 AND owner_id = $2")
            .bind(chat_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TranscriptSink for ChatStore {
    /// Replace the stored transcript with the in-memory one. Upserts so a
    /// turn whose `ensure_session` raced a delete still persists its work.
    async fn reconcile(
        &self,
        chat_id: Uuid,
        owner_id: Uuid,
        messages: &[ConversationMessage],
    ) -> Result<(), StoreError> {
        let transcript = serde_json::to_value(messages)?;
        sqlx::query(
            "INSERT INTO chat_sessions (id, owner_id, messages) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE \
             SET messages = EXCLUDED.messages, updated_at = now() \
             WHERE chat_sessions.owner_id = EXCLUDED.owner_id",
        )
        .bind(chat_id)
        .bind(owner_id)
        .bind(transcript)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
