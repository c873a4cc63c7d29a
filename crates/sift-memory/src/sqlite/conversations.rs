use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use sift_llm::provider::Role;
use sqlx::SqlitePool;

use crate::conversation::{ContextRef, Conversation, ConversationMessage, ConversationStore};
use crate::error::MemoryError;
use crate::types::{ConversationId, RepositoryId};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: ConversationId,
    repository_id: Option<RepositoryId>,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    role: String,
    content: String,
    context: String,
    tokens_used: Option<i64>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> ConversationMessage {
        let context: Vec<ContextRef> = serde_json::from_str(&self.context).unwrap_or_default();
        ConversationMessage {
            role: Role::parse(&self.role),
            content: self.content,
            context,
            tokens_used: self.tokens_used.and_then(|t| u32::try_from(t).ok()),
            created_at: self.created_at,
        }
    }
}

/// Listing entry for recent conversations.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub repository_id: Option<RepositoryId>,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Conversations and their messages in `SQLite`.
#[derive(Debug, Clone)]
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create an empty conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_conversation(
        &self,
        repository_id: Option<RepositoryId>,
        title: Option<String>,
    ) -> Result<Conversation, MemoryError> {
        let now = Utc::now();
        let id: ConversationId = sqlx::query_scalar(
            "INSERT INTO conversations (repository_id, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(repository_id)
        .bind(title.as_deref())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Conversation {
            id,
            repository_id,
            title,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Load a conversation with all of its messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, MemoryError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            "SELECT id, repository_id, title, created_at, updated_at \
             FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let messages: Vec<MessageRow> = sqlx::query_as(
            "SELECT role, content, context, tokens_used, created_at \
             FROM conversation_messages WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Conversation {
            id: row.id,
            repository_id: row.repository_id,
            title: row.title,
            messages: messages.into_iter().map(MessageRow::into_message).collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    /// Persist the conversation header and append messages beyond those already stored.
    ///
    /// # Errors
    ///
    /// Returns `ConversationNotFound` if the conversation row does not exist, or a
    /// database error.
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversations SET repository_id = ?, title = ?, updated_at = ? WHERE id = ?",
        )
        .bind(conversation.repository_id)
        .bind(conversation.title.as_deref())
        .bind(conversation.updated_at)
        .bind(conversation.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MemoryError::ConversationNotFound(conversation.id));
        }

        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?",
        )
        .bind(conversation.id)
        .fetch_one(&mut *tx)
        .await?;
        let stored = usize::try_from(stored)?;

        for message in conversation.messages.iter().skip(stored) {
            let context = serde_json::to_string(&message.context)?;
            sqlx::query(
                "INSERT INTO conversation_messages \
                 (conversation_id, role, content, context, tokens_used, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(conversation.id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(context)
            .bind(message.tokens_used.map(i64::from))
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Most recently updated conversations, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ConversationSummary>, MemoryError> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT id, repository_id, title, created_at, updated_at \
             FROM conversations ORDER BY updated_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ConversationSummary {
                id: r.id,
                repository_id: r.repository_id,
                title: r.title,
                updated_at: r.updated_at,
            })
            .collect())
    }
}

impl ConversationStore for SqliteConversationStore {
    fn create(
        &self,
        repository_id: Option<RepositoryId>,
        title: Option<String>,
    ) -> BoxFuture<'_, Result<Conversation, MemoryError>> {
        Box::pin(self.create_conversation(repository_id, title))
    }

    fn load(&self, id: ConversationId) -> BoxFuture<'_, Result<Option<Conversation>, MemoryError>> {
        Box::pin(self.load_conversation(id))
    }

    fn save<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(self.save_conversation(conversation))
    }
}
