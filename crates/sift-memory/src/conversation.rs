use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_llm::provider::Role;

use crate::error::MemoryError;
use crate::types::{ConversationId, RepositoryId};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A retrieved chunk that was shown to the model for an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub context: Vec<ContextRef>,
    pub tokens_used: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            context: Vec::new(),
            tokens_used: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn assistant(
        content: impl Into<String>,
        context: Vec<ContextRef>,
        tokens_used: Option<u32>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            context,
            tokens_used,
            created_at: Utc::now(),
        }
    }
}

/// A conversation with its messages in chronological order.
///
/// Messages are append-only; stores persist the ones they have not seen yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub repository_id: Option<RepositoryId>,
    pub title: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn push(&mut self, message: ConversationMessage) {
        self.updated_at = message.created_at;
        self.messages.push(message);
    }

    /// The last `limit` messages.
    #[must_use]
    pub fn recent(&self, limit: usize) -> &[ConversationMessage] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    #[must_use]
    pub fn first_user_message(&self) -> Option<&ConversationMessage> {
        self.messages.iter().find(|m| m.role == Role::User)
    }
}

/// Session persistence consumed by the answer orchestrator.
pub trait ConversationStore: Send + Sync {
    fn create(
        &self,
        repository_id: Option<RepositoryId>,
        title: Option<String>,
    ) -> BoxFuture<'_, Result<Conversation, MemoryError>>;

    /// `Ok(None)` when no conversation has this id.
    fn load(&self, id: ConversationId) -> BoxFuture<'_, Result<Option<Conversation>, MemoryError>>;

    /// Persist title, binding and any messages not stored yet.
    fn save<'a>(&'a self, conversation: &'a Conversation)
    -> BoxFuture<'a, Result<(), MemoryError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        let now = Utc::now();
        Conversation {
            id: ConversationId(1),
            repository_id: None,
            title: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn recent_returns_tail() {
        let mut c = conversation();
        for i in 0..5 {
            c.push(ConversationMessage::user(format!("m{i}")));
        }
        let tail = c.recent(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(c.recent(10).len(), 5);
    }

    #[test]
    fn push_updates_timestamp() {
        let mut c = conversation();
        let msg = ConversationMessage::user("hi");
        let ts = msg.created_at;
        c.push(msg);
        assert_eq!(c.updated_at, ts);
    }

    #[test]
    fn first_user_message_skips_assistant() {
        let mut c = conversation();
        c.push(ConversationMessage::assistant("hello", vec![], None));
        c.push(ConversationMessage::user("question"));
        assert_eq!(c.first_user_message().unwrap().content, "question");
    }

    #[test]
    fn context_ref_json_roundtrip() {
        let r = ContextRef {
            chunk_id: "abc".into(),
            file_path: "main.go".into(),
            start_line: 1,
            end_line: 150,
            score: 0.9,
        };
        let json = serde_json::to_string(&vec![r.clone()]).unwrap();
        let back: Vec<ContextRef> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![r]);
    }
}
