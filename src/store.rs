// Conversation store
// Conversation lists, history and creation live behind an HTTP service we do
// not own. The trait is the seam; MemoryStore backs the CLI and tests.

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{Conversation, ConversationKind, Message};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Request body for creating a conversation
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub participants: Vec<String>,
    pub title: String,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;

    /// Oldest first
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    conversations: Vec<Conversation>,
    history: HashMap<String, Vec<Message>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_conversation(&self, conversation: Conversation) {
        let mut inner = self.inner.lock().await;
        inner.conversations.retain(|c| c.id != conversation.id);
        inner.conversations.push(conversation);
    }

    /// Append to a conversation's stored history
    pub async fn record(&self, message: Message) {
        let mut inner = self.inner.lock().await;
        inner
            .history
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .conversations
            .iter()
            .filter(|c| c.participants.iter().any(|p| p == user_id))
            .cloned()
            .collect())
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        let mut history = inner.history.get(conversation_id).cloned().unwrap_or_default();
        history.sort_by_key(|m| m.timestamp);
        Ok(history)
    }

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            kind: new.kind,
            participants: new.participants,
            title: new.title,
            avatar: None,
            last_message_id: None,
            last_message_preview: None,
            unread: 0,
        };
        debug!("Created conversation {} ({})", conversation.id, conversation.title);
        self.inner.lock().await.conversations.push(conversation.clone());
        Ok(conversation)
    }
}
