// Chat message pipeline
// Sends are shown immediately as pending copies and reconciled against the
// relay's echo by message id. History from the store is merged by id.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::connection::{Outbound, TransportError};
use super::protocol::{ChatPayload, Envelope, Event};
use super::SessionEvent;
use crate::models::{Conversation, DeliveryStatus, Identity, Message, MessageKind};
use crate::store::{ConversationStore, NewConversation, StoreError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Refusing to send an empty message")]
    Empty,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Message {message_id} was not sent: {source}")]
    Transport {
        message_id: String,
        #[source]
        source: TransportError,
    },
}

/// What happened to an inbound `message` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// New entry at the tail of the active conversation
    Appended,
    /// Echo of our own pending copy
    Reconciled,
    /// Already in the timeline
    Duplicate,
    /// Buffered for a conversation that is not on screen
    Background,
}

#[derive(Debug, Default)]
struct ChatState {
    conversations: HashMap<String, Conversation>,
    timelines: HashMap<String, Vec<Message>>,
    history_loaded: HashSet<String>,
    active: Option<String>,
}

impl ChatState {
    fn knows(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id) || self.timelines.contains_key(conversation_id)
    }
}

#[derive(Clone)]
pub struct ChatPipeline {
    identity: Identity,
    outbound: Arc<dyn Outbound>,
    store: Arc<dyn ConversationStore>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<Mutex<ChatState>>,
}

impl ChatPipeline {
    pub fn new(
        identity: Identity,
        outbound: Arc<dyn Outbound>,
        store: Arc<dyn ConversationStore>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            identity,
            outbound,
            store,
            events,
            state: Arc::new(Mutex::new(ChatState::default())),
        }
    }

    pub async fn load_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let fetched = self.store.list_conversations(&self.identity.user_id).await?;
        let mut state = self.state.lock().await;
        for conversation in &fetched {
            // Keep the live counters we already track for known conversations
            state
                .conversations
                .entry(conversation.id.clone())
                .or_insert_with(|| conversation.clone());
        }
        info!("Loaded {} conversations", fetched.len());
        let mut conversations: Vec<Conversation> = state.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(conversations)
    }

    pub async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, ChatError> {
        let conversation = self.store.create_conversation(new).await?;
        self.state
            .lock()
            .await
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        self.emit(SessionEvent::ConversationUpdated(conversation.clone()));
        Ok(conversation)
    }

    /// Make a conversation the visible one. History is fetched from the
    /// store the first time and merged with whatever arrived live.
    pub async fn select(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let needs_history = !self.state.lock().await.history_loaded.contains(conversation_id);

        let history = if needs_history {
            match self.store.fetch_history(conversation_id).await {
                Ok(history) => Some(history),
                Err(StoreError::NotFound(id)) => return Err(ChatError::UnknownConversation(id)),
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let mut state = self.state.lock().await;
        if let Some(history) = history {
            let live = state.timelines.remove(conversation_id).unwrap_or_default();
            let merged = merge_history(history, live);
            debug!("Merged timeline for {} has {} messages", conversation_id, merged.len());
            state.timelines.insert(conversation_id.to_string(), merged);
            state.history_loaded.insert(conversation_id.to_string());
        }

        state.active = Some(conversation_id.to_string());
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            if conversation.unread != 0 {
                conversation.unread = 0;
                self.emit(SessionEvent::ConversationUpdated(conversation.clone()));
            }
        }

        let messages = state.timelines.entry(conversation_id.to_string()).or_default().clone();
        self.emit(SessionEvent::HistoryLoaded {
            room_id: conversation_id.to_string(),
            messages: messages.clone(),
        });
        Ok(messages)
    }

    /// Optimistically append and transmit. The pending copy is in the
    /// timeline before the envelope leaves, so the echo always finds it.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<Message, ChatError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(ChatError::Empty);
        }

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.identity.user_id.clone(),
            sender_name: self.identity.display_name.clone(),
            sender_avatar: self.identity.avatar.clone(),
            content: content.to_string(),
            kind: MessageKind::Text,
            timestamp: Utc::now().timestamp_millis(),
            delivery_status: DeliveryStatus::Pending,
        };

        {
            let mut state = self.state.lock().await;
            if !state.knows(conversation_id) {
                return Err(ChatError::UnknownConversation(conversation_id.to_string()));
            }
            state
                .timelines
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                conversation.touch(&message);
            }
        }
        self.emit(SessionEvent::MessageAppended(message.clone()));

        let envelope = Envelope::new(conversation_id, Event::Message(message.to_payload()));
        if let Err(source) = self.outbound.send(envelope) {
            warn!("Message {} to {} failed: {}", message.id, conversation_id, source);
            self.set_status(conversation_id, &message.id, DeliveryStatus::Failed).await;
            return Err(ChatError::Transport { message_id: message.id, source });
        }

        debug!("Sent message {} to {}", message.id, conversation_id);
        Ok(message)
    }

    /// Apply an inbound `message` envelope
    pub async fn handle_inbound(&self, conversation_id: &str, payload: &ChatPayload) -> InboundOutcome {
        let incoming = Message::from_payload(conversation_id, payload);
        let mut state = self.state.lock().await;
        let is_active = state.active.as_deref() == Some(conversation_id);
        let timeline = state.timelines.entry(conversation_id.to_string()).or_default();

        if let Some(existing) = timeline.iter_mut().find(|m| m.id == incoming.id) {
            if existing.delivery_status == DeliveryStatus::Sent {
                debug!("Ignoring duplicate message {}", incoming.id);
                return InboundOutcome::Duplicate;
            }
            existing.delivery_status = DeliveryStatus::Sent;
            let updated = existing.clone();
            drop(state);
            debug!("Reconciled message {} with its echo", updated.id);
            self.emit(SessionEvent::MessageUpdated(updated));
            return InboundOutcome::Reconciled;
        }

        timeline.push(incoming.clone());
        let conversation = state.conversations.get_mut(conversation_id).map(|conversation| {
            conversation.touch(&incoming);
            if !is_active {
                conversation.unread += 1;
            }
            conversation.clone()
        });
        drop(state);

        if is_active {
            self.emit(SessionEvent::MessageAppended(incoming));
            InboundOutcome::Appended
        } else {
            if let Some(conversation) = conversation {
                self.emit(SessionEvent::ConversationUpdated(conversation));
            }
            InboundOutcome::Background
        }
    }

    /// A message the connection gave up on. An echo may have beaten the
    /// report here, so only a pending copy is touched.
    pub async fn mark_failed(&self, conversation_id: &str, message_id: &str) -> bool {
        let pending = {
            let state = self.state.lock().await;
            state
                .timelines
                .get(conversation_id)
                .and_then(|timeline| timeline.iter().find(|m| m.id == message_id))
                .map_or(false, |m| m.delivery_status == DeliveryStatus::Pending)
        };
        if pending {
            warn!("Message {} to {} was never delivered", message_id, conversation_id);
            self.set_status(conversation_id, message_id, DeliveryStatus::Failed).await;
        }
        pending
    }

    async fn set_status(&self, conversation_id: &str, message_id: &str, status: DeliveryStatus) {
        let updated = {
            let mut state = self.state.lock().await;
            state
                .timelines
                .get_mut(conversation_id)
                .and_then(|timeline| timeline.iter_mut().find(|m| m.id == message_id))
                .map(|message| {
                    message.delivery_status = status;
                    message.clone()
                })
        };
        if let Some(message) = updated {
            self.emit(SessionEvent::MessageUpdated(message));
        }
    }

    pub async fn timeline(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.lock().await;
        state.timelines.get(conversation_id).cloned().unwrap_or_default()
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state.lock().await.conversations.get(conversation_id).cloned()
    }

    pub async fn active(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn is_active(&self, conversation_id: &str) -> bool {
        self.state.lock().await.active.as_deref() == Some(conversation_id)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// History first (authoritative order), then live entries it does not contain
fn merge_history(history: Vec<Message>, live: Vec<Message>) -> Vec<Message> {
    let known: HashSet<String> = history.iter().map(|m| m.id.clone()).collect();
    let mut merged = history;
    merged.extend(live.into_iter().filter(|m| !known.contains(&m.id)));
    merged
}
