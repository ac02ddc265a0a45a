use serde::{Deserialize, Serialize};

use crate::realtime::protocol::ChatPayload;

/// Who we are on the relay. Issued by the external auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Opaque bearer token sent in the websocket handshake
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participants: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Id of the newest message we know about
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub unread: u32,
}

impl Conversation {
    pub fn touch(&mut self, message: &Message) {
        self.last_message_id = Some(message.id.clone());
        self.last_message_preview = Some(message.content.chars().take(80).collect());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending, // Optimistic copy, echo not seen yet
    Sent,    // Echo reconciled, or received from someone else
    Failed,  // Transport refused the envelope
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub delivery_status: DeliveryStatus,
}

impl Message {
    /// Build a message from an inbound `message` envelope. Envelopes from
    /// older clients carry no id, so one is minted locally.
    pub fn from_payload(conversation_id: &str, payload: &ChatPayload) -> Self {
        Self {
            id: payload
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            conversation_id: conversation_id.to_string(),
            sender_id: payload.sender_id.clone(),
            sender_name: payload.sender_name.clone(),
            sender_avatar: payload.sender_avatar.clone(),
            content: payload.content.clone(),
            kind: MessageKind::Text,
            timestamp: payload.timestamp,
            delivery_status: DeliveryStatus::Sent,
        }
    }

    pub fn to_payload(&self) -> ChatPayload {
        ChatPayload {
            id: Some(self.id.clone()),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            sender_avatar: self.sender_avatar.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }
}
