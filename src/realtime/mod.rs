//! Real-time session: one relay connection shared by chat, typing presence
//! and call signaling.
//!
//! [`RealtimeSession`] is created when the user signs in and owns every
//! per-connection component. Inbound envelopes are consumed by a single
//! router task ([`RealtimeSession::run`]) in arrival order and dispatched by
//! variant; the UI observes the result through [`SessionEvent`]s.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

pub mod call;
pub mod chat;
pub mod connection;
pub mod protocol;
pub mod typing;

use self::call::{CallController, CallError, CallSettings, CallState, EndReason};
use self::chat::{ChatError, ChatPipeline};
use self::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionStatus, Outbound, TransportError};
use self::protocol::{Envelope, Event};
use self::typing::TypingCoordinator;
use crate::config::ClientConfig;
use crate::media::{MediaEngine, PeerConfig, PeerConnectionState};
use crate::models::{Conversation, Identity, Message};
use crate::store::ConversationStore;

/// Everything the UI needs to redraw
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionStatus),
    MessageAppended(Message),
    /// Delivery status of a message changed
    MessageUpdated(Message),
    ConversationUpdated(Conversation),
    HistoryLoaded { room_id: String, messages: Vec<Message> },
    TypingChanged { room_id: String, users: Vec<String> },
    IncomingCall { room_id: String, caller_name: String },
    CallStateChanged { room_id: String, state: CallState },
    CallEnded { room_id: String, reason: EndReason },
    /// Blocking error for the user, e.g. camera permission denied
    CallFailed { room_id: String, error: String },
    PeerStateChanged { room_id: String, state: PeerConnectionState },
}

#[derive(Clone)]
pub struct RealtimeSession {
    identity: Identity,
    outbound: Arc<dyn Outbound>,
    connection: Option<ConnectionHandle>,
    events: mpsc::UnboundedSender<SessionEvent>,
    chat: ChatPipeline,
    typing: TypingCoordinator,
    calls: CallController,
    sweep_every: Duration,
}

impl RealtimeSession {
    /// Build a session over any outbound sink. The caller feeds inbound
    /// events to [`run`](Self::run).
    pub fn new(
        config: &ClientConfig,
        identity: Identity,
        outbound: Arc<dyn Outbound>,
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn ConversationStore>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let chat = ChatPipeline::new(identity.clone(), outbound.clone(), store, events_tx.clone());
        let typing = TypingCoordinator::new(
            identity.display_name.clone(),
            config.typing_idle(),
            config.remote_typing_ttl(),
            outbound.clone(),
            events_tx.clone(),
        );
        let calls = CallController::new(
            identity.display_name.clone(),
            engine,
            outbound.clone(),
            events_tx.clone(),
            CallSettings {
                constraints: config.media.clone(),
                peer_config: PeerConfig { ice_servers: config.ice_servers.clone() },
                ring_timeout: config.ring_timeout(),
                orphan_limit: config.orphan_candidate_limit,
            },
        );

        let session = Self {
            identity,
            outbound,
            connection: None,
            events: events_tx,
            chat,
            typing,
            calls,
            sweep_every: config.typing_sweep(),
        };
        (session, events_rx)
    }

    /// Open the relay connection and start routing its events
    pub async fn connect(
        config: &ClientConfig,
        identity: Identity,
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn ConversationStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), TransportError> {
        let connection = ConnectionManager::open(config, &identity).await?;
        let handle = connection.handle.clone();
        let (mut session, events) = Self::new(config, identity, Arc::new(handle.clone()), engine, store);
        session.connection = Some(handle);

        tokio::spawn(session.clone().run(connection.events));
        Ok((session, events))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn chat(&self) -> &ChatPipeline {
        &self.chat
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    /// Route inbound events until the connection goes away
    pub async fn run(self, mut inbound: mpsc::Receiver<ConnectionEvent>) {
        let mut sweep = tokio::time::interval(self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(ConnectionEvent::Envelope(envelope)) => self.dispatch(envelope).await,
                    Some(ConnectionEvent::Status(status)) => self.handle_status(status).await,
                    Some(ConnectionEvent::SendFailed(envelope)) => self.handle_unsent(envelope).await,
                    None => break,
                },
                _ = sweep.tick() => self.typing.sweep(Instant::now()).await,
            }
        }

        info!("Inbound stream ended, shutting the session down");
        self.shutdown().await;
    }

    /// Single entry point for every inbound envelope
    pub async fn dispatch(&self, envelope: Envelope) {
        let Envelope { room_id, seq, event } = envelope;
        debug!("Dispatching {} for {} (seq {:?})", event.kind(), room_id, seq);

        match event {
            Event::Message(payload) => {
                self.typing.clear_sender(&room_id, &payload.sender_name).await;
                self.chat.handle_inbound(&room_id, &payload).await;
            }
            Event::Typing { user_name, is_typing } => {
                self.typing
                    .handle_remote(&room_id, &user_name, is_typing, Instant::now())
                    .await;
            }
            Event::CallOffer { offer, caller_name } => {
                let on_screen = self.chat.is_active(&room_id).await;
                self.calls.handle_offer(&room_id, offer, &caller_name, on_screen).await;
            }
            Event::CallAnswer { answer } => self.calls.handle_answer(&room_id, answer).await,
            Event::IceCandidate { candidate } => self.calls.handle_remote_candidate(&room_id, candidate).await,
            Event::CallEnd => self.calls.handle_remote_end(&room_id, EndReason::RemoteHangup).await,
            Event::CallReject => self.calls.handle_remote_end(&room_id, EndReason::Rejected).await,
            Event::JoinRoom { .. } | Event::LeaveRoom => {
                debug!("Ignoring membership frame for {}", room_id);
            }
        }
    }

    async fn handle_unsent(&self, envelope: Envelope) {
        match &envelope.event {
            Event::Message(payload) => match &payload.id {
                Some(id) => {
                    self.chat.mark_failed(&envelope.room_id, id).await;
                }
                None => warn!("Undelivered message for {} has no id", envelope.room_id),
            },
            other => warn!("{} for {} was not delivered", other.kind(), envelope.room_id),
        }
    }

    async fn handle_status(&self, status: ConnectionStatus) {
        // Typing hints from before a drop are stale either way
        self.typing.clear_remote().await;
        let _ = self.events.send(SessionEvent::Connection(status));
    }

    /// Fetch the conversation list and subscribe to every room in it, so
    /// conversations that are not on screen still collect unread messages
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let conversations = self.chat.load_conversations().await?;
        for conversation in &conversations {
            self.join(&conversation.id);
        }
        Ok(conversations)
    }

    /// Show a conversation and subscribe to its room
    pub async fn select_conversation(&self, room_id: &str) -> Result<Vec<Message>, ChatError> {
        let messages = self.chat.select(room_id).await?;
        self.join(room_id);
        Ok(messages)
    }

    fn join(&self, room_id: &str) {
        if self.connection.as_ref().map_or(false, |c| c.is_joined(room_id)) {
            return;
        }
        let join = Envelope::new(
            room_id,
            Event::JoinRoom { user_id: self.identity.user_id.clone(), since: None },
        );
        if let Err(e) = self.outbound.send(join) {
            warn!("Could not join {}: {}", room_id, e);
        }
    }

    pub async fn input_changed(&self, room_id: &str, text: &str) {
        self.typing.input_changed(room_id, text).await;
    }

    pub async fn send_message(&self, room_id: &str, text: &str) -> Result<Message, ChatError> {
        self.typing.stop_typing(room_id).await;
        self.chat.send(room_id, text).await
    }

    pub async fn start_call(&self, room_id: &str) -> Result<(), CallError> {
        let peer_name = self.chat.conversation(room_id).await.map(|c| c.title).unwrap_or_default();
        self.calls.start_call(room_id, &peer_name).await
    }

    pub async fn accept_call(&self, room_id: &str) -> Result<(), CallError> {
        self.calls.accept_call(room_id).await
    }

    pub async fn reject_call(&self, room_id: &str) -> Result<(), CallError> {
        self.calls.reject_call(room_id).await
    }

    pub async fn hang_up(&self, room_id: &str) -> Result<(), CallError> {
        self.calls.hang_up(room_id).await
    }

    /// End calls, stop timers and close the relay connection
    pub async fn shutdown(&self) {
        self.calls.shutdown().await;
        self.typing.shutdown().await;
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }
}
