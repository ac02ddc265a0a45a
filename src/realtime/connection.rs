// Relay connection management for huddle
// One websocket per session. Owns framing, reconnection with backoff and
// per-room sequence cursors used to replay missed envelopes after a rejoin.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{Envelope, Event};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::models::Identity;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, WsMessage>;

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to the relay")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Websocket error: {0}")]
    Socket(String),

    #[error("Could not encode envelope: {0}")]
    Encode(String),
}

/// Anything envelopes can be pushed into
pub trait Outbound: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// In-process sink, used to bridge sessions without a socket
impl Outbound for mpsc::UnboundedSender<Envelope> {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, envelope).map_err(|_| TransportError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Status(ConnectionStatus),
    Envelope(Envelope),
    /// Accepted by `send` but never written to the socket
    SendFailed(Envelope),
}

#[derive(Debug)]
enum Command {
    Send(Envelope),
    Close,
}

#[derive(Debug)]
struct SharedState {
    status: ConnectionStatus,
    retry_count: u32,
    /// Joined rooms and the highest relay sequence seen in each
    rooms: HashMap<String, Option<u64>>,
}

fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable send side of the connection
#[derive(Clone)]
pub struct ConnectionHandle {
    user_id: String,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<SharedState>>,
}

impl ConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared).status
    }

    pub fn retry_count(&self) -> u32 {
        lock(&self.shared).retry_count
    }

    pub fn cursor(&self, room_id: &str) -> Option<u64> {
        lock(&self.shared).rooms.get(room_id).copied().flatten()
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = lock(&self.shared).rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        lock(&self.shared).rooms.contains_key(room_id)
    }

    pub fn join(&self, room_id: &str) -> Result<(), TransportError> {
        self.send(Envelope::new(
            room_id,
            Event::JoinRoom { user_id: self.user_id.clone(), since: None },
        ))
    }

    /// Ask the supervisor to close the socket and stop reconnecting
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            debug!("Connection supervisor already gone");
        }
    }
}

impl Outbound for ConnectionHandle {
    fn send(&self, mut envelope: Envelope) -> Result<(), TransportError> {
        let open = {
            let mut shared = lock(&self.shared);
            // Membership is remembered even while offline so it can be replayed
            match &mut envelope.event {
                Event::JoinRoom { since, .. } => {
                    let cursor = shared.rooms.entry(envelope.room_id.clone()).or_insert(None);
                    if since.is_none() {
                        *since = *cursor;
                    }
                }
                Event::LeaveRoom => {
                    shared.rooms.remove(&envelope.room_id);
                }
                _ => {}
            }
            shared.status == ConnectionStatus::Open
        };

        if !open {
            if envelope.event.is_membership() {
                debug!("Deferring {} for {} until the socket is open", envelope.kind(), envelope.room_id);
                return Ok(());
            }
            return Err(TransportError::NotConnected);
        }

        self.commands
            .send(Command::Send(envelope))
            .map_err(|_| TransportError::Closed)
    }
}

/// An open channel: the send handle plus the inbound event stream
pub struct Connection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

enum PumpOutcome {
    Shutdown,
    Dropped(String),
}

pub struct ConnectionManager {
    url: String,
    token: Option<String>,
    user_id: String,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Mutex<SharedState>>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Dial the relay and start the supervisor task. The first connection
    /// attempt is awaited so an unreachable relay is reported to the caller.
    pub async fn open(config: &ClientConfig, identity: &Identity) -> Result<Connection, TransportError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);
        let shared = Arc::new(Mutex::new(SharedState {
            status: ConnectionStatus::Connecting,
            retry_count: 0,
            rooms: HashMap::new(),
        }));

        let manager = ConnectionManager {
            url: config.relay_url.clone(),
            token: identity.token.clone(),
            user_id: identity.user_id.clone(),
            policy: config.reconnect.clone(),
            commands: command_rx,
            shared: shared.clone(),
            events: event_tx,
        };

        info!("Connecting to relay at {}", manager.url);
        let socket = match manager.dial().await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Connection to relay failed: {}", e);
                lock(&shared).status = ConnectionStatus::Closed;
                return Err(e);
            }
        };

        // Open before anyone holds the handle, so the first send cannot race the supervisor
        lock(&shared).status = ConnectionStatus::Open;
        let _ = manager.events.try_send(ConnectionEvent::Status(ConnectionStatus::Open));
        info!("Connected to relay at {}", manager.url);

        tokio::spawn(manager.supervise(socket));

        Ok(Connection {
            handle: ConnectionHandle {
                user_id: identity.user_id.clone(),
                commands: command_tx,
                shared,
            },
            events: event_rx,
        })
    }

    async fn dial(&self) -> Result<Socket, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        Ok(socket)
    }

    async fn set_status(&self, status: ConnectionStatus) {
        {
            let mut shared = lock(&self.shared);
            if shared.status == status {
                return;
            }
            shared.status = status;
        }
        info!("Relay connection is now {:?}", status);
        let _ = self.events.send(ConnectionEvent::Status(status)).await;
    }

    async fn supervise(mut self, first: Socket) {
        let mut socket = first;
        loop {
            match self.pump(socket).await {
                PumpOutcome::Shutdown => break,
                PumpOutcome::Dropped(reason) => warn!("Relay connection lost: {}", reason),
            }

            self.set_status(ConnectionStatus::Reconnecting).await;
            socket = match self.reconnect().await {
                Some(socket) => socket,
                None => break,
            };
        }

        self.set_status(ConnectionStatus::Closed).await;
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send(envelope) = command {
                self.report_unsent(envelope).await;
            }
        }
        info!("Relay connection supervisor stopped");
    }

    /// Back off and redial until a socket opens, the policy gives up or the
    /// owner asks us to close
    async fn reconnect(&mut self) -> Option<Socket> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            lock(&self.shared).retry_count = attempt;
            if self.policy.exhausted(attempt) {
                error!("Giving up on the relay after {} attempts", attempt - 1);
                return None;
            }

            let delay = self.policy.delay_for(attempt);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            if self.wait_or_close(Instant::now() + delay).await {
                return None;
            }

            match self.dial().await {
                Ok(socket) => {
                    lock(&self.shared).retry_count = 0;
                    return Some(socket);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Returns true when a close was requested during the wait
    async fn wait_or_close(&mut self, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Send(envelope)) => self.report_unsent(envelope).await,
                    Some(Command::Close) | None => return true,
                },
            }
        }
    }

    async fn pump(&mut self, socket: Socket) -> PumpOutcome {
        let (mut sink, mut stream) = socket.split();

        self.set_status(ConnectionStatus::Open).await;
        if let Err(reason) = self.rejoin(&mut sink).await {
            return PumpOutcome::Dropped(reason);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(envelope)) => {
                        if let Err(reason) = write_envelope(&mut sink, &envelope).await {
                            self.report_unsent(envelope).await;
                            return PumpOutcome::Dropped(reason);
                        }
                    }
                    Some(Command::Close) | None => {
                        info!("Closing relay connection");
                        if let Err(e) = sink.close().await {
                            debug!("Error while closing websocket: {}", e);
                        }
                        return PumpOutcome::Shutdown;
                    }
                },
                frame = stream.next() => {
                    if let Some(outcome) = self.on_frame(frame).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn report_unsent(&self, envelope: Envelope) {
        warn!("Dropping {} for {}: connection is down", envelope.kind(), envelope.room_id);
        if envelope.event.is_membership() {
            // Rejoined from the room table once the socket is back
            return;
        }
        let _ = self.events.send(ConnectionEvent::SendFailed(envelope)).await;
    }

    async fn on_frame(
        &self,
        frame: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<PumpOutcome> {
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                let envelope = match Envelope::decode(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Dropping envelope from relay: {}", e);
                        return None;
                    }
                };
                self.advance_cursor(&envelope);
                debug!("Received {} for {}", envelope.kind(), envelope.room_id);
                if self.events.send(ConnectionEvent::Envelope(envelope)).await.is_err() {
                    info!("Inbound consumer went away, shutting down connection");
                    return Some(PumpOutcome::Shutdown);
                }
                None
            }
            Some(Ok(WsMessage::Binary(_))) => {
                warn!("Ignoring binary frame from relay");
                None
            }
            Some(Ok(WsMessage::Close(frame))) => Some(PumpOutcome::Dropped(format!("closed by relay: {:?}", frame))),
            Some(Ok(_)) => None,
            Some(Err(e)) => Some(PumpOutcome::Dropped(e.to_string())),
            None => Some(PumpOutcome::Dropped("stream ended".to_string())),
        }
    }

    fn advance_cursor(&self, envelope: &Envelope) {
        if let Some(seq) = envelope.seq {
            let mut shared = lock(&self.shared);
            if let Some(cursor) = shared.rooms.get_mut(&envelope.room_id) {
                if cursor.map_or(true, |current| seq > current) {
                    *cursor = Some(seq);
                }
            }
        }
    }

    /// Re-announce every joined room, asking for anything after our cursor
    async fn rejoin(&self, sink: &mut SocketSink) -> Result<(), String> {
        let rooms: Vec<(String, Option<u64>)> = lock(&self.shared)
            .rooms
            .iter()
            .map(|(room, cursor)| (room.clone(), *cursor))
            .collect();

        for (room_id, since) in rooms {
            debug!("Joining {} since {:?}", room_id, since);
            let join = Envelope::new(room_id, Event::JoinRoom { user_id: self.user_id.clone(), since });
            write_envelope(sink, &join).await?;
        }
        Ok(())
    }
}

async fn write_envelope(sink: &mut SocketSink, envelope: &Envelope) -> Result<(), String> {
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(e) => {
            // A single bad envelope should not cost us the socket
            error!("{}", TransportError::Encode(e.to_string()));
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text.into())).await.map_err(|e| e.to_string())
}
