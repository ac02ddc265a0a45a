// Development relay
// Fans envelopes out to the members of each room and stamps them with a
// per-room sequence number. A short log per room lets clients that rejoin
// with `since` catch up on what they missed while disconnected.
//
// Chat messages go to every member including the sender (that echo is what
// the sender reconciles against). Everything else goes to the other members.
// Typing hints are ephemeral: not stamped, not logged.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::realtime::protocol::{Envelope, Event};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Envelopes kept per room for replay
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            history_limit: 256,
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Frame(String),
    Close,
}

type ConnTx = mpsc::UnboundedSender<Outgoing>;

/// A stamped envelope kept for replay
struct Logged {
    seq: u64,
    sender: String,
    /// Chat messages are echoed to their sender, signaling is not
    echo: bool,
    frame: String,
}

impl Logged {
    /// What a member rejoining with cursor `since` should get again
    fn replays_to(&self, user_id: &str, since: u64) -> bool {
        self.seq > since && (self.echo || self.sender != user_id)
    }
}

#[derive(Default)]
struct Room {
    /// conn id -> (user id, sender)
    members: HashMap<u64, (String, ConnTx)>,
    log: VecDeque<Logged>,
    next_seq: u64,
}

struct RelayState {
    rooms: HashMap<String, Room>,
    connections: HashMap<u64, ConnTx>,
    history_limit: usize,
}

impl RelayState {
    fn handle_frame(&mut self, conn_id: u64, tx: &ConnTx, text: &str) {
        let mut envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Connection {} sent a bad envelope: {}", conn_id, e);
                return;
            }
        };

        match &envelope.event {
            Event::JoinRoom { user_id, since } => {
                let room = self.rooms.entry(envelope.room_id.clone()).or_default();
                room.members.insert(conn_id, (user_id.clone(), tx.clone()));
                info!("{} joined {} ({} members)", user_id, envelope.room_id, room.members.len());
                if let Some(since) = since {
                    let missed: Vec<&String> = room
                        .log
                        .iter()
                        .filter(|logged| logged.replays_to(user_id, *since))
                        .map(|logged| &logged.frame)
                        .collect();
                    debug!("Replaying {} envelopes of {} to {}", missed.len(), envelope.room_id, user_id);
                    for frame in missed {
                        let _ = tx.send(Outgoing::Frame(frame.clone()));
                    }
                }
                return;
            }
            Event::LeaveRoom => {
                if let Some(room) = self.rooms.get_mut(&envelope.room_id) {
                    room.members.remove(&conn_id);
                }
                return;
            }
            _ => {}
        }

        let history_limit = self.history_limit;
        let Some(room) = self.rooms.get_mut(&envelope.room_id) else {
            warn!("Connection {} sent {} to unknown room {}", conn_id, envelope.kind(), envelope.room_id);
            return;
        };
        let sender = match room.members.get(&conn_id) {
            Some((user_id, _)) => user_id.clone(),
            None => {
                warn!("Connection {} is not a member of {}", conn_id, envelope.room_id);
                return;
            }
        };
        let include_sender = matches!(envelope.event, Event::Message(_));

        let ephemeral = matches!(envelope.event, Event::Typing { .. });
        if !ephemeral {
            room.next_seq += 1;
            envelope.seq = Some(room.next_seq);
        }
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not re-encode envelope: {}", e);
                return;
            }
        };
        if let Some(seq) = envelope.seq {
            room.log.push_back(Logged {
                seq,
                sender,
                echo: include_sender,
                frame: frame.clone(),
            });
            while room.log.len() > history_limit {
                room.log.pop_front();
            }
        }

        for (member, (_, member_tx)) in &room.members {
            if *member == conn_id && !include_sender {
                continue;
            }
            let _ = member_tx.send(Outgoing::Frame(frame.clone()));
        }
    }

    fn remove(&mut self, conn_id: u64) {
        self.connections.remove(&conn_id);
        for room in self.rooms.values_mut() {
            room.members.remove(&conn_id);
        }
    }
}

/// Control surface of a running relay
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
}

impl RelayHandle {
    /// Close every client socket. Room logs survive.
    pub async fn drop_connections(&self) -> usize {
        let mut state = self.state.lock().await;
        let count = state.connections.len();
        for (_, tx) in state.connections.drain() {
            let _ = tx.send(Outgoing::Close);
        }
        for room in state.rooms.values_mut() {
            room.members.clear();
        }
        info!("Dropped {} connections", count);
        count
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        let state = self.state.lock().await;
        state.rooms.get(room_id).map_or(0, |room| room.members.len())
    }

    pub async fn last_seq(&self, room_id: &str) -> u64 {
        let state = self.state.lock().await;
        state.rooms.get(room_id).map_or(0, |room| room.next_seq)
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<Mutex<RelayState>>,
    next_conn: AtomicU64,
}

impl Relay {
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(RelayState {
                rooms: HashMap::new(),
                connections: HashMap::new(),
                history_limit: config.history_limit.max(1),
            })),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle { state: self.state.clone() }
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<(), RelayError> {
        info!("Relay listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst);
            let state = self.state.clone();
            tokio::spawn(async move {
                debug!("Connection {} from {}", conn_id, peer);
                serve(state, conn_id, stream).await;
            });
        }
    }
}

async fn serve(state: Arc<Mutex<RelayState>>, conn_id: u64, stream: TcpStream) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Websocket handshake with connection {} failed: {}", conn_id, e);
            return;
        }
    };
    let (mut sink, mut frames) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut outgoing = UnboundedReceiverStream::new(rx);
    state.lock().await.connections.insert(conn_id, tx.clone());

    loop {
        tokio::select! {
            next = outgoing.next() => match next {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        debug!("Write to connection {} failed: {}", conn_id, e);
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    state.lock().await.handle_frame(conn_id, &tx, text.as_str());
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Connection {} errored: {}", conn_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.lock().await.remove(conn_id);
    debug!("Connection {} closed", conn_id);
}
