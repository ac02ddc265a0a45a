// Common test utilities for integration tests
// Two sessions wired back to back in-process, a real relay on a free port,
// and helpers to wait for session events.
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use log::LevelFilter;
use tokio::sync::mpsc;
use tokio::time::timeout;

use huddle::config::ClientConfig;
use huddle::media::loopback::LoopbackEngine;
use huddle::models::{Conversation, ConversationKind, Identity};
use huddle::realtime::connection::ConnectionEvent;
use huddle::realtime::protocol::{Envelope, Event};
use huddle::realtime::{RealtimeSession, SessionEvent};
use huddle::relay::{Relay, RelayConfig, RelayHandle};
use huddle::store::MemoryStore;

static INIT_LOGGER: Once = Once::new();

const WAIT: Duration = Duration::from_secs(5);

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.typing_sweep_ms = 50;
    config.ring_timeout_secs = 30;
    config
}

pub fn conversation(id: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        kind: ConversationKind::Group,
        participants: vec!["u-a".to_string(), "u-b".to_string()],
        title: format!("{} chat", id),
        avatar: None,
        last_message_id: None,
        last_message_preview: None,
        unread: 0,
    }
}

pub async fn store_with(rooms: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    for room in rooms {
        store.insert_conversation(conversation(room)).await;
    }
    store
}

pub fn alice() -> Identity {
    Identity::new("u-a", "Alice")
}

pub fn bob() -> Identity {
    Identity::new("u-b", "Bob")
}

pub struct TestPeer {
    pub session: RealtimeSession,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub engine: Arc<LoopbackEngine>,
    /// Inject connection events as if they came off the socket
    pub inbound: mpsc::Sender<ConnectionEvent>,
}

/// Forward one side's outbound envelopes the way the relay would: chat
/// messages to everyone, signaling to the other side, membership nowhere
async fn bridge(
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    own: mpsc::Sender<ConnectionEvent>,
    other: mpsc::Sender<ConnectionEvent>,
) {
    while let Some(envelope) = outbound.recv().await {
        if envelope.event.is_membership() {
            continue;
        }
        if matches!(envelope.event, Event::Message(_)) {
            let _ = own.send(ConnectionEvent::Envelope(envelope.clone())).await;
        }
        let _ = other.send(ConnectionEvent::Envelope(envelope)).await;
    }
}

/// Alice and Bob, connected back to back, both seeing room1 and room2
pub async fn bridged_pair(
    config: &ClientConfig,
    engine_a: LoopbackEngine,
    engine_b: LoopbackEngine,
) -> (TestPeer, TestPeer) {
    setup_logging();
    let store = store_with(&["room1", "room2"]).await;

    let (out_a, out_a_rx) = mpsc::unbounded_channel();
    let (out_b, out_b_rx) = mpsc::unbounded_channel();
    let (in_a, in_a_rx) = mpsc::channel(256);
    let (in_b, in_b_rx) = mpsc::channel(256);

    let engine_a = Arc::new(engine_a);
    let engine_b = Arc::new(engine_b);
    let (session_a, events_a) =
        RealtimeSession::new(config, alice(), Arc::new(out_a), engine_a.clone(), Arc::new(store.clone()));
    let (session_b, events_b) =
        RealtimeSession::new(config, bob(), Arc::new(out_b), engine_b.clone(), Arc::new(store.clone()));
    session_a.load_conversations().await.unwrap();
    session_b.load_conversations().await.unwrap();

    tokio::spawn(bridge(out_a_rx, in_a.clone(), in_b.clone()));
    tokio::spawn(bridge(out_b_rx, in_b.clone(), in_a.clone()));
    tokio::spawn(session_a.clone().run(in_a_rx));
    tokio::spawn(session_b.clone().run(in_b_rx));

    (
        TestPeer { session: session_a, events: events_a, engine: engine_a, inbound: in_a },
        TestPeer { session: session_b, events: events_b, engine: engine_b, inbound: in_b },
    )
}

/// Start a relay on a free port and return its websocket URL
pub async fn start_relay() -> (String, RelayHandle) {
    setup_logging();
    let relay = Relay::bind(&RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        history_limit: 64,
    })
    .await
    .unwrap();
    let url = format!("ws://{}", relay.local_addr().unwrap());
    let handle = relay.handle();
    tokio::spawn(async move {
        let _ = relay.run().await;
    });
    (url, handle)
}

/// Wait for the first event matching `matches`, skipping the rest
pub async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, what: &str, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let found = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("Event stream closed while waiting for {}", what),
        Err(_) => panic!("Timed out waiting for {}", what),
    }
}

/// Poll `check` until it holds
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting until {}", what);
}

/// Like [`eventually`], for checks that have to await
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting until {}", what);
}

/// Everything already queued, without waiting
pub fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
