// Call signaling for huddle
// Offer/answer/ICE exchange and the call lifecycle per conversation:
// Idle -> Outgoing|Incoming -> Active -> Ended -> Idle.
//
// The table lock is never held across a media or SDP await. Each attempt
// carries an id; anything that resumes after its call ended finds a different
// (or no) attempt in the table and cleans up after itself.

use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::connection::{Outbound, TransportError};
use super::protocol::{Envelope, Event, IceCandidate, SessionDescription};
use super::SessionEvent;
use crate::media::{
    MediaConstraints, MediaEngine, MediaError, MediaSession, PeerConfig, PeerConnection,
    PeerConnectionState, PeerError, PeerEvent,
};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("No call in {0}")]
    NoCall(String),

    #[error("A call is already in progress in {0}")]
    AlreadyActive(String),

    #[error("Cannot {action} while the call is {state}")]
    InvalidState { action: &'static str, state: CallState },

    #[error("Call attempt was cancelled")]
    Cancelled,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Active,
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::Incoming => "incoming",
            CallState::Active => "active",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// We hung up
    LocalHangup,
    /// The other side sent video-call-end
    RemoteHangup,
    /// The other side turned our call down
    Rejected,
    /// We turned an incoming call down
    Declined,
    /// Nobody answered within the ring timeout
    Timeout,
    /// Media or negotiation failed
    Failed,
}

/// Read-only view of a call, for the UI and tests
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub attempt: u64,
    pub role: CallRole,
    pub state: CallState,
    pub peer_name: String,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub remote_applied: bool,
    pub queued_remote_candidates: usize,
    pub applied_candidates: usize,
    pub failed_candidates: usize,
    pub attached_tracks: usize,
}

struct CallSession {
    attempt: u64,
    role: CallRole,
    state: CallState,
    peer_name: String,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_applied: bool,
    /// Remote candidates waiting for the remote description
    pending_remote: Vec<IceCandidate>,
    /// Local candidates waiting for our offer/answer to go out
    pending_local: Vec<IceCandidate>,
    local_announced: bool,
    accepting: bool,
    applied_candidates: usize,
    failed_candidates: usize,
    media: MediaSession,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(attempt: u64, role: CallRole, state: CallState, peer_name: String) -> Self {
        Self {
            attempt,
            role,
            state,
            peer_name,
            local_description: None,
            remote_description: None,
            remote_applied: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
            local_announced: false,
            accepting: false,
            applied_candidates: 0,
            failed_candidates: 0,
            media: MediaSession::new(),
            ring_timer: None,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            attempt: self.attempt,
            role: self.role,
            state: self.state,
            peer_name: self.peer_name.clone(),
            local_description: self.local_description.clone(),
            remote_description: self.remote_description.clone(),
            remote_applied: self.remote_applied,
            queued_remote_candidates: self.pending_remote.len(),
            applied_candidates: self.applied_candidates,
            failed_candidates: self.failed_candidates,
            attached_tracks: self.media.attached_track_count(),
        }
    }

    /// What the other side should hear when we end this call ourselves
    fn farewell(&self) -> Option<Event> {
        match self.role {
            CallRole::Caller if self.local_announced => Some(Event::CallEnd),
            CallRole::Caller => None,
            CallRole::Callee if self.state == CallState::Incoming && !self.local_announced => {
                Some(Event::CallReject)
            }
            CallRole::Callee => Some(Event::CallEnd),
        }
    }
}

#[derive(Default)]
struct CallTable {
    calls: HashMap<String, CallSession>,
    /// Candidates that arrived before any call existed in the room
    orphans: HashMap<String, VecDeque<IceCandidate>>,
}

impl CallTable {
    fn current_mut(&mut self, room_id: &str, attempt: u64) -> Option<&mut CallSession> {
        self.calls.get_mut(room_id).filter(|s| s.attempt == attempt)
    }
}

#[derive(Clone)]
pub struct CallController {
    local_name: String,
    engine: Arc<dyn MediaEngine>,
    outbound: Arc<dyn Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    constraints: MediaConstraints,
    peer_config: PeerConfig,
    ring_timeout: Duration,
    orphan_limit: usize,
    table: Arc<Mutex<CallTable>>,
    next_attempt: Arc<AtomicU64>,
}

pub struct CallSettings {
    pub constraints: MediaConstraints,
    pub peer_config: PeerConfig,
    pub ring_timeout: Duration,
    pub orphan_limit: usize,
}

impl CallController {
    pub fn new(
        local_name: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        outbound: Arc<dyn Outbound>,
        events: mpsc::UnboundedSender<SessionEvent>,
        settings: CallSettings,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            engine,
            outbound,
            events,
            constraints: settings.constraints,
            peer_config: settings.peer_config,
            ring_timeout: settings.ring_timeout,
            orphan_limit: settings.orphan_limit.max(1),
            table: Arc::new(Mutex::new(CallTable::default())),
            next_attempt: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn state(&self, room_id: &str) -> CallState {
        let table = self.table.lock().await;
        table.calls.get(room_id).map_or(CallState::Idle, |s| s.state)
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<CallSnapshot> {
        self.table.lock().await.calls.get(room_id).map(CallSession::snapshot)
    }

    pub async fn orphan_count(&self, room_id: &str) -> usize {
        self.table.lock().await.orphans.get(room_id).map_or(0, VecDeque::len)
    }

    // ---- local actions ----

    /// Place a call: media, peer connection, tracks, offer. `peer_name` is
    /// what the UI shows for the far end while ringing.
    pub async fn start_call(&self, room_id: &str, peer_name: &str) -> Result<(), CallError> {
        let attempt = {
            let mut table = self.table.lock().await;
            if table.calls.contains_key(room_id) {
                return Err(CallError::AlreadyActive(room_id.to_string()));
            }
            if let Some(stale) = table.orphans.remove(room_id) {
                debug!("Discarding {} stale candidates for {}", stale.len(), room_id);
            }
            let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
            table.calls.insert(
                room_id.to_string(),
                CallSession::new(attempt, CallRole::Caller, CallState::Outgoing, peer_name.to_string()),
            );
            attempt
        };
        info!("Starting call in {} (attempt {})", room_id, attempt);
        self.emit(SessionEvent::CallStateChanged {
            room_id: room_id.to_string(),
            state: CallState::Outgoing,
        });

        match self.place_call(room_id, attempt).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort_attempt(room_id, attempt, e).await),
        }
    }

    async fn place_call(&self, room_id: &str, attempt: u64) -> Result<(), CallError> {
        let peer = self.prepare_media(room_id, attempt).await?;

        {
            let mut table = self.table.lock().await;
            let session = table.current_mut(room_id, attempt).ok_or(CallError::Cancelled)?;
            session.media.attach_local_tracks()?;
        }

        let offer = peer.create_offer().await?;
        self.ensure_current(room_id, attempt).await?;
        peer.set_local_description(offer.clone()).await?;

        let mut table = self.table.lock().await;
        let session = table.current_mut(room_id, attempt).ok_or(CallError::Cancelled)?;
        session.local_description = Some(offer.clone());
        self.outbound.send(Envelope::new(
            room_id,
            Event::CallOffer { offer, caller_name: self.local_name.clone() },
        ))?;
        session.local_announced = true;
        self.flush_local_candidates(room_id, session);
        session.ring_timer = Some(self.arm_ring_timer(room_id, attempt));
        info!("Offer sent in {}, ringing", room_id);
        Ok(())
    }

    /// Answer the incoming call: media, peer connection, remote offer,
    /// tracks, queued candidates, answer
    pub async fn accept_call(&self, room_id: &str) -> Result<(), CallError> {
        let (attempt, offer) = {
            let mut table = self.table.lock().await;
            let session = table
                .calls
                .get_mut(room_id)
                .ok_or_else(|| CallError::NoCall(room_id.to_string()))?;
            if session.state != CallState::Incoming || session.accepting {
                return Err(CallError::InvalidState { action: "accept", state: session.state });
            }
            let offer = session
                .remote_description
                .clone()
                .ok_or_else(|| CallError::NoCall(room_id.to_string()))?;
            session.accepting = true;
            (session.attempt, offer)
        };
        info!("Accepting call in {} (attempt {})", room_id, attempt);

        match self.answer_call(room_id, attempt, offer).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort_attempt(room_id, attempt, e).await),
        }
    }

    async fn answer_call(&self, room_id: &str, attempt: u64, offer: SessionDescription) -> Result<(), CallError> {
        let peer = self.prepare_media(room_id, attempt).await?;

        peer.set_remote_description(offer).await?;
        let queued = {
            let mut table = self.table.lock().await;
            let session = table.current_mut(room_id, attempt).ok_or(CallError::Cancelled)?;
            session.remote_applied = true;
            session.media.attach_local_tracks()?;
            std::mem::take(&mut session.pending_remote)
        };
        self.apply_candidates(room_id, attempt, &peer, queued).await;

        let answer = peer.create_answer().await?;
        self.ensure_current(room_id, attempt).await?;
        peer.set_local_description(answer.clone()).await?;

        {
            let mut table = self.table.lock().await;
            let session = table.current_mut(room_id, attempt).ok_or(CallError::Cancelled)?;
            session.local_description = Some(answer.clone());
            self.outbound.send(Envelope::new(room_id, Event::CallAnswer { answer }))?;
            session.local_announced = true;
            session.state = CallState::Active;
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            self.flush_local_candidates(room_id, session);
        }
        info!("Call in {} is active", room_id);
        self.emit(SessionEvent::CallStateChanged {
            room_id: room_id.to_string(),
            state: CallState::Active,
        });
        Ok(())
    }

    pub async fn reject_call(&self, room_id: &str) -> Result<(), CallError> {
        let session = {
            let mut table = self.table.lock().await;
            let session = table
                .calls
                .get(room_id)
                .ok_or_else(|| CallError::NoCall(room_id.to_string()))?;
            if session.state != CallState::Incoming || session.accepting {
                return Err(CallError::InvalidState { action: "reject", state: session.state });
            }
            table.calls.remove(room_id)
        };
        if let Some(session) = session {
            self.notify(room_id, Event::CallReject);
            self.finish(room_id, session, EndReason::Declined);
        }
        Ok(())
    }

    pub async fn hang_up(&self, room_id: &str) -> Result<(), CallError> {
        let session = self
            .table
            .lock()
            .await
            .calls
            .remove(room_id)
            .ok_or_else(|| CallError::NoCall(room_id.to_string()))?;

        let reason = if session.state == CallState::Incoming && !session.accepting {
            EndReason::Declined
        } else {
            EndReason::LocalHangup
        };
        if let Some(event) = session.farewell() {
            self.notify(room_id, event);
        }
        self.finish(room_id, session, reason);
        Ok(())
    }

    // ---- remote events ----

    /// `video-call-offer`. Only surfaced for the conversation on screen.
    pub async fn handle_offer(&self, room_id: &str, offer: SessionDescription, caller_name: &str, room_is_active: bool) {
        if !room_is_active {
            warn!("Ignoring call offer from {} in inactive conversation {}", caller_name, room_id);
            return;
        }

        let attempt = {
            let mut table = self.table.lock().await;
            if let Some(existing) = table.calls.get(room_id) {
                warn!(
                    "Ignoring call offer from {} in {}: call already {}",
                    caller_name, room_id, existing.state
                );
                return;
            }
            let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
            let mut session = CallSession::new(attempt, CallRole::Callee, CallState::Incoming, caller_name.to_string());
            session.remote_description = Some(offer);
            if let Some(orphans) = table.orphans.remove(room_id) {
                debug!("Adopting {} early candidates for {}", orphans.len(), room_id);
                session.pending_remote.extend(orphans);
            }
            session.ring_timer = Some(self.arm_ring_timer(room_id, attempt));
            table.calls.insert(room_id.to_string(), session);
            attempt
        };

        info!("Incoming call from {} in {} (attempt {})", caller_name, room_id, attempt);
        self.emit(SessionEvent::IncomingCall {
            room_id: room_id.to_string(),
            caller_name: caller_name.to_string(),
        });
    }

    /// `video-call-answer` for our outgoing call
    pub async fn handle_answer(&self, room_id: &str, answer: SessionDescription) {
        let (attempt, peer) = {
            let mut table = self.table.lock().await;
            let session = match table.calls.get_mut(room_id) {
                Some(session) if session.role == CallRole::Caller && session.state == CallState::Outgoing => session,
                Some(session) => {
                    warn!("Ignoring answer in {}: call is {}", room_id, session.state);
                    return;
                }
                None => {
                    warn!("Ignoring answer in {}: no call", room_id);
                    return;
                }
            };
            let peer = match session.media.peer() {
                Some(peer) if session.local_announced => peer,
                _ => {
                    warn!("Ignoring answer in {}: offer not sent yet", room_id);
                    return;
                }
            };
            session.remote_description = Some(answer.clone());
            (session.attempt, peer)
        };

        if let Err(e) = peer.set_remote_description(answer).await {
            self.abort_attempt(room_id, attempt, e.into()).await;
            return;
        }

        let queued = {
            let mut table = self.table.lock().await;
            let Some(session) = table.current_mut(room_id, attempt) else {
                return;
            };
            session.remote_applied = true;
            session.state = CallState::Active;
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            std::mem::take(&mut session.pending_remote)
        };
        info!("Call in {} is active", room_id);
        self.emit(SessionEvent::CallStateChanged {
            room_id: room_id.to_string(),
            state: CallState::Active,
        });
        self.apply_candidates(room_id, attempt, &peer, queued).await;
    }

    /// `ice-candidate`: apply now, or queue until the remote description is set
    pub async fn handle_remote_candidate(&self, room_id: &str, candidate: IceCandidate) {
        let ready = {
            let mut table = self.table.lock().await;
            match table.calls.get_mut(room_id) {
                Some(session) => match session.media.peer() {
                    Some(peer) if session.remote_applied => Some((session.attempt, peer)),
                    _ => {
                        session.pending_remote.push(candidate.clone());
                        debug!("Queued remote candidate for {} ({} waiting)", room_id, session.pending_remote.len());
                        None
                    }
                },
                None => {
                    let limit = self.orphan_limit;
                    let queue = table.orphans.entry(room_id.to_string()).or_default();
                    if queue.len() >= limit {
                        warn!("Orphan candidate queue for {} is full, dropping the oldest", room_id);
                        queue.pop_front();
                    }
                    queue.push_back(candidate.clone());
                    debug!("Holding candidate for {} until an offer arrives", room_id);
                    None
                }
            }
        };

        if let Some((attempt, peer)) = ready {
            self.apply_candidates(room_id, attempt, &peer, vec![candidate]).await;
        }
    }

    /// `video-call-end` or `video-call-reject` from the other side
    pub async fn handle_remote_end(&self, room_id: &str, reason: EndReason) {
        let session = {
            let mut table = self.table.lock().await;
            table.orphans.remove(room_id);
            table.calls.remove(room_id)
        };
        match session {
            Some(session) => self.finish(room_id, session, reason),
            None => debug!("Remote ended a call in {} that we do not have", room_id),
        }
    }

    /// End every call, telling the other sides
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, CallSession)> = {
            let mut table = self.table.lock().await;
            table.orphans.clear();
            table.calls.drain().collect()
        };
        for (room_id, session) in sessions {
            if let Some(event) = session.farewell() {
                self.notify(&room_id, event);
            }
            self.finish(&room_id, session, EndReason::LocalHangup);
        }
    }

    // ---- internals ----

    /// Acquire the stream and create the peer connection for `attempt`.
    /// If the call ended while we were suspended, whatever we obtained is
    /// released here and never attached.
    async fn prepare_media(&self, room_id: &str, attempt: u64) -> Result<Arc<dyn PeerConnection>, CallError> {
        let stream = self.engine.acquire_local_media(&self.constraints).await?;
        if !self.is_current(room_id, attempt).await {
            info!("Call in {} ended while acquiring media, releasing stream", room_id);
            stream.stop_all();
            return Err(CallError::Cancelled);
        }

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = match self.engine.create_peer_connection(&self.peer_config, peer_tx).await {
            Ok(peer) => peer,
            Err(e) => {
                stream.stop_all();
                return Err(e.into());
            }
        };

        let mut table = self.table.lock().await;
        match table.current_mut(room_id, attempt) {
            Some(session) => {
                session.media.install(stream, peer.clone());
            }
            None => {
                info!("Call in {} ended while creating the peer connection", room_id);
                stream.stop_all();
                peer.close();
                return Err(CallError::Cancelled);
            }
        }
        drop(table);

        self.spawn_peer_events(room_id, attempt, peer_rx);
        Ok(peer)
    }

    fn spawn_peer_events(&self, room_id: &str, attempt: u64, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let this = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        let mut table = this.table.lock().await;
                        let Some(session) = table.current_mut(&room_id, attempt) else {
                            break;
                        };
                        if session.local_announced {
                            this.notify(&room_id, Event::IceCandidate { candidate });
                        } else {
                            session.pending_local.push(candidate);
                        }
                    }
                    PeerEvent::StateChanged(state) => {
                        debug!("Peer connection in {} is {:?}", room_id, state);
                        this.emit(SessionEvent::PeerStateChanged { room_id: room_id.clone(), state });
                        match state {
                            PeerConnectionState::Failed => {
                                let err = PeerError::Connection("ICE negotiation failed".to_string());
                                this.abort_attempt(&room_id, attempt, err.into()).await;
                                break;
                            }
                            PeerConnectionState::Closed => break,
                            _ => {}
                        }
                    }
                }
            }
            debug!("Peer event forwarder for {} (attempt {}) stopped", room_id, attempt);
        });
    }

    fn flush_local_candidates(&self, room_id: &str, session: &mut CallSession) {
        for candidate in session.pending_local.drain(..) {
            self.notify(room_id, Event::IceCandidate { candidate });
        }
    }

    async fn apply_candidates(
        &self,
        room_id: &str,
        attempt: u64,
        peer: &Arc<dyn PeerConnection>,
        candidates: Vec<IceCandidate>,
    ) {
        if candidates.is_empty() {
            return;
        }
        let mut applied = 0;
        let mut failed = 0;
        for candidate in candidates {
            match peer.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Failed to apply ICE candidate in {}: {}", room_id, e);
                    failed += 1;
                }
            }
        }
        debug!("Applied {} candidates in {} ({} failed)", applied, room_id, failed);
        let mut table = self.table.lock().await;
        if let Some(session) = table.current_mut(room_id, attempt) {
            session.applied_candidates += applied;
            session.failed_candidates += failed;
        }
    }

    fn arm_ring_timer(&self, room_id: &str, attempt: u64) -> JoinHandle<()> {
        let this = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.ring_timeout).await;
            this.ring_expired(&room_id, attempt).await;
        })
    }

    async fn ring_expired(&self, room_id: &str, attempt: u64) {
        let session = {
            let mut table = self.table.lock().await;
            match table.current_mut(room_id, attempt) {
                Some(session) if matches!(session.state, CallState::Outgoing | CallState::Incoming) && !session.accepting => {
                    // This is the timer's own task; dropping the handle is enough
                    session.ring_timer = None;
                }
                _ => return,
            }
            table.calls.remove(room_id)
        };
        if let Some(session) = session {
            info!("Call in {} was not answered in {:?}", room_id, self.ring_timeout);
            if let Some(event) = session.farewell() {
                self.notify(room_id, event);
            }
            self.finish(room_id, session, EndReason::Timeout);
        }
    }

    async fn is_current(&self, room_id: &str, attempt: u64) -> bool {
        self.table.lock().await.current_mut(room_id, attempt).is_some()
    }

    async fn ensure_current(&self, room_id: &str, attempt: u64) -> Result<(), CallError> {
        if self.is_current(room_id, attempt).await {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    /// Tear down a failed attempt if it is still the live one. Returns the
    /// error to hand back to the caller; errors from stale attempts become
    /// `Cancelled`.
    async fn abort_attempt(&self, room_id: &str, attempt: u64, err: CallError) -> CallError {
        if matches!(err, CallError::Cancelled) {
            return err;
        }
        let session = {
            let mut table = self.table.lock().await;
            if table.current_mut(room_id, attempt).is_none() {
                debug!("Ignoring failure of finished attempt {} in {}: {}", attempt, room_id, err);
                return CallError::Cancelled;
            }
            table.calls.remove(room_id)
        };
        let Some(session) = session else {
            return CallError::Cancelled;
        };

        error!("Call in {} failed: {}", room_id, err);
        let notice = match session.role {
            CallRole::Caller if session.local_announced => Some(Event::CallEnd),
            CallRole::Caller => None,
            // Once our answer is out the caller is in a call, not ringing
            CallRole::Callee if session.local_announced => Some(Event::CallEnd),
            CallRole::Callee => Some(Event::CallReject),
        };
        if let Some(event) = notice {
            self.notify(room_id, event);
        }
        self.emit(SessionEvent::CallFailed {
            room_id: room_id.to_string(),
            error: err.to_string(),
        });
        self.finish(room_id, session, EndReason::Failed);
        err
    }

    fn finish(&self, room_id: &str, mut session: CallSession, reason: EndReason) {
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        info!("Call in {} {} -> {} ({:?})", room_id, session.state, CallState::Ended, reason);
        session.state = CallState::Ended;
        session.media.teardown();
        self.emit(SessionEvent::CallEnded {
            room_id: room_id.to_string(),
            reason,
        });
    }

    fn notify(&self, room_id: &str, event: Event) {
        let kind = event.kind();
        if let Err(e) = self.outbound.send(Envelope::new(room_id, event)) {
            warn!("Could not send {} for {}: {}", kind, room_id, e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use crate::media::loopback::LoopbackEngine;

    struct Harness {
        calls: CallController,
        engine: Arc<LoopbackEngine>,
        sent: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness_with(engine: LoopbackEngine, ring_timeout: Duration) -> Harness {
        let engine = Arc::new(engine);
        let (out_tx, sent) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let calls = CallController::new(
            "Alice",
            engine.clone(),
            Arc::new(out_tx),
            event_tx,
            CallSettings {
                constraints: MediaConstraints::default(),
                peer_config: PeerConfig::default(),
                ring_timeout,
                orphan_limit: 3,
            },
        );
        Harness { calls, engine, sent, events }
    }

    fn harness() -> Harness {
        harness_with(LoopbackEngine::new(), Duration::from_secs(45))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.event);
        }
        out
    }

    /// Let spawned forwarders catch up
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\no=remote 1 2 IN IP4 127.0.0.1\r\n")
    }

    #[tokio::test]
    async fn test_start_call_sends_offer_then_candidates() {
        let mut h = harness();
        h.calls.start_call("room1", "Bob").await.unwrap();
        assert_eq!(h.calls.state("room1").await, CallState::Outgoing);
        assert_eq!(h.calls.snapshot("room1").await.unwrap().peer_name, "Bob");

        let peer = &h.engine.peers()[0];
        assert_eq!(peer.attached_tracks(), 2);

        // candidates gathered before the offer went out are flushed after it
        settle().await;
        let sent = drain(&mut h.sent);
        assert!(matches!(&sent[0], Event::CallOffer { caller_name, .. } if caller_name == "Alice"));
        assert_eq!(sent.iter().filter(|e| matches!(e, Event::IceCandidate { .. })).count(), 2);
    }

    #[tokio::test]
    async fn test_second_call_in_room_is_refused() {
        let h = harness();
        h.calls.start_call("room1", "Bob").await.unwrap();
        assert!(matches!(h.calls.start_call("room1", "Bob").await, Err(CallError::AlreadyActive(_))));
    }

    #[tokio::test]
    async fn test_offer_for_inactive_room_is_ignored() {
        let mut h = harness();
        h.calls.handle_offer("room1", remote_offer(), "Bob", false).await;
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incoming_call_surfaces_caller_name() {
        let mut h = harness();
        h.calls.handle_offer("room1", remote_offer(), "Bob", true).await;
        assert_eq!(h.calls.state("room1").await, CallState::Incoming);
        assert_eq!(
            h.events.try_recv().unwrap(),
            SessionEvent::IncomingCall { room_id: "room1".to_string(), caller_name: "Bob".to_string() }
        );
        // a second offer while ringing is dropped
        h.calls.handle_offer("room1", remote_offer(), "Carol", true).await;
        assert_eq!(h.calls.snapshot("room1").await.unwrap().peer_name, "Bob");
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let mut h = harness();
        h.calls.handle_offer("room1", remote_offer(), "Bob", true).await;
        h.calls.handle_remote_candidate("room1", IceCandidate::new("candidate:1")).await;
        h.calls.handle_remote_candidate("room1", IceCandidate::new("candidate:2")).await;
        assert_eq!(h.calls.snapshot("room1").await.unwrap().queued_remote_candidates, 2);

        h.calls.accept_call("room1").await.unwrap();
        let snapshot = h.calls.snapshot("room1").await.unwrap();
        assert_eq!(snapshot.state, CallState::Active);
        assert_eq!(snapshot.queued_remote_candidates, 0);
        assert_eq!(snapshot.applied_candidates, 2);
        assert_eq!(h.engine.peers()[0].applied_candidates().len(), 2);

        // later candidates are applied directly
        h.calls.handle_remote_candidate("room1", IceCandidate::new("candidate:3")).await;
        assert_eq!(h.engine.peers()[0].applied_candidates().len(), 3);

        let sent = drain(&mut h.sent);
        assert!(matches!(sent[0], Event::CallAnswer { .. }));
    }

    #[tokio::test]
    async fn test_orphan_candidates_are_bounded_and_adopted() {
        let h = harness();
        for i in 0..5 {
            h.calls
                .handle_remote_candidate("room1", IceCandidate::new(format!("candidate:{}", i)))
                .await;
        }
        assert_eq!(h.calls.orphan_count("room1").await, 3);

        h.calls.handle_offer("room1", remote_offer(), "Bob", true).await;
        assert_eq!(h.calls.orphan_count("room1").await, 0);
        assert_eq!(h.calls.snapshot("room1").await.unwrap().queued_remote_candidates, 3);

        h.calls.accept_call("room1").await.unwrap();
        let applied: Vec<String> = h.engine.peers()[0]
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:2", "candidate:3", "candidate:4"]);
    }

    #[tokio::test]
    async fn test_reject_sends_reject_and_returns_to_idle() {
        let mut h = harness();
        h.calls.handle_offer("room1", remote_offer(), "Bob", true).await;
        h.calls.reject_call("room1").await.unwrap();
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert_eq!(drain(&mut h.sent), vec![Event::CallReject]);
        assert!(h.engine.peers().is_empty());
    }

    #[tokio::test]
    async fn test_hang_up_tears_down_media() {
        let mut h = harness();
        h.calls.start_call("room1", "Bob").await.unwrap();
        settle().await;
        drain(&mut h.sent);

        h.calls.hang_up("room1").await.unwrap();
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert!(h.engine.tracks().iter().all(|t| !t.is_live()));
        assert!(h.engine.peers()[0].is_closed());
        assert_eq!(drain(&mut h.sent), vec![Event::CallEnd]);
        assert!(matches!(h.calls.hang_up("room1").await, Err(CallError::NoCall(_))));
    }

    #[tokio::test]
    async fn test_remote_end_returns_to_idle_without_notifying() {
        let mut h = harness();
        h.calls.start_call("room1", "Bob").await.unwrap();
        settle().await;
        drain(&mut h.sent);

        h.calls.handle_remote_end("room1", EndReason::Rejected).await;
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert!(drain(&mut h.sent).is_empty());
        assert!(h.engine.peers()[0].is_closed());
    }

    #[tokio::test]
    async fn test_media_failure_on_accept_rejects() {
        let mut h = harness_with(
            LoopbackEngine::failing(MediaError::PermissionDenied("camera".to_string())),
            Duration::from_secs(45),
        );
        h.calls.handle_offer("room1", remote_offer(), "Bob", true).await;
        let err = h.calls.accept_call("room1").await.unwrap_err();
        assert!(matches!(err, CallError::Media(MediaError::PermissionDenied(_))));
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert_eq!(drain(&mut h.sent), vec![Event::CallReject]);

        let mut failed = false;
        while let Ok(event) = h.events.try_recv() {
            failed |= matches!(event, SessionEvent::CallFailed { .. });
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_connection_failure_after_answer_ends_the_call() {
        let mut h = harness();
        h.calls.handle_offer("room1", remote_offer(), "Bob", true).await;
        h.calls.accept_call("room1").await.unwrap();
        settle().await;
        let sent = drain(&mut h.sent);
        assert!(matches!(sent[0], Event::CallAnswer { .. }));

        h.engine.peers()[0].fail();
        for _ in 0..100 {
            if h.calls.state("room1").await == CallState::Idle {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        let notices: Vec<Event> = drain(&mut h.sent)
            .into_iter()
            .filter(|e| !matches!(e, Event::IceCandidate { .. }))
            .collect();
        assert_eq!(notices, vec![Event::CallEnd]);

        let mut failed = false;
        let mut ended = None;
        while let Ok(event) = h.events.try_recv() {
            match event {
                SessionEvent::CallFailed { .. } => failed = true,
                SessionEvent::CallEnded { reason, .. } => ended = Some(reason),
                _ => {}
            }
        }
        assert!(failed);
        assert_eq!(ended, Some(EndReason::Failed));
    }

    #[tokio::test]
    async fn test_media_failure_before_offer_is_silent_on_the_wire() {
        let mut h = harness_with(
            LoopbackEngine::failing(MediaError::DeviceUnavailable("no camera".to_string())),
            Duration::from_secs(45),
        );
        assert!(h.calls.start_call("room1", "Bob").await.is_err());
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert!(drain(&mut h.sent).is_empty());
    }

    #[tokio::test]
    async fn test_answer_with_bad_sdp_fails_the_call() {
        let mut h = harness();
        h.calls.start_call("room1", "Bob").await.unwrap();
        settle().await;
        drain(&mut h.sent);

        h.calls.handle_answer("room1", SessionDescription::answer("garbage")).await;
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert_eq!(drain(&mut h.sent), vec![Event::CallEnd]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let mut h = harness_with(LoopbackEngine::new(), Duration::from_secs(10));
        h.calls.start_call("room1", "Bob").await.unwrap();
        settle().await;
        drain(&mut h.sent);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
        assert_eq!(drain(&mut h.sent), vec![Event::CallEnd]);

        let mut reason = None;
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::CallEnded { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(EndReason::Timeout));
    }

    #[tokio::test]
    async fn test_hang_up_during_pending_acquisition() {
        let (engine, gate) = LoopbackEngine::gated();
        let h = harness_with(engine, Duration::from_secs(45));

        let pending = {
            let calls = h.calls.clone();
            tokio::spawn(async move { calls.start_call("room1", "Bob").await })
        };
        while h.calls.state("room1").await != CallState::Outgoing {
            tokio::task::yield_now().await;
        }

        h.calls.hang_up("room1").await.unwrap();
        gate.release();

        assert!(matches!(pending.await.unwrap(), Err(CallError::Cancelled)));
        assert_eq!(h.engine.tracks().len(), 2);
        assert!(h.engine.tracks().iter().all(|t| !t.is_live()));
        assert!(h.engine.peers().is_empty());
        assert_eq!(h.calls.state("room1").await, CallState::Idle);
    }
}
