// Synthetic media engine
// Produces fake tracks and SDP so signaling can run on machines without
// cameras (the terminal client, CI). Peer connections report Connected as
// soon as both descriptions are in place.

use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::{
    LocalStream, MediaConstraints, MediaEngine, MediaError, MediaTrack, PeerConfig, PeerConnection,
    PeerConnectionState, PeerError, PeerEvent, TrackKind,
};
use crate::realtime::protocol::{IceCandidate, SdpType, SessionDescription};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            live: AtomicBool::new(true),
        }
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<Arc<dyn MediaTrack>>,
    applied: Vec<IceCandidate>,
    state: PeerConnectionState,
}

pub struct LoopbackPeer {
    id: String,
    state: Mutex<PeerState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    candidate_port: AtomicU32,
}

impl LoopbackPeer {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            state: Mutex::new(PeerState {
                local: None,
                remote: None,
                tracks: Vec::new(),
                applied: Vec::new(),
                state: PeerConnectionState::New,
            }),
            events,
            candidate_port: AtomicU32::new(50_000),
        }
    }

    pub fn attached_tracks(&self) -> usize {
        lock(&self.state).tracks.len()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).state == PeerConnectionState::Closed
    }

    /// Drop the path to the remote side as if ICE lost connectivity
    pub fn fail(&self) {
        let mut guard = lock(&self.state);
        if guard.state != PeerConnectionState::Closed {
            self.set_state(&mut guard, PeerConnectionState::Failed);
        }
    }

    fn render_sdp(&self, kinds: &[TrackKind]) -> String {
        let mut sdp = format!("v=0\r\no=huddle {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n", self.id);
        for (mid, kind) in kinds.iter().enumerate() {
            let media = match kind {
                TrackKind::Audio => "audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "video 9 UDP/TLS/RTP/SAVPF 96",
            };
            sdp.push_str(&format!("m={}\r\na=mid:{}\r\n", media, mid));
        }
        sdp
    }

    fn set_state(&self, guard: &mut PeerState, next: PeerConnectionState) {
        if guard.state != next {
            guard.state = next;
            let _ = self.events.send(PeerEvent::StateChanged(next));
        }
    }

    /// Both descriptions in place means negotiation is over
    fn maybe_connect(&self, guard: &mut PeerState) {
        if guard.local.is_some() && guard.remote.is_some() {
            self.set_state(guard, PeerConnectionState::Connecting);
            self.set_state(guard, PeerConnectionState::Connected);
        }
    }

    fn gather_candidates(&self) {
        for _ in 0..2 {
            let port = self.candidate_port.fetch_add(1, Ordering::SeqCst);
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                port, port
            ));
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        let mut guard = lock(&self.state);
        if guard.state == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        guard.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let guard = lock(&self.state);
        if guard.state == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        let kinds: Vec<TrackKind> = guard.tracks.iter().map(|t| t.kind()).collect();
        Ok(SessionDescription::offer(self.render_sdp(&kinds)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let guard = lock(&self.state);
        if guard.state == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        match &guard.remote {
            Some(remote) if remote.kind == SdpType::Offer => {}
            _ => return Err(PeerError::Sdp("cannot answer without a remote offer".to_string())),
        }
        let kinds: Vec<TrackKind> = guard.tracks.iter().map(|t| t.kind()).collect();
        Ok(SessionDescription::answer(self.render_sdp(&kinds)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        {
            let mut guard = lock(&self.state);
            if guard.state == PeerConnectionState::Closed {
                return Err(PeerError::Closed);
            }
            guard.local = Some(description);
            self.maybe_connect(&mut guard);
        }
        self.gather_candidates();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let mut guard = lock(&self.state);
        if guard.state == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if !description.sdp.starts_with("v=0") {
            return Err(PeerError::Sdp("missing version line".to_string()));
        }
        guard.remote = Some(description);
        self.maybe_connect(&mut guard);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut guard = lock(&self.state);
        if guard.state == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if guard.remote.is_none() {
            return Err(PeerError::Ice("remote description is not set".to_string()));
        }
        guard.applied.push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        lock(&self.state).state
    }

    fn close(&self) {
        let mut guard = lock(&self.state);
        self.set_state(&mut guard, PeerConnectionState::Closed);
    }
}

/// Handle that releases acquisitions held by [`LoopbackEngine::gated`]
#[derive(Clone)]
pub struct AcquireGate {
    permits: Arc<Semaphore>,
}

impl AcquireGate {
    pub fn release(&self) {
        self.permits.add_permits(1);
    }
}

#[derive(Default)]
pub struct LoopbackEngine {
    deny: Option<MediaError>,
    gate: Option<Arc<Semaphore>>,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition fails with `error`
    pub fn failing(error: MediaError) -> Self {
        Self {
            deny: Some(error),
            ..Self::default()
        }
    }

    /// Acquisitions suspend until the returned gate is released, like a
    /// permission prompt nobody has answered yet
    pub fn gated() -> (Self, AcquireGate) {
        let permits = Arc::new(Semaphore::new(0));
        let engine = Self {
            gate: Some(permits.clone()),
            ..Self::default()
        };
        (engine, AcquireGate { permits })
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        lock(&self.peers).clone()
    }

    pub fn tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        lock(&self.tracks).clone()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| MediaError::Engine(e.to_string()))?;
            permit.forget();
        }
        if let Some(error) = &self.deny {
            return Err(error.clone());
        }

        let mut created = Vec::new();
        if constraints.audio {
            created.push(Arc::new(LoopbackTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            created.push(Arc::new(LoopbackTrack::new(TrackKind::Video)));
        }
        if created.is_empty() {
            return Err(MediaError::DeviceUnavailable("no audio or video requested".to_string()));
        }

        lock(&self.tracks).extend(created.iter().cloned());
        let tracks: Vec<Arc<dyn MediaTrack>> = created
            .into_iter()
            .map(|t| t as Arc<dyn MediaTrack>)
            .collect();
        debug!("Loopback engine produced {} tracks", tracks.len());
        Ok(LocalStream::new(Uuid::new_v4().to_string(), tracks))
    }

    async fn create_peer_connection(
        &self,
        _config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(LoopbackPeer::new(events));
        lock(&self.peers).push(peer.clone());
        Ok(peer)
    }
}
