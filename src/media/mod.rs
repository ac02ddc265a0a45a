//! Media session control
//!
//! Codec and transport work belongs to the platform's WebRTC engine, which
//! is reached through [`MediaEngine`] and [`PeerConnection`]. This module
//! owns what the call layer needs on top of it: exactly one local stream and
//! one peer connection per call, track attachment, and teardown.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::realtime::protocol::{IceCandidate, SessionDescription};

pub mod loopback;

/// Local media could not be obtained
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Media engine failure: {0}")]
    Engine(String),
}

/// SDP or ICE could not be applied by the peer connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("Peer connection failure: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks raised by a peer connection, delivered over the channel handed
/// to [`MediaEngine::create_peer_connection`]
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
}

pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn is_live(&self) -> bool;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    fn connection_state(&self) -> PeerConnectionState;
    fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// May suspend indefinitely (permission prompt)
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    async fn create_peer_connection(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// A captured camera/microphone stream
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { id: id.into(), tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// The media half of one call: one stream, one peer connection
#[derive(Default)]
pub struct MediaSession {
    stream: Option<LocalStream>,
    peer: Option<Arc<dyn PeerConnection>>,
    attached: Vec<Arc<dyn MediaTrack>>,
}

impl fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSession")
            .field("stream", &self.stream.as_ref().map(LocalStream::id))
            .field("peer", &self.peer.is_some())
            .field("attached", &self.attached.len())
            .finish()
    }
}

impl MediaSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a freshly acquired stream and its peer connection.
    /// Anything previously held is torn down first.
    pub fn install(&mut self, stream: LocalStream, peer: Arc<dyn PeerConnection>) {
        if self.stream.is_some() || self.peer.is_some() {
            self.teardown();
        }
        self.stream = Some(stream);
        self.peer = Some(peer);
    }

    /// Add every not-yet-attached local track to the peer connection
    pub fn attach_local_tracks(&mut self) -> Result<usize, PeerError> {
        let (stream, peer) = match (&self.stream, &self.peer) {
            (Some(stream), Some(peer)) => (stream, peer),
            _ => return Err(PeerError::Closed),
        };

        let mut added = 0;
        for track in stream.tracks() {
            if self.attached.iter().any(|t| t.id() == track.id()) {
                continue;
            }
            peer.add_track(track.clone())?;
            self.attached.push(track.clone());
            added += 1;
        }
        debug!("Attached {} local tracks from stream {}", added, stream.id());
        Ok(added)
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.clone()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn attached_track_count(&self) -> usize {
        self.attached.len()
    }

    /// Stop each track, close the connection and drop every reference.
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("Stopping {} tracks of stream {}", stream.tracks().len(), stream.id());
            stream.stop_all();
        }
        for track in self.attached.drain(..) {
            track.stop();
        }
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.stream.is_none() && self.peer.is_none() && self.attached.is_empty()
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::{LoopbackEngine, LoopbackTrack};
    use super::*;

    async fn installed_session(engine: &LoopbackEngine) -> MediaSession {
        let stream = engine
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), tx)
            .await
            .unwrap();
        let mut session = MediaSession::new();
        session.install(stream, peer);
        session
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let engine = LoopbackEngine::new();
        let mut session = installed_session(&engine).await;

        assert_eq!(session.attach_local_tracks().unwrap(), 2);
        assert_eq!(session.attach_local_tracks().unwrap(), 0);
        assert_eq!(session.attached_track_count(), 2);
        assert_eq!(engine.peers()[0].attached_tracks(), 2);
    }

    #[tokio::test]
    async fn test_teardown_stops_tracks_and_closes_peer() {
        let engine = LoopbackEngine::new();
        let mut session = installed_session(&engine).await;
        session.attach_local_tracks().unwrap();

        session.teardown();
        assert!(session.is_torn_down());
        assert!(engine.tracks().iter().all(|t| !t.is_live()));
        assert!(engine.peers()[0].is_closed());
        assert_eq!(engine.peers()[0].connection_state(), PeerConnectionState::Closed);

        // second teardown is a no-op
        session.teardown();
        assert!(session.is_torn_down());
    }

    #[test]
    fn test_attach_without_peer_fails() {
        let mut session = MediaSession::new();
        assert_eq!(session.attach_local_tracks(), Err(PeerError::Closed));
    }

    #[test]
    fn test_local_stream_stop_all() {
        let audio = Arc::new(LoopbackTrack::new(TrackKind::Audio));
        let video = Arc::new(LoopbackTrack::new(TrackKind::Video));
        let stream = LocalStream::new("s1", vec![audio.clone(), video.clone()]);
        assert!(audio.is_live() && video.is_live());
        stream.stop_all();
        assert!(!audio.is_live() && !video.is_live());
    }
}
