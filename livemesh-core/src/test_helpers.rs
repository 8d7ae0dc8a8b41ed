//! Test helpers and fixtures for livemesh-core tests
//!
//! `LoopbackConnection` follows the JSEP signaling-state rules without any
//! network: descriptions are plain text, local descriptions produce one
//! ICE candidate each, and every local track shows up as an `a=track` line
//! that the remote side turns into a `Track` event.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::connection::{
    ConnectionEvent, ConnectionFactory, MediaConnection, PeerConnectionState, PeerEventSender,
    SignalingState,
};
use crate::ice::IceServerList;
use crate::media::{
    LocalStream, LocalTrack, MediaSource, PlaybackSink, PlaybackSurface, RemoteTrack, TrackKind,
    REMOTE_PACKET_CHANNEL_CAPACITY,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::{PeerId, TrackId};
use crate::{Error, Result};

static DESCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(0);

struct LoopbackState {
    signaling: SignalingState,
    tracks: Vec<(TrackId, TrackKind)>,
    remote_descriptions: Vec<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    close_count: usize,
}

/// Failures shared between a factory and every connection it created
#[derive(Clone, Default)]
struct Faults {
    create_answer: Arc<AtomicUsize>,
    remote_answer: Arc<AtomicUsize>,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct LoopbackConnection {
    peer_id: PeerId,
    events: Option<PeerEventSender>,
    empty_sdp: bool,
    answer_gate: Option<Arc<Semaphore>>,
    faults: Faults,
    state: Mutex<LoopbackState>,
}

impl LoopbackConnection {
    #[must_use]
    pub fn new(peer_id: PeerId, events: Option<PeerEventSender>) -> Self {
        Self::with_options(peer_id, events, false, None, Faults::default())
    }

    fn with_options(
        peer_id: PeerId,
        events: Option<PeerEventSender>,
        empty_sdp: bool,
        answer_gate: Option<Arc<Semaphore>>,
        faults: Faults,
    ) -> Self {
        Self {
            peer_id,
            events,
            empty_sdp,
            answer_gate,
            faults,
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                tracks: Vec::new(),
                remote_descriptions: Vec::new(),
                remote_candidates: Vec::new(),
                close_count: 0,
            }),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.state.lock().tracks.iter().map(|(id, _)| id.clone()).collect()
    }

    #[must_use]
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            events.try_emit(event);
        }
    }

    fn describe(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(Error::Connection("connection closed".to_string()));
        }
        if self.empty_sdp {
            return Ok(SessionDescription {
                sdp_type,
                sdp: String::new(),
            });
        }

        let n = DESCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut sdp = format!("v=0\r\no=- {n} 0 IN IP4 127.0.0.1\r\ns=loopback\r\n");
        for (id, kind) in &state.tracks {
            let kind = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("a=track:{id}:{kind}\r\n"));
        }
        Ok(SessionDescription { sdp_type, sdp })
    }

    fn roll_back(&self, from: SignalingState) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling != from {
            return Err(Error::InvalidState(format!(
                "rollback in {:?}",
                state.signaling
            )));
        }
        state.signaling = SignalingState::Stable;
        Ok(())
    }

    fn local_candidate() -> IceCandidate {
        let n = DESCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host", 40000 + n % 1000),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn announce_remote_tracks(&self, description: &SessionDescription) {
        for line in description.sdp.lines() {
            let Some(rest) = line.strip_prefix("a=track:") else {
                continue;
            };
            let Some((id, kind)) = rest.split_once(':') else {
                continue;
            };
            let kind = if kind == "audio" {
                TrackKind::Audio
            } else {
                TrackKind::Video
            };
            let (_tx, packets) = tokio::sync::mpsc::channel(REMOTE_PACKET_CHANNEL_CAPACITY);
            self.emit(ConnectionEvent::Track(RemoteTrack {
                peer_id: self.peer_id.clone(),
                id: TrackId::from(id),
                kind,
                stream_id: "loopback".to_string(),
                packets,
            }));
        }
    }
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.state.lock().signaling;
        if !matches!(state, SignalingState::Stable | SignalingState::HaveLocalOffer) {
            return Err(Error::InvalidState(format!("create_offer in {state:?}")));
        }
        self.describe(SdpType::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if let Some(gate) = &self.answer_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Connection("answer gate closed".to_string()))?;
            permit.forget();
        }
        if Faults::take(&self.faults.create_answer) {
            return Err(Error::Connection("answer generation failed".to_string()));
        }
        let state = self.state.lock().signaling;
        if state != SignalingState::HaveRemoteOffer {
            return Err(Error::InvalidState(format!("create_answer in {state:?}")));
        }
        self.describe(SdpType::Answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp_type == SdpType::Rollback {
            return self.roll_back(SignalingState::HaveLocalOffer);
        }
        {
            let mut state = self.state.lock();
            state.signaling = match (state.signaling, description.sdp_type) {
                (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                    SignalingState::HaveLocalOffer
                }
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (s, t) => {
                    return Err(Error::InvalidState(format!(
                        "set_local_description({}) in {s:?}",
                        t.as_str()
                    )));
                }
            };
        }
        self.emit(ConnectionEvent::IceCandidate(Self::local_candidate()));
        if description.sdp_type == SdpType::Answer {
            self.emit(ConnectionEvent::StateChanged(PeerConnectionState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp_type == SdpType::Answer && Faults::take(&self.faults.remote_answer) {
            return Err(Error::MalformedSignalingPayload("unusable answer".to_string()));
        }
        if description.sdp_type == SdpType::Rollback {
            return self.roll_back(SignalingState::HaveRemoteOffer);
        }
        {
            let mut state = self.state.lock();
            state.signaling = match (state.signaling, description.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (s, t) => {
                    return Err(Error::InvalidState(format!(
                        "set_remote_description({}) in {s:?}",
                        t.as_str()
                    )));
                }
            };
            state.remote_descriptions.push(description.clone());
        }
        self.announce_remote_tracks(&description);
        if description.sdp_type == SdpType::Answer {
            self.emit(ConnectionEvent::StateChanged(PeerConnectionState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(Error::Connection("connection closed".to_string()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Err(Error::Connection("connection closed".to_string()));
            }
            state.tracks.push((track.id.clone(), track.kind));
        }
        self.emit(ConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.close_count += 1;
        Ok(())
    }
}

/// Hands out `LoopbackConnection`s and remembers them for inspection
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    connections: Arc<Mutex<Vec<Arc<LoopbackConnection>>>>,
    empty_sdp: Arc<AtomicBool>,
    answer_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    faults: Faults,
}

impl LoopbackFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections created from now on generate descriptions without SDP
    pub fn produce_empty_sdp(&self, enabled: bool) {
        self.empty_sdp.store(enabled, Ordering::Relaxed);
    }

    /// Make connections created from now on wait for a permit before
    /// producing an answer. Returns the semaphore to release them with.
    #[must_use]
    pub fn stall_answers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.answer_gate.lock() = Some(gate.clone());
        gate
    }

    /// Make the next `count` answers any connection generates fail
    pub fn fail_answers(&self, count: usize) {
        self.faults.create_answer.store(count, Ordering::Relaxed);
    }

    /// Make the next `count` remote answers any connection is given fail to apply
    pub fn reject_remote_answers(&self, count: usize) {
        self.faults.remote_answer.store(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.connections.lock().clone()
    }

    /// Most recent connection to `peer_id`
    #[must_use]
    pub fn connection(&self, peer_id: &PeerId) -> Option<Arc<LoopbackConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.peer_id() == peer_id)
            .cloned()
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn connect(
        &self,
        peer_id: &PeerId,
        _ice_servers: &IceServerList,
        events: PeerEventSender,
    ) -> Result<Arc<dyn MediaConnection>> {
        let connection = Arc::new(LoopbackConnection::with_options(
            peer_id.clone(),
            Some(events),
            self.empty_sdp.load(Ordering::Relaxed),
            self.answer_gate.lock().clone(),
            self.faults.clone(),
        ));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Playback surface that discards everything
pub struct NullPlayback;

struct NullSink;

impl PlaybackSink for NullSink {
    fn attach(&self, _track: RemoteTrack) {}
}

impl PlaybackSurface for NullPlayback {
    fn sink_for(&self, _peer_id: &PeerId) -> Option<Arc<dyn PlaybackSink>> {
        None
    }

    fn create_sink(&self, _peer_id: &PeerId) -> Arc<dyn PlaybackSink> {
        Arc::new(NullSink)
    }
}

/// Playback surface that records which tracks were attached for which peer
#[derive(Clone, Default)]
pub struct RecordingPlayback {
    sinks: Arc<Mutex<Vec<(PeerId, Arc<RecordingSink>)>>>,
}

#[derive(Default)]
pub struct RecordingSink {
    tracks: Mutex<Vec<TrackId>>,
}

impl PlaybackSink for RecordingSink {
    fn attach(&self, track: RemoteTrack) {
        self.tracks.lock().push(track.id);
    }
}

impl RecordingPlayback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    #[must_use]
    pub fn tracks_for(&self, peer_id: &PeerId) -> Vec<TrackId> {
        self.sinks
            .lock()
            .iter()
            .find(|(p, _)| p == peer_id)
            .map(|(_, sink)| sink.tracks.lock().clone())
            .unwrap_or_default()
    }
}

impl PlaybackSurface for RecordingPlayback {
    fn sink_for(&self, peer_id: &PeerId) -> Option<Arc<dyn PlaybackSink>> {
        self.sinks
            .lock()
            .iter()
            .find(|(p, _)| p == peer_id)
            .map(|(_, sink)| sink.clone() as Arc<dyn PlaybackSink>)
    }

    fn create_sink(&self, peer_id: &PeerId) -> Arc<dyn PlaybackSink> {
        let sink = Arc::new(RecordingSink::default());
        self.sinks.lock().push((peer_id.clone(), sink.clone()));
        sink
    }
}

/// Media source with one video and one audio track, or a denied one
#[derive(Clone, Default)]
pub struct FakeMediaSource {
    deny: bool,
}

impl FakeMediaSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn denied() -> Self {
        Self { deny: true }
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<LocalStream> {
        if self.deny {
            return Err(Error::MediaAccessDenied("camera permission denied".to_string()));
        }
        let stream_id = format!("stream-{}", nanoid::nanoid!(6));
        Ok(LocalStream::new(
            stream_id.clone(),
            vec![
                Arc::new(LocalTrack::new(TrackKind::Video, stream_id.as_str())),
                Arc::new(LocalTrack::new(TrackKind::Audio, stream_id.as_str())),
            ],
        ))
    }
}
