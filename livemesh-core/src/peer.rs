//! Peer session management
//!
//! One `PeerSession` per remote participant, each owning its media
//! connection exclusively. The manager creates and destroys sessions, fans
//! local tracks out to them and routes remote tracks to playback.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionFactory, MediaConnection, PeerEvent, PeerEventSender, SignalingState};
use crate::ice::IceServerList;
use crate::media::{LocalStream, PlaybackSurface, RemoteTrack};
use crate::signaling::IceCandidate;
use crate::types::PeerId;
use crate::{Error, Result};

/// Which side starts the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Progress of the current negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    /// Local offer published, waiting for the answer
    OfferPending,
    /// Remote offer applied, answer being produced
    AnswerPending,
    Stable,
}

struct Negotiation {
    state: NegotiationState,
    pending_offer_id: Option<String>,
    offer_started_at: Option<Instant>,
    remote_session: Option<String>,
    local_candidates: Vec<IceCandidate>,
    applied_candidates: HashSet<IceCandidate>,
    last_activity: DateTime<Utc>,
}

/// A remote participant and the connection to it
pub struct PeerSession {
    pub peer_id: PeerId,
    role: Role,
    connection: Arc<dyn MediaConnection>,
    negotiation_in_flight: AtomicBool,
    negotiation: Mutex<Negotiation>,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, role: Role, connection: Arc<dyn MediaConnection>) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            role,
            connection,
            negotiation_in_flight: AtomicBool::new(false),
            negotiation: Mutex::new(Negotiation {
                state: NegotiationState::Idle,
                pending_offer_id: None,
                offer_started_at: None,
                remote_session: None,
                local_candidates: Vec::new(),
                applied_candidates: HashSet::new(),
                last_activity: now,
            }),
            closed: AtomicBool::new(false),
            created_at: now,
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    /// Claim the negotiation guard. Returns false if a round is already running.
    pub fn try_begin_negotiation(&self) -> bool {
        self.negotiation_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_negotiation(&self) {
        self.negotiation_in_flight.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_negotiating(&self) -> bool {
        self.negotiation_in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.lock().state
    }

    pub fn set_negotiation_state(&self, state: NegotiationState) {
        let mut n = self.negotiation.lock();
        n.state = state;
        n.last_activity = Utc::now();
        if state != NegotiationState::OfferPending {
            n.pending_offer_id = None;
            n.offer_started_at = None;
        }
    }

    /// Record the outstanding local offer
    pub fn begin_offer(&self, offer_id: impl Into<String>) {
        let mut n = self.negotiation.lock();
        n.state = NegotiationState::OfferPending;
        n.pending_offer_id = Some(offer_id.into());
        n.offer_started_at = Some(Instant::now());
        n.last_activity = Utc::now();
    }

    #[must_use]
    pub fn pending_offer_id(&self) -> Option<String> {
        self.negotiation.lock().pending_offer_id.clone()
    }

    /// Whether the outstanding offer has waited longer than `timeout`
    #[must_use]
    pub fn offer_expired(&self, timeout: Duration) -> bool {
        let n = self.negotiation.lock();
        n.state == NegotiationState::OfferPending
            && n.offer_started_at.is_some_and(|t| t.elapsed() >= timeout)
    }

    /// Session id of the remote peer this connection talks to, once known
    #[must_use]
    pub fn remote_session(&self) -> Option<String> {
        self.negotiation.lock().remote_session.clone()
    }

    pub fn set_remote_session(&self, session_id: impl Into<String>) {
        self.negotiation.lock().remote_session = Some(session_id.into());
    }

    /// Add a gathered local candidate. Returns the full batch to publish,
    /// or `None` if the candidate was already known.
    pub fn push_local_candidate(&self, candidate: IceCandidate) -> Option<Vec<IceCandidate>> {
        let mut n = self.negotiation.lock();
        if n.local_candidates.contains(&candidate) {
            return None;
        }
        n.local_candidates.push(candidate);
        n.last_activity = Utc::now();
        Some(n.local_candidates.clone())
    }

    #[must_use]
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.negotiation.lock().local_candidates.clone()
    }

    /// Mark a remote candidate as applied. Returns false if it already was.
    pub fn mark_candidate_applied(&self, candidate: &IceCandidate) -> bool {
        let mut n = self.negotiation.lock();
        n.last_activity = Utc::now();
        n.applied_candidates.insert(candidate.clone())
    }

    /// Forget a candidate whose application failed so a later batch can retry it
    pub fn unmark_candidate(&self, candidate: &IceCandidate) {
        self.negotiation.lock().applied_candidates.remove(candidate);
    }

    #[must_use]
    pub fn applied_candidate_count(&self) -> usize {
        self.negotiation.lock().applied_candidates.len()
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.negotiation.lock().last_activity
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection once; later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.connection.close().await {
            warn!(peer_id = %self.peer_id, error = %e, "Failed to close peer connection");
        }
        debug!(peer_id = %self.peer_id, "Peer session closed");
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("negotiation", &self.negotiation_state())
            .field("in_flight", &self.is_negotiating())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Owns the peer sessions of one stream session
pub struct PeerConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    playback: Arc<dyn PlaybackSurface>,
    ice_servers: IceServerList,
    events: mpsc::Sender<PeerEvent>,
    sessions: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    local_stream: RwLock<Option<LocalStream>>,
    closed: AtomicBool,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        playback: Arc<dyn PlaybackSurface>,
        ice_servers: IceServerList,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            playback,
            ice_servers,
            events,
            sessions: RwLock::new(HashMap::new()),
            local_stream: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn ice_servers(&self) -> &IceServerList {
        &self.ice_servers
    }

    /// Session for `peer_id`, created with `role` if there is none yet.
    ///
    /// New sessions get the local tracks attached so far.
    pub async fn create_session(&self, peer_id: &PeerId, role: Role) -> Result<Arc<PeerSession>> {
        if let Some(existing) = self.get(peer_id) {
            return Ok(existing);
        }
        self.ensure_open()?;

        let events = PeerEventSender::new(peer_id.clone(), self.events.clone());
        let connection = self
            .factory
            .connect(peer_id, &self.ice_servers, events)
            .await?;
        let session = Arc::new(PeerSession::new(peer_id.clone(), role, connection));

        // Someone else may have won the race while we were connecting, or
        // the manager may have been closed.
        let inserted = {
            let mut sessions = self.sessions.write();
            if self.closed.load(Ordering::Acquire) {
                None
            } else if let Some(existing) = sessions.get(peer_id) {
                Some((existing.clone(), false))
            } else {
                sessions.insert(peer_id.clone(), session.clone());
                Some((session.clone(), true))
            }
        };

        match inserted {
            None => {
                session.close().await;
                Err(Error::InvalidState("peer connection manager is closed".to_string()))
            }
            Some((existing, false)) => {
                session.close().await;
                Ok(existing)
            }
            Some((session, true)) => {
                info!(peer_id = %peer_id, role = ?role, "Peer session created");
                let stream = self.local_stream.read().clone();
                if let Some(stream) = stream {
                    Self::add_tracks(&session, &stream).await;
                }
                Ok(session)
            }
        }
    }

    /// Add every track of `stream` to every open session, and to sessions
    /// created later.
    pub async fn attach_local_tracks(&self, stream: &LocalStream) {
        *self.local_stream.write() = Some(stream.clone());

        for session in self.sessions() {
            Self::add_tracks(&session, stream).await;
        }
    }

    async fn add_tracks(session: &PeerSession, stream: &LocalStream) {
        for track in stream.tracks() {
            if let Err(e) = session.connection().add_track(track.clone()).await {
                warn!(
                    peer_id = %session.peer_id,
                    track_id = %track.id,
                    error = %e,
                    "Failed to add local track"
                );
            }
        }
    }

    /// Hand a remote track to the peer's playback sink, creating the sink if needed.
    pub fn route_remote_track(&self, track: RemoteTrack) {
        let peer_id = track.peer_id.clone();
        if !self.sessions.read().contains_key(&peer_id) {
            debug!(peer_id = %peer_id, track_id = %track.id, "Dropping track from unknown peer");
            return;
        }

        let sink = self
            .playback
            .sink_for(&peer_id)
            .unwrap_or_else(|| self.playback.create_sink(&peer_id));
        debug!(peer_id = %peer_id, track_id = %track.id, kind = ?track.kind, "Routing remote track");
        sink.attach(track);
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(peer_id).cloned()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close and forget the session for `peer_id`. Returns false if there was none.
    pub async fn close_session(&self, peer_id: &PeerId) -> bool {
        let removed = self.sessions.write().remove(peer_id);
        match removed {
            Some(session) => {
                session.close().await;
                info!(peer_id = %peer_id, "Peer session removed");
                true
            }
            None => false,
        }
    }

    /// Close every session and refuse new ones.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        let count = drained.len();

        for session in drained {
            session.close().await;
        }
        self.local_stream.write().take();

        if count > 0 {
            info!(count = count, "Closed all peer sessions");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState("peer connection manager is closed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MockPlaybackSink, MockPlaybackSurface, PlaybackSink, TrackKind};
    use crate::test_helpers::{LoopbackFactory, NullPlayback};
    use crate::types::TrackId;

    fn manager(factory: &LoopbackFactory) -> PeerConnectionManager {
        let (tx, _rx) = mpsc::channel(16);
        PeerConnectionManager::new(
            Arc::new(factory.clone()),
            Arc::new(NullPlayback),
            IceServerList::public_stun_defaults(),
            tx,
        )
    }

    fn stream_with_tracks() -> LocalStream {
        LocalStream::new(
            "cam",
            vec![
                Arc::new(LocalTrack::new(TrackKind::Video, "cam")),
                Arc::new(LocalTrack::new(TrackKind::Audio, "cam")),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_session_is_get_or_create() {
        let factory = LoopbackFactory::new();
        let manager = manager(&factory);
        let bob = PeerId::from("bob");

        let first = manager.create_session(&bob, Role::Initiator).await.unwrap();
        let second = manager.create_session(&bob, Role::Responder).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.role(), Role::Initiator);
        assert_eq!(manager.len(), 1);
        assert_eq!(factory.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_local_tracks_fans_out() {
        let factory = LoopbackFactory::new();
        let manager = manager(&factory);

        for peer in ["bob", "carol", "dave"] {
            manager
                .create_session(&PeerId::from(peer), Role::Initiator)
                .await
                .unwrap();
        }

        let stream = stream_with_tracks();
        manager.attach_local_tracks(&stream).await;

        let connections = factory.connections();
        assert_eq!(connections.len(), 3);
        for conn in connections {
            assert_eq!(conn.track_ids().len(), 2);
        }

        // Late joiners get the tracks too
        manager
            .create_session(&PeerId::from("erin"), Role::Initiator)
            .await
            .unwrap();
        let erin = factory.connection(&PeerId::from("erin")).unwrap();
        assert_eq!(erin.track_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = LoopbackFactory::new();
        let manager = manager(&factory);
        let bob = PeerId::from("bob");

        manager.create_session(&bob, Role::Initiator).await.unwrap();
        assert!(manager.close_session(&bob).await);
        assert!(!manager.close_session(&bob).await);
        assert!(!manager.close_session(&PeerId::from("nobody")).await);

        let conn = factory.connection(&bob).unwrap();
        assert_eq!(conn.close_count(), 1);

        manager.close_all().await;
        manager.close_all().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_sessions() {
        let factory = LoopbackFactory::new();
        let manager = manager(&factory);
        manager.close_all().await;

        let err = manager
            .create_session(&PeerId::from("bob"), Role::Responder)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_remote_track_creates_sink_on_demand() {
        let factory = LoopbackFactory::new();
        let (tx, _rx) = mpsc::channel(16);

        let mut sink = MockPlaybackSink::new();
        sink.expect_attach().times(1).return_const(());
        let sink: Arc<dyn PlaybackSink> = Arc::new(sink);

        let mut surface = MockPlaybackSurface::new();
        surface.expect_sink_for().times(1).returning(|_| None);
        surface
            .expect_create_sink()
            .times(1)
            .returning(move |_| sink.clone());

        let manager = PeerConnectionManager::new(
            Arc::new(factory),
            Arc::new(surface),
            IceServerList::default(),
            tx,
        );
        let bob = PeerId::from("bob");
        manager.create_session(&bob, Role::Responder).await.unwrap();

        let (_packets_tx, packets) = mpsc::channel(1);
        manager.route_remote_track(RemoteTrack {
            peer_id: bob,
            id: TrackId::from("remote-video"),
            kind: TrackKind::Video,
            stream_id: "cam".to_string(),
            packets,
        });
    }

    #[test]
    fn test_candidate_bookkeeping() {
        let session = PeerSession::new(
            "bob".into(),
            Role::Initiator,
            Arc::new(crate::test_helpers::LoopbackConnection::new("bob".into(), None)),
        );
        let a = IceCandidate::new("candidate:a");
        let b = IceCandidate::new("candidate:b");

        assert_eq!(session.push_local_candidate(a.clone()).map(|v| v.len()), Some(1));
        assert!(session.push_local_candidate(a.clone()).is_none());
        assert_eq!(session.push_local_candidate(b.clone()), Some(vec![a.clone(), b]));

        assert!(session.mark_candidate_applied(&a));
        assert!(!session.mark_candidate_applied(&a));
        session.unmark_candidate(&a);
        assert!(session.mark_candidate_applied(&a));
    }

    #[test]
    fn test_negotiation_guard_and_offer_expiry() {
        let session = PeerSession::new(
            "bob".into(),
            Role::Initiator,
            Arc::new(crate::test_helpers::LoopbackConnection::new("bob".into(), None)),
        );

        assert!(session.try_begin_negotiation());
        assert!(!session.try_begin_negotiation());

        session.begin_offer("offer-1");
        assert_eq!(session.pending_offer_id().as_deref(), Some("offer-1"));
        assert!(session.offer_expired(Duration::ZERO));
        assert!(!session.offer_expired(Duration::from_secs(3600)));

        session.set_negotiation_state(NegotiationState::Stable);
        assert!(session.pending_offer_id().is_none());
        session.end_negotiation();
        assert!(session.try_begin_negotiation());
    }
}
