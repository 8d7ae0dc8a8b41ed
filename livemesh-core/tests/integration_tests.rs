//! End-to-end tests of the stream lifecycle over the in-memory mailbox store
//!
//! Run with: cargo test --test integration_tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use livemesh_core::{
    config::StreamConfig,
    connection::{
        ConnectionEvent, ConnectionFactory, MediaConnection, PeerConnectionState, PeerEventSender,
        SignalingState,
    },
    ice::{IceServerList, StaticIceConfigProvider},
    media::{
        LocalStream, LocalTrack, MediaSource, PlaybackSink, PlaybackSurface, RemoteTrack,
        TrackKind,
    },
    presence::NoopPresenceNotifier,
    signaling::{
        IceCandidate, MailboxKey, MemoryMailboxStore, MessageKind, SdpType, SessionDescription,
    },
    LocalIdentity, PeerId, SessionState, StreamCollaborators, StreamLifecycleController,
};

/// Connection that follows offer/answer state without moving media
struct ScriptedConnection {
    events: PeerEventSender,
    state: Mutex<SignalingState>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
}

#[async_trait]
impl MediaConnection for ScriptedConnection {
    async fn create_offer(&self) -> livemesh_core::Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0\r\ns=scripted-offer\r\n"))
    }

    async fn create_answer(&self) -> livemesh_core::Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0\r\ns=scripted-answer\r\n"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> livemesh_core::Result<()> {
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        self.events
            .emit(ConnectionEvent::IceCandidate(IceCandidate::new(
                "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host",
            )))
            .await;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> livemesh_core::Result<()> {
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        if description.sdp_type == SdpType::Answer {
            self.events
                .emit(ConnectionEvent::StateChanged(PeerConnectionState::Connected))
                .await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> livemesh_core::Result<()> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, _track: Arc<LocalTrack>) -> livemesh_core::Result<()> {
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn close(&self) -> livemesh_core::Result<()> {
        *self.state.lock() = SignalingState::Closed;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct ScriptedFactory {
    connections: Arc<Mutex<Vec<(PeerId, Arc<ScriptedConnection>)>>>,
}

impl ScriptedFactory {
    fn connection(&self, peer_id: &PeerId) -> Option<Arc<ScriptedConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|(peer, _)| peer == peer_id)
            .map(|(_, conn)| conn.clone())
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(
        &self,
        peer_id: &PeerId,
        _ice_servers: &IceServerList,
        events: PeerEventSender,
    ) -> livemesh_core::Result<Arc<dyn MediaConnection>> {
        let conn = Arc::new(ScriptedConnection {
            events,
            state: Mutex::new(SignalingState::Stable),
            remote_candidates: Mutex::new(Vec::new()),
        });
        self.connections.lock().push((peer_id.clone(), conn.clone()));
        Ok(conn)
    }
}

struct Camera;

#[async_trait]
impl MediaSource for Camera {
    async fn acquire(&self) -> livemesh_core::Result<LocalStream> {
        Ok(LocalStream::new(
            "camera",
            vec![Arc::new(LocalTrack::new(TrackKind::Video, "camera"))],
        ))
    }
}

struct Screen;

impl PlaybackSink for Screen {
    fn attach(&self, _track: RemoteTrack) {}
}

impl PlaybackSurface for Screen {
    fn sink_for(&self, _peer_id: &PeerId) -> Option<Arc<dyn PlaybackSink>> {
        None
    }

    fn create_sink(&self, _peer_id: &PeerId) -> Arc<dyn PlaybackSink> {
        Arc::new(Screen)
    }
}

fn controller(
    peer: &str,
    store: Arc<MemoryMailboxStore>,
) -> (StreamLifecycleController, ScriptedFactory) {
    let factory = ScriptedFactory::default();
    let controller = StreamLifecycleController::new(
        LocalIdentity::new(peer, peer),
        StreamConfig::default(),
        StreamCollaborators {
            media: Arc::new(Camera),
            ice: Arc::new(StaticIceConfigProvider::from_urls(["stun:stun.example.com:3478"])),
            mailbox: store,
            connections: Arc::new(factory.clone()),
            playback: Arc::new(Screen),
            presence: Arc::new(NoopPresenceNotifier),
        },
    );
    (controller, factory)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_broadcaster_and_viewer_negotiate() {
    let store = Arc::new(MemoryMailboxStore::new());
    let (alice, alice_conns) = controller("alice", store.clone());
    let (bob, bob_conns) = controller("bob", store.clone());
    let alice_id = PeerId::from("alice");
    let bob_id = PeerId::from("bob");

    bob.join_stream().await.unwrap();
    alice.start_stream().await.unwrap();
    alice.announce_viewer(bob_id.clone());

    eventually("both sides stable with candidates", || {
        let (Some(a), Some(b)) = (alice_conns.connection(&bob_id), bob_conns.connection(&alice_id))
        else {
            return false;
        };
        a.signaling_state() == SignalingState::Stable
            && b.signaling_state() == SignalingState::Stable
            && !a.remote_candidates.lock().is_empty()
            && !b.remote_candidates.lock().is_empty()
    })
    .await;

    let offer = store.snapshot(&MailboxKey::new(MessageKind::Offer, "bob"));
    let answer = store.snapshot(&MailboxKey::new(MessageKind::Answer, "alice"));
    let offer = offer.get(&alice_id).unwrap();
    let answer = answer.get(&bob_id).unwrap();
    assert_eq!(offer.from, alice_id);
    assert_eq!(answer.from, bob_id);

    alice.stop_stream().await.unwrap();
    bob.stop_stream().await.unwrap();
    assert_eq!(alice.state(), SessionState::Idle);
    assert_eq!(bob.state(), SessionState::Idle);
    assert!(store.snapshot(&MailboxKey::new(MessageKind::Offer, "bob")).is_empty());
}

#[tokio::test]
async fn test_viewer_joining_late_receives_the_offer() {
    let store = Arc::new(MemoryMailboxStore::new());
    let (alice, _) = controller("alice", store.clone());
    let (bob, bob_conns) = controller("bob", store.clone());
    let alice_id = PeerId::from("alice");

    alice.start_stream().await.unwrap();
    alice.announce_viewer(PeerId::from("bob"));
    eventually("offer to be written", || {
        !store.snapshot(&MailboxKey::new(MessageKind::Offer, "bob")).is_empty()
    })
    .await;

    // The mailbox snapshot delivers the offer written before bob subscribed
    bob.join_stream().await.unwrap();
    eventually("bob to answer", || {
        bob_conns
            .connection(&alice_id)
            .is_some_and(|c| c.signaling_state() == SignalingState::Stable)
    })
    .await;
    assert_eq!(bob.peer_ids(), vec![alice_id]);
}
