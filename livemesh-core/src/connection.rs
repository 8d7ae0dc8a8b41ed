//! Media connection boundary
//!
//! A `MediaConnection` is one peer-to-peer link as provided by the
//! underlying WebRTC stack. Its asynchronous notifications are delivered
//! through the `PeerEventSender` handed over at creation, which is the only
//! event registration a connection ever gets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::ice::IceServerList;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::types::PeerId;
use crate::Result;

/// JSEP signaling state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug)]
pub enum ConnectionEvent {
    /// A local candidate was gathered
    IceCandidate(IceCandidate),
    /// The remote side started sending a track
    Track(RemoteTrack),
    /// Local changes require a new offer
    NegotiationNeeded,
    StateChanged(PeerConnectionState),
}

#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    pub event: ConnectionEvent,
}

/// Handle a connection uses to report its events
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    peer_id: PeerId,
    tx: mpsc::Sender<PeerEvent>,
}

impl PeerEventSender {
    #[must_use]
    pub const fn new(peer_id: PeerId, tx: mpsc::Sender<PeerEvent>) -> Self {
        Self { peer_id, tx }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Deliver an event; returns false once the receiving side is gone.
    pub async fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx
            .send(PeerEvent {
                peer_id: self.peer_id.clone(),
                event,
            })
            .await
            .is_ok()
    }

    /// Deliver an event from a synchronous callback.
    /// The event is dropped when the channel is full or closed.
    pub fn try_emit(&self, event: ConnectionEvent) -> bool {
        match self.tx.try_send(PeerEvent {
            peer_id: self.peer_id.clone(),
            event,
        }) {
            Ok(()) => true,
            Err(e) => {
                trace!(peer_id = %self.peer_id, error = %e, "Dropped connection event");
                false
            }
        }
    }
}

/// One peer-to-peer media connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// Creates media connections configured with a given ICE server list
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        peer_id: &PeerId,
        ice_servers: &IceServerList,
        events: PeerEventSender,
    ) -> Result<Arc<dyn MediaConnection>>;
}
