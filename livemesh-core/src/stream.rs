//! Stream lifecycle
//!
//! `StreamLifecycleController` is the public entry point. A broadcaster
//! calls `start_stream`, a viewer calls `join_stream`; both end with
//! `stop_stream`. Each start builds a fresh `StreamSession` (peer manager,
//! negotiation state machine, mailbox subscription and event dispatcher)
//! tied to one epoch of the session gate.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::{CredentialPolicy, StreamConfig};
use crate::connection::{ConnectionEvent, ConnectionFactory, PeerConnectionState, PeerEvent};
use crate::error::ErrorKind;
use crate::ice::{IceConfigProvider, IceServerList};
use crate::media::{LocalStream, MediaSource, PlaybackSurface};
use crate::negotiation::NegotiationStateMachine;
use crate::peer::{PeerConnectionManager, Role};
use crate::presence::PresenceNotifier;
use crate::session::{SessionEvent, SessionGate, SessionState, SessionTicket};
use crate::signaling::{MailboxStore, SignalingChannel, Subscription};
use crate::types::{LocalIdentity, PeerId};
use crate::{Error, Result};

/// Error surfaced to the user of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAlert {
    pub kind: ErrorKind,
    pub message: String,
    /// The stream could not start or had to stop
    pub fatal: bool,
}

impl StreamAlert {
    fn fatal(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            fatal: true,
        }
    }

    fn warning(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            fatal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Capture local media and offer it to viewers
    Broadcast,
    /// Answer offers, no local capture
    Watch,
}

/// External collaborators of the controller
#[derive(Clone)]
pub struct StreamCollaborators {
    pub media: Arc<dyn MediaSource>,
    pub ice: Arc<dyn IceConfigProvider>,
    pub mailbox: Arc<dyn MailboxStore>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub playback: Arc<dyn PlaybackSurface>,
    pub presence: Arc<dyn PresenceNotifier>,
}

/// Everything owned by one started stream
struct StreamSession {
    ticket: SessionTicket,
    mode: StreamMode,
    local_stream: Option<LocalStream>,
    peers: Arc<PeerConnectionManager>,
    machine: Arc<NegotiationStateMachine>,
    subscription: Mutex<Option<Subscription>>,
    dispatcher: CancellationToken,
    _dispatcher_guard: DropGuard,
}

impl StreamSession {
    async fn teardown(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        self.dispatcher.cancel();
        if let Some(stream) = &self.local_stream {
            stream.stop();
        }
        self.peers.close_all().await;
        self.machine.reset();
        if let Err(e) = self.machine.channel().clear().await {
            warn!(error = %e, "Failed to clear signaling mailboxes");
        }
    }
}

pub struct StreamLifecycleController {
    identity: LocalIdentity,
    config: StreamConfig,
    collaborators: StreamCollaborators,
    gate: Arc<SessionGate>,
    session: Mutex<Option<Arc<StreamSession>>>,
    targets: Mutex<BTreeSet<PeerId>>,
    alert_tx: watch::Sender<Option<StreamAlert>>,
}

impl StreamLifecycleController {
    pub fn new(
        identity: LocalIdentity,
        config: StreamConfig,
        collaborators: StreamCollaborators,
    ) -> Self {
        let targets = config
            .target_peers
            .iter()
            .map(|p| PeerId::new(p.as_str()))
            .collect();
        Self {
            identity,
            config,
            collaborators,
            gate: Arc::new(SessionGate::new()),
            session: Mutex::new(None),
            targets: Mutex::new(targets),
            alert_tx: watch::Sender::new(None),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.gate.state()
    }

    /// Observable streaming flag; true while the session is active
    #[must_use]
    pub fn is_streaming(&self) -> watch::Receiver<bool> {
        self.gate.subscribe_streaming()
    }

    /// Observable last user-facing error
    #[must_use]
    pub fn error(&self) -> watch::Receiver<Option<StreamAlert>> {
        self.alert_tx.subscribe()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.current().map_or(0, |s| s.peers.len())
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.current().map(|s| s.peers.peer_ids()).unwrap_or_default()
    }

    /// ICE servers used by the running session
    #[must_use]
    pub fn ice_servers(&self) -> Option<IceServerList> {
        self.current().map(|s| s.peers.ice_servers().clone())
    }

    #[must_use]
    pub fn mode(&self) -> Option<StreamMode> {
        self.current().map(|s| s.mode)
    }

    fn current(&self) -> Option<Arc<StreamSession>> {
        self.session.lock().clone()
    }

    /// Start broadcasting local media to the known viewers.
    pub async fn start_stream(&self) -> Result<()> {
        self.begin(StreamMode::Broadcast).await
    }

    /// Start watching: answer whatever offers arrive, without local capture.
    pub async fn join_stream(&self) -> Result<()> {
        self.begin(StreamMode::Watch).await
    }

    async fn begin(&self, mode: StreamMode) -> Result<()> {
        let ticket = self.gate.transition(SessionEvent::Start)?;
        self.alert_tx.send_replace(None);
        info!(peer_id = %self.identity.peer_id, mode = ?mode, "Starting stream session");

        let local_stream = match mode {
            StreamMode::Broadcast => match self.collaborators.media.acquire().await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    error!(error = %e, "Failed to acquire local media");
                    self.fail_start(ticket, &e);
                    return Err(e);
                }
            },
            StreamMode::Watch => None,
        };
        if !self.gate.holds(ticket, SessionState::Starting) {
            return Err(Self::abandon_start(local_stream.as_ref()));
        }

        let ice_servers = match self.collaborators.ice.fetch_ice_servers().await {
            Ok(servers) => servers,
            Err(e) => match self.config.credential_policy {
                CredentialPolicy::Degrade => {
                    warn!(error = %e, "ICE credentials unavailable, falling back to public STUN");
                    self.alert_tx.send_replace(Some(StreamAlert::warning(&e)));
                    IceServerList::public_stun_defaults()
                }
                CredentialPolicy::Abort => {
                    error!(error = %e, "ICE credentials unavailable, aborting start");
                    if let Some(stream) = &local_stream {
                        stream.stop();
                    }
                    self.fail_start(ticket, &e);
                    return Err(e);
                }
            },
        };
        if !self.gate.holds(ticket, SessionState::Starting) {
            return Err(Self::abandon_start(local_stream.as_ref()));
        }

        let session = self.build_session(ticket, mode, local_stream, ice_servers);
        if let Some(stream) = &session.local_stream {
            session.peers.attach_local_tracks(stream).await;
        }

        // Publish the session and activate in one step so `stop_stream`
        // either finds it or prevents activation.
        let activated = {
            let mut slot = self.session.lock();
            match self.gate.transition_from(ticket, SessionEvent::Activate) {
                Ok(_) => {
                    *slot = Some(session.clone());
                    true
                }
                Err(_) => false,
            }
        };
        if !activated {
            session.teardown().await;
            return Err(Error::InvalidState("stream stopped while starting".to_string()));
        }

        match session.machine.channel().subscribe(session.machine.clone()).await {
            Ok(subscription) => {
                if self.gate.is_active(ticket) {
                    *session.subscription.lock() = Some(subscription);
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to subscribe to signaling mailboxes");
                self.alert_tx.send_replace(Some(StreamAlert::fatal(&e)));
                self.stop_stream().await?;
                return Err(e);
            }
        }

        if mode == StreamMode::Broadcast {
            self.notify_started();
            let targets: Vec<PeerId> = self.targets.lock().iter().cloned().collect();
            for peer_id in targets {
                Self::spawn_offer(&session, peer_id);
            }
        }

        info!(
            peer_id = %self.identity.peer_id,
            mode = ?mode,
            ice_servers = session.peers.ice_servers().len(),
            "Stream session active"
        );
        Ok(())
    }

    fn build_session(
        &self,
        ticket: SessionTicket,
        mode: StreamMode,
        local_stream: Option<LocalStream>,
        ice_servers: IceServerList,
    ) -> Arc<StreamSession> {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let peers = Arc::new(PeerConnectionManager::new(
            self.collaborators.connections.clone(),
            self.collaborators.playback.clone(),
            ice_servers,
            events_tx,
        ));
        let channel = SignalingChannel::new(
            self.collaborators.mailbox.clone(),
            self.identity.peer_id.clone(),
        );
        let machine = Arc::new(NegotiationStateMachine::new(
            channel,
            peers.clone(),
            self.gate.clone(),
            ticket,
            Duration::from_secs(self.config.offer_timeout_secs),
        ));

        let dispatcher = CancellationToken::new();
        tokio::spawn(dispatch_events(
            events_rx,
            peers.clone(),
            machine.clone(),
            dispatcher.clone(),
        ));

        Arc::new(StreamSession {
            ticket,
            mode,
            local_stream,
            peers,
            machine,
            subscription: Mutex::new(None),
            _dispatcher_guard: dispatcher.clone().drop_guard(),
            dispatcher,
        })
    }

    fn fail_start(&self, ticket: SessionTicket, error: &Error) {
        self.alert_tx.send_replace(Some(StreamAlert::fatal(error)));
        if let Err(e) = self.gate.transition_from(ticket, SessionEvent::StartFailed) {
            debug!(error = %e, "Start already superseded");
        }
    }

    fn abandon_start(local_stream: Option<&LocalStream>) -> Error {
        if let Some(stream) = local_stream {
            stream.stop();
        }
        debug!("Stream stopped while starting");
        Error::InvalidState("stream stopped while starting".to_string())
    }

    fn spawn_offer(session: &Arc<StreamSession>, peer_id: PeerId) {
        let peers = session.peers.clone();
        let machine = session.machine.clone();
        tokio::spawn(async move {
            match peers.create_session(&peer_id, Role::Initiator).await {
                Ok(_) => machine.negotiation_needed(&peer_id).await,
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to create peer session"),
            }
        });
    }

    fn notify_started(&self) {
        let presence = self.collaborators.presence.clone();
        let peer_id = self.identity.peer_id.clone();
        let display_name = self.identity.display_name.clone();
        tokio::spawn(async move {
            if let Err(e) = presence.notify_stream_started(&peer_id, &display_name).await {
                warn!(error = %e, "Failed to notify stream start");
            }
        });
    }

    fn notify_stopped(&self) {
        let presence = self.collaborators.presence.clone();
        let peer_id = self.identity.peer_id.clone();
        tokio::spawn(async move {
            if let Err(e) = presence.notify_stream_stopped(&peer_id).await {
                warn!(error = %e, "Failed to notify stream stop");
            }
        });
    }

    /// Stop the session: deactivate first, then release everything.
    /// Does nothing when no session is running.
    pub async fn stop_stream(&self) -> Result<()> {
        if self.gate.transition(SessionEvent::Stop).is_err() {
            debug!(state = %self.gate.state(), "Stop requested with no running session");
            return Ok(());
        }
        info!(peer_id = %self.identity.peer_id, "Stopping stream session");

        let session = self.session.lock().take();
        if let Some(session) = session {
            session.teardown().await;
            if session.mode == StreamMode::Broadcast {
                self.notify_stopped();
            }
            debug!(epoch = session.ticket.epoch(), "Stream session torn down");
        }

        self.gate.transition(SessionEvent::Stopped)?;
        Ok(())
    }

    /// Add a viewer to offer to; offers immediately while broadcasting.
    pub fn announce_viewer(&self, peer_id: PeerId) {
        if peer_id == self.identity.peer_id {
            return;
        }
        let added = self.targets.lock().insert(peer_id.clone());
        if added {
            info!(peer_id = %peer_id, "Viewer announced");
        }

        if let Some(session) = self.current() {
            if session.mode == StreamMode::Broadcast && self.gate.is_active(session.ticket) {
                Self::spawn_offer(&session, peer_id);
            }
        }
    }

    /// Forget a viewer and close its connection.
    pub async fn remove_viewer(&self, peer_id: &PeerId) -> bool {
        let known = self.targets.lock().remove(peer_id);
        let closed = match self.current() {
            Some(session) => session.peers.close_session(peer_id).await,
            None => false,
        };
        if known || closed {
            info!(peer_id = %peer_id, "Viewer removed");
        }
        known || closed
    }
}

/// Single consumer of every connection event of a session
async fn dispatch_events(
    mut events: mpsc::Receiver<PeerEvent>,
    peers: Arc<PeerConnectionManager>,
    machine: Arc<NegotiationStateMachine>,
    cancel: CancellationToken,
) {
    loop {
        let PeerEvent { peer_id, event } = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                machine.local_candidate(&peer_id, candidate).await;
            }
            ConnectionEvent::Track(track) => peers.route_remote_track(track),
            ConnectionEvent::NegotiationNeeded => {
                let machine = machine.clone();
                tokio::spawn(async move { machine.negotiation_needed(&peer_id).await });
            }
            ConnectionEvent::StateChanged(state) => match state {
                PeerConnectionState::Connected => {
                    info!(peer_id = %peer_id, "Peer connected");
                }
                PeerConnectionState::Failed | PeerConnectionState::Disconnected => {
                    warn!(peer_id = %peer_id, state = ?state, "Peer connection degraded");
                }
                _ => debug!(peer_id = %peer_id, state = ?state, "Peer connection state changed"),
            },
        }
    }
    debug!("Connection event dispatcher stopped");
}
