//! `MediaConnection` backed by the webrtc crate
//!
//! Every callback the peer connection offers is forwarded to the single
//! `PeerEventSender` given at creation. Remote candidates that arrive
//! before the remote description are held back and applied once it is set.

use async_trait::async_trait;
use bytes::Bytes;
use livemesh_core::connection::{
    ConnectionEvent, ConnectionFactory, MediaConnection, PeerEventSender, SignalingState,
};
use livemesh_core::ice::IceServerList;
use livemesh_core::media::{
    LocalTrack, MediaSample, RemoteTrack, TrackKind, REMOTE_PACKET_CHANNEL_CAPACITY,
};
use livemesh_core::signaling::{IceCandidate, SdpType, SessionDescription};
use livemesh_core::types::{PeerId, TrackId};
use livemesh_core::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::convert::{
    connection_state, from_rtc_candidate, from_rtc_description, rtc_error, signaling_state,
    to_rtc_candidate, to_rtc_description, to_rtc_ice_servers, track_kind,
};

/// Creates webrtc peer connections sharing one configured API instance
pub struct WebRtcConnectionFactory {
    api: API,
}

impl WebRtcConnectionFactory {
    /// Build an API with the default codecs and interceptors.
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| rtc_error("register codecs", &e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| rtc_error("register interceptors", &e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn connect(
        &self,
        peer_id: &PeerId,
        ice_servers: &IceServerList,
        events: PeerEventSender,
    ) -> Result<Arc<dyn MediaConnection>> {
        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| rtc_error("create peer connection", &e))?,
        );

        let connection = Arc::new(WebRtcConnection {
            peer_id: peer_id.clone(),
            pc,
            pending_candidates: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        connection.register_callbacks(events);

        debug!(peer_id = %peer_id, ice_servers = ice_servers.len(), "Created peer connection");
        Ok(connection)
    }
}

pub struct WebRtcConnection {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    /// Stops the sample writers and packet readers of this connection
    cancel: CancellationToken,
}

impl WebRtcConnection {
    fn register_callbacks(&self, events: PeerEventSender) {
        let candidate_events = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events
                            .emit(ConnectionEvent::IceCandidate(from_rtc_candidate(init)))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let track_events = events.clone();
        let peer_id = self.peer_id.clone();
        let cancel = self.cancel.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let peer_id = peer_id.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let remote = forward_remote_track(peer_id, track, cancel);
                events.emit(ConnectionEvent::Track(remote)).await;
            })
        }));

        let negotiation_events = events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let events = negotiation_events.clone();
            Box::pin(async move {
                events.emit(ConnectionEvent::NegotiationNeeded).await;
            })
        }));

        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    trace!(peer_id = %peer_id, state = %state, "Peer connection state");
                    events
                        .emit(ConnectionEvent::StateChanged(connection_state(state)))
                        .await;
                })
            }));
    }

    async fn flush_pending_candidates(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        if pending.is_empty() {
            return;
        }
        debug!(peer_id = %self.peer_id, count = pending.len(), "Applying held candidates");
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(to_rtc_candidate(&candidate)).await {
                warn!(peer_id = %self.peer_id, error = %e, "Failed to apply held candidate");
            }
        }
    }
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_error("create offer", &e))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| rtc_error("create answer", &e))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| rtc_error("set local description", &e))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let rollback = description.sdp_type == SdpType::Rollback;
        let description = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| rtc_error("set remote description", &e))?;
        if !rollback {
            self.flush_pending_candidates().await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            trace!(peer_id = %self.peer_id, "Holding candidate until remote description");
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(to_rtc_candidate(&candidate))
            .await
            .map_err(|e| rtc_error("add candidate", &e))
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(track.kind),
            track.id.to_string(),
            track.stream_id.clone(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| rtc_error("add track", &e))?;

        // RTCP has to be read for the interceptors to work
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    read = sender.read(&mut buf) => if read.is_err() { break },
                }
            }
        });

        tokio::spawn(write_samples(
            track.subscribe(),
            rtc_track,
            self.cancel.clone(),
        ));
        debug!(peer_id = %self.peer_id, track_id = %track.id, kind = ?track.kind, "Added local track");
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.pending_candidates.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| rtc_error("close peer connection", &e))?;
        info!(peer_id = %self.peer_id, "Peer connection closed");
        Ok(())
    }
}

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    }
}

/// Copy captured samples into the connection until it closes.
async fn write_samples(
    mut samples: broadcast::Receiver<MediaSample>,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    loop {
        let sample = tokio::select! {
            () = cancel.cancelled() => break,
            sample = samples.recv() => sample,
        };
        match sample {
            Ok(sample) => {
                let sample = Sample {
                    data: sample.data,
                    duration: sample.duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    trace!(error = %e, "Dropped sample");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(skipped, "Sample writer lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Start reading RTP from a remote track into a bounded packet channel.
fn forward_remote_track(
    peer_id: PeerId,
    track: Arc<TrackRemote>,
    cancel: CancellationToken,
) -> RemoteTrack {
    let (tx, rx) = mpsc::channel::<Bytes>(REMOTE_PACKET_CHANNEL_CAPACITY);
    let remote = RemoteTrack {
        peer_id: peer_id.clone(),
        id: TrackId::new(track.id()),
        kind: track_kind(track.kind()),
        stream_id: track.stream_id(),
        packets: rx,
    };

    info!(peer_id = %peer_id, track_id = %remote.id, kind = ?remote.kind, "Remote track started");
    tokio::spawn(async move {
        loop {
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = track.read_rtp() => read,
            };
            match read {
                Ok((packet, _)) => {
                    // Playback that cannot keep up loses packets
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(packet.payload) {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Remote track ended");
                    break;
                }
            }
        }
    });
    remote
}
