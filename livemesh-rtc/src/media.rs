//! Capture and playback endpoints for headless runs
//!
//! `SyntheticMediaSource` produces placeholder video and audio frames at a
//! fixed cadence. `CountingPlayback` drains remote tracks and keeps per-peer
//! packet statistics.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use livemesh_core::media::{
    LocalStream, LocalTrack, MediaSample, MediaSource, PlaybackSink, PlaybackSurface, RemoteTrack,
    TrackKind,
};
use livemesh_core::types::PeerId;
use livemesh_core::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const VIDEO_FRAME_INTERVAL: Duration = Duration::from_millis(33);
const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Generates placeholder frames instead of capturing a device
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource;

impl SyntheticMediaSource {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalStream> {
        let stream_id = format!("synthetic-{}", nanoid::nanoid!(8));
        let video = Arc::new(LocalTrack::new(TrackKind::Video, stream_id.as_str()));
        let audio = Arc::new(LocalTrack::new(TrackKind::Audio, stream_id.as_str()));
        let stream = LocalStream::new(stream_id, vec![video.clone(), audio.clone()]);

        tokio::spawn(generate(video, VIDEO_FRAME_INTERVAL, stream.clone()));
        tokio::spawn(generate(audio, AUDIO_FRAME_INTERVAL, stream.clone()));

        info!(stream_id = %stream.id, "Synthetic capture started");
        Ok(stream)
    }
}

async fn generate(track: Arc<LocalTrack>, interval: Duration, stream: LocalStream) {
    let stop = stream.stop_token();
    let mut ticker = tokio::time::interval(interval);
    let frame = Bytes::from(vec![0u8; 160]);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                track.write_sample(MediaSample {
                    data: frame.clone(),
                    duration: interval,
                });
            }
        }
    }
    debug!(track_id = %track.id, "Synthetic capture stopped");
}

/// Per-peer packet counters
#[derive(Debug, Default)]
pub struct PeerStats {
    pub tracks: AtomicU64,
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

/// Playback surface that counts what it receives
#[derive(Clone, Default)]
pub struct CountingPlayback {
    sinks: Arc<DashMap<PeerId, Arc<CountingSink>>>,
}

impl CountingPlayback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// (tracks, packets, bytes) received from a peer so far
    #[must_use]
    pub fn stats(&self, peer_id: &PeerId) -> Option<(u64, u64, u64)> {
        self.sinks.get(peer_id).map(|sink| {
            let stats = &sink.stats;
            (
                stats.tracks.load(Ordering::Relaxed),
                stats.packets.load(Ordering::Relaxed),
                stats.bytes.load(Ordering::Relaxed),
            )
        })
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.sinks.len()
    }
}

impl PlaybackSurface for CountingPlayback {
    fn sink_for(&self, peer_id: &PeerId) -> Option<Arc<dyn PlaybackSink>> {
        self.sinks
            .get(peer_id)
            .map(|sink| Arc::clone(sink.value()) as Arc<dyn PlaybackSink>)
    }

    fn create_sink(&self, peer_id: &PeerId) -> Arc<dyn PlaybackSink> {
        self.sinks
            .entry(peer_id.clone())
            .or_insert_with(|| {
                Arc::new(CountingSink {
                    peer_id: peer_id.clone(),
                    stats: Arc::new(PeerStats::default()),
                })
            })
            .clone()
    }
}

pub struct CountingSink {
    peer_id: PeerId,
    stats: Arc<PeerStats>,
}

impl PlaybackSink for CountingSink {
    fn attach(&self, mut track: RemoteTrack) {
        let stats = self.stats.clone();
        stats.tracks.fetch_add(1, Ordering::Relaxed);
        info!(peer_id = %self.peer_id, track_id = %track.id, kind = ?track.kind, "Playing remote track");

        tokio::spawn(async move {
            while let Some(packet) = track.packets.recv().await {
                stats.packets.fetch_add(1, Ordering::Relaxed);
                stats.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
            }
            debug!(peer_id = %track.peer_id, track_id = %track.id, "Remote track drained");
        });
    }
}
