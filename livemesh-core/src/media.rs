//! Local capture and remote playback boundaries
//!
//! Local tracks fan samples out over a broadcast channel so every peer
//! connection can read the same capture. Remote tracks hand packets to a
//! playback sink over a bounded channel.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{PeerId, TrackId};
use crate::Result;

/// Capacity of a local track's sample channel.
/// Slow readers lag and skip samples instead of stalling capture.
const TRACK_SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Capacity of a remote track's packet channel
pub const REMOTE_PACKET_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One encoded media frame
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// A captured track shared by every peer connection
#[derive(Debug)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub stream_id: String,
    samples: broadcast::Sender<MediaSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: impl Into<String>) -> Self {
        let (samples, _) = broadcast::channel(TRACK_SAMPLE_CHANNEL_CAPACITY);
        Self {
            id: TrackId::generate(),
            kind,
            stream_id: stream_id.into(),
            samples,
        }
    }

    /// Receive samples written after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.samples.subscribe()
    }

    /// Push a sample to every reader; returns how many readers got it.
    pub fn write_sample(&self, sample: MediaSample) -> usize {
        self.samples.send(sample).unwrap_or(0)
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.samples.receiver_count()
    }
}

/// The local capture: a set of tracks with a shared stop signal
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    tracks: Vec<Arc<LocalTrack>>,
    stop: CancellationToken,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
            stop: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Stop every track. Capture tasks watching `stop_token` wind down.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            debug!(stream_id = %self.id, tracks = self.tracks.len(), "Stopping local stream");
        }
        self.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// A track received from a remote peer
#[derive(Debug)]
pub struct RemoteTrack {
    pub peer_id: PeerId,
    pub id: TrackId,
    pub kind: TrackKind,
    pub stream_id: String,
    pub packets: mpsc::Receiver<Bytes>,
}

/// Access to local capture devices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fails with `MediaAccessDenied` when capture is not permitted.
    async fn acquire(&self) -> Result<LocalStream>;
}

/// Renders the tracks of one remote peer
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, track: RemoteTrack);
}

/// Where remote peers get rendered
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackSurface: Send + Sync {
    fn sink_for(&self, peer_id: &PeerId) -> Option<Arc<dyn PlaybackSink>>;

    fn create_sink(&self, peer_id: &PeerId) -> Arc<dyn PlaybackSink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_track_fans_out_samples() {
        let track = LocalTrack::new(TrackKind::Video, "stream");
        let mut a = track.subscribe();
        let mut b = track.subscribe();

        let sent = track.write_sample(MediaSample {
            data: Bytes::from_static(b"frame"),
            duration: Duration::from_millis(33),
        });

        assert_eq!(sent, 2);
        assert_eq!(a.recv().await.unwrap().data, Bytes::from_static(b"frame"));
        assert_eq!(b.recv().await.unwrap().data, Bytes::from_static(b"frame"));
    }

    #[test]
    fn test_write_without_readers_is_dropped() {
        let track = LocalTrack::new(TrackKind::Audio, "stream");
        assert_eq!(
            track.write_sample(MediaSample {
                data: Bytes::new(),
                duration: Duration::from_millis(20),
            }),
            0
        );
    }

    #[test]
    fn test_stream_stop_is_shared_by_clones() {
        let stream = LocalStream::new(
            "stream",
            vec![Arc::new(LocalTrack::new(TrackKind::Video, "stream"))],
        );
        let token = stream.stop_token();
        let clone = stream.clone();

        clone.stop();
        clone.stop();

        assert!(stream.is_stopped());
        assert!(token.is_cancelled());
    }
}
