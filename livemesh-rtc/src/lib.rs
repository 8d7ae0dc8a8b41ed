//! WebRTC media plumbing for livemesh
//!
//! Implements the core's connection and media boundaries on top of the
//! `webrtc` crate.

pub mod connection;
pub mod convert;
pub mod media;

pub use connection::{WebRtcConnection, WebRtcConnectionFactory};
pub use media::{CountingPlayback, SyntheticMediaSource};
