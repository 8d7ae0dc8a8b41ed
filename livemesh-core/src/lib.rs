pub mod config;
pub mod connection;
pub mod error;
pub mod ice;
pub mod logging;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod stream;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use session::SessionState;
pub use stream::{StreamAlert, StreamCollaborators, StreamLifecycleController, StreamMode};
pub use types::{LocalIdentity, PeerId, TrackId};
