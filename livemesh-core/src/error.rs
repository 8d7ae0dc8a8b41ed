use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("ICE credentials unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Malformed signaling payload: {0}")]
    MalformedSignalingPayload(String),

    #[error("Stale signaling message: {0}")]
    StaleSignalingMessage(String),

    #[error("Publish failure: {0}")]
    PublishFailure(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Cloneable classification of an [`Error`], used where the error itself
/// has to be observed by several parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MediaAccessDenied,
    CredentialUnavailable,
    MalformedSignalingPayload,
    StaleSignalingMessage,
    PublishFailure,
    Transport,
    Internal,
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MediaAccessDenied(_) => ErrorKind::MediaAccessDenied,
            Self::CredentialUnavailable(_) => ErrorKind::CredentialUnavailable,
            Self::MalformedSignalingPayload(_) => ErrorKind::MalformedSignalingPayload,
            Self::StaleSignalingMessage(_) => ErrorKind::StaleSignalingMessage,
            Self::PublishFailure(_) => ErrorKind::PublishFailure,
            Self::Redis(_) | Self::Http(_) | Self::Connection(_) => ErrorKind::Transport,
            Self::Serialization(_)
            | Self::InvalidState(_)
            | Self::NotFound(_)
            | Self::Configuration(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure is something the user has to act on.
    #[must_use]
    pub const fn is_user_actionable(&self) -> bool {
        matches!(self, Self::MediaAccessDenied(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
