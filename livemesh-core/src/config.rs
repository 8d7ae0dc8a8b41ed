use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{LocalIdentity, PeerId};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
    pub ice: IceConfig,
    pub mailbox: MailboxConfig,
    pub presence: PresenceConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub peer_id: String,
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            display_name: "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Where ICE server credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceMode {
    /// Ask a trusted backend endpoint for transient credentials
    Http,
    /// Issue coturn `static-auth-secret` credentials locally
    TurnSecret,
    /// Use `static_servers` as-is (STUN only, no relay)
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub mode: IceMode,
    /// Credential endpoint for `IceMode::Http`
    pub endpoint: Option<String>,
    /// Optional bearer token sent to the credential endpoint
    pub bearer_token: Option<String>,
    /// TURN server URL for `IceMode::TurnSecret` (e.g. "turn:turn.example.com:3478")
    pub turn_server_url: Option<String>,
    /// Must match coturn's `static-auth-secret`
    pub turn_static_secret: Option<String>,
    /// TURN credential TTL in seconds
    pub turn_credential_ttl_secs: u64,
    pub turn_use_tls: bool,
    /// STUN URLs used in `IceMode::Static` and as the degraded-mode fallback
    pub static_servers: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            mode: IceMode::Static,
            endpoint: None,
            bearer_token: None,
            turn_server_url: None,
            turn_static_secret: None,
            turn_credential_ttl_secs: 86400,
            turn_use_tls: false,
            static_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxBackend {
    /// In-process mailboxes; only peers inside one process can reach each other
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub backend: MailboxBackend,
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            backend: MailboxBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "livemesh:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Base URL of the presence backend; presence notifications are disabled when unset
    pub endpoint: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_secs: 5,
        }
    }
}

/// What `start_stream` does when ICE credentials cannot be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    /// Continue with public STUN servers and raise a warning
    #[default]
    Degrade,
    /// Fail the start with `CredentialUnavailable`
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub credential_policy: CredentialPolicy,
    /// Viewers to offer to as soon as the stream starts
    pub target_peers: Vec<String>,
    /// An offer left unanswered this long may be regenerated
    pub offer_timeout_secs: u64,
    /// Capacity of the per-session connection event channel
    pub event_channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            credential_policy: CredentialPolicy::Degrade,
            target_peers: Vec::new(),
            offer_timeout_secs: 30,
            event_channel_capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVEMESH_IDENTITY__PEER_ID, LIVEMESH_MAILBOX__REDIS_URL, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVEMESH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("stream.target_peers")
                .with_list_parse_key("ice.static_servers"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn local_identity(&self) -> LocalIdentity {
        LocalIdentity::new(self.identity.peer_id.as_str(), self.identity.display_name.as_str())
    }

    #[must_use]
    pub fn target_peers(&self) -> Vec<PeerId> {
        self.stream
            .target_peers
            .iter()
            .map(|p| PeerId::new(p.as_str()))
            .collect()
    }

    /// Check the configuration, collecting every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.identity.peer_id.trim().is_empty() {
            errors.push("identity.peer_id must not be empty".to_string());
        }

        if !matches!(
            self.logging.format.as_str(),
            "json" | "pretty"
        ) {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        match self.ice.mode {
            IceMode::Http => {
                if self.ice.endpoint.as_deref().is_none_or(str::is_empty) {
                    errors.push("ice.endpoint is required when ice.mode = http".to_string());
                }
            }
            IceMode::TurnSecret => {
                if self.ice.turn_server_url.as_deref().is_none_or(str::is_empty) {
                    errors.push(
                        "ice.turn_server_url is required when ice.mode = turn_secret".to_string(),
                    );
                }
                if self.ice.turn_static_secret.as_deref().is_none_or(str::is_empty) {
                    errors.push(
                        "ice.turn_static_secret is required when ice.mode = turn_secret"
                            .to_string(),
                    );
                }
            }
            IceMode::Static => {
                if self.ice.static_servers.is_empty() {
                    errors.push("ice.static_servers must not be empty when ice.mode = static".to_string());
                }
            }
        }

        if self.mailbox.backend == MailboxBackend::Redis && self.mailbox.redis_url.is_empty() {
            errors.push("mailbox.redis_url is required when mailbox.backend = redis".to_string());
        }

        if self.stream.event_channel_capacity == 0 {
            errors.push("stream.event_channel_capacity must be greater than zero".to_string());
        }

        if self.stream.offer_timeout_secs == 0 {
            errors.push("stream.offer_timeout_secs must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
