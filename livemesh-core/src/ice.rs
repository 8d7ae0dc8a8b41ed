//! ICE server configuration
//!
//! ## Sources
//! - `HttpIceConfigProvider`: asks a trusted backend for transient relay credentials
//! - `TurnSecretIceConfigProvider`: issues coturn `static-auth-secret` credentials locally
//! - `StaticIceConfigProvider`: a fixed list, normally public STUN servers
//!
//! ## Credential Generation
//! TURN credentials follow the RFC 5389 long-term credential scheme used by
//! coturn's `static-auth-secret` mode:
//! - Username: `<expiry_timestamp>:<peer_id>`
//! - Password: base64(HMAC-SHA1(secret, username))

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{IceConfig, IceMode};
use crate::types::PeerId;
use crate::{Error, Result};

/// Public STUN servers used when no credentials can be obtained
pub const PUBLIC_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Whether this entry relays media (a TURN server)
    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceServerList(Vec<IceServer>);

impl IceServerList {
    #[must_use]
    pub const fn new(servers: Vec<IceServer>) -> Self {
        Self(servers)
    }

    /// Google's public STUN servers, no relay
    #[must_use]
    pub fn public_stun_defaults() -> Self {
        Self(PUBLIC_STUN_SERVERS.iter().map(|u| IceServer::stun(*u)).collect())
    }

    #[must_use]
    pub fn servers(&self) -> &[IceServer] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn has_relay(&self) -> bool {
        self.0.iter().any(IceServer::is_relay)
    }
}

impl From<Vec<IceServer>> for IceServerList {
    fn from(servers: Vec<IceServer>) -> Self {
        Self(servers)
    }
}

/// Source of ICE servers for a stream session
///
/// Called once per session. Implementations do not retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IceConfigProvider: Send + Sync {
    /// Fails with `CredentialUnavailable` when the source errors or has no servers.
    async fn fetch_ice_servers(&self) -> Result<IceServerList>;
}

/// Fetches ICE servers from an HTTP credential endpoint
///
/// Expects `{"ice_servers": [{"urls": [...], "username": ..., "credential": ...}]}`.
pub struct HttpIceConfigProvider {
    http_client: Client,
    endpoint: String,
    bearer_token: Option<String>,
}

#[derive(Deserialize)]
struct IceServersResponse {
    #[serde(alias = "iceServers")]
    ice_servers: Vec<IceServer>,
}

impl HttpIceConfigProvider {
    pub fn new(
        endpoint: impl Into<String>,
        bearer_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            bearer_token,
        })
    }
}

#[async_trait]
impl IceConfigProvider for HttpIceConfigProvider {
    async fn fetch_ice_servers(&self) -> Result<IceServerList> {
        let mut request = self.http_client.get(&self.endpoint);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::CredentialUnavailable(format!("Failed to reach credential endpoint: {e}")))?
            .error_for_status()
            .map_err(|e| Error::CredentialUnavailable(format!("Credential endpoint error: {e}")))?;

        let body: IceServersResponse = resp
            .json()
            .await
            .map_err(|e| Error::CredentialUnavailable(format!("Failed to parse ICE servers: {e}")))?;

        if body.ice_servers.is_empty() {
            return Err(Error::CredentialUnavailable(
                "Credential endpoint returned no ICE servers".to_string(),
            ));
        }

        debug!(count = body.ice_servers.len(), "Fetched ICE servers");
        Ok(IceServerList(body.ice_servers))
    }
}

/// TURN credentials (username and password)
#[derive(Debug, Clone)]
pub struct TurnCredential {
    /// Username in format: "<timestamp>:<`peer_id`>"
    pub username: String,

    /// HMAC-SHA1 based password
    pub password: String,

    pub expires_at: DateTime<Utc>,
}

impl TurnCredential {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// TURN server settings for locally issued credentials
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub server_url: String,

    /// Must match coturn's `static-auth-secret`
    pub static_secret: String,

    pub credential_ttl: Duration,

    /// Also advertise the `turns:` variant
    pub use_tls: bool,
}

impl TurnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(Error::Configuration("TURN server URL is empty".to_string()));
        }

        if !self.server_url.starts_with("turn:") && !self.server_url.starts_with("turns:") {
            return Err(Error::Configuration(
                "TURN server URL must start with 'turn:' or 'turns:'".to_string(),
            ));
        }

        if self.static_secret.is_empty() {
            return Err(Error::Configuration("TURN static secret is empty".to_string()));
        }

        if self.credential_ttl.as_secs() < 60 {
            return Err(Error::Configuration(
                "TURN credential TTL should be at least 60 seconds".to_string(),
            ));
        }

        if self.credential_ttl.as_secs() > 86400 * 7 {
            return Err(Error::Configuration(
                "TURN credential TTL should not exceed 7 days".to_string(),
            ));
        }

        Ok(())
    }
}

/// Issues time-limited TURN credentials for the local peer, plus public STUN
pub struct TurnSecretIceConfigProvider {
    config: TurnConfig,
    peer_id: PeerId,
}

impl TurnSecretIceConfigProvider {
    pub fn new(config: TurnConfig, peer_id: PeerId) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, peer_id })
    }

    /// Generate a credential valid for the configured TTL
    pub fn generate_credential(&self) -> Result<TurnCredential> {
        let ttl = chrono::Duration::from_std(self.config.credential_ttl)
            .map_err(|e| Error::Configuration(format!("Invalid TURN credential TTL: {e}")))?;
        self.credential_expiring_at(Utc::now() + ttl)
    }

    fn credential_expiring_at(&self, expires_at: DateTime<Utc>) -> Result<TurnCredential> {
        let username = format!("{}:{}", expires_at.timestamp(), self.peer_id);
        let password = self.compute_hmac(&username)?;

        Ok(TurnCredential {
            username,
            password,
            expires_at,
        })
    }

    fn compute_hmac(&self, username: &str) -> Result<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.config.static_secret.as_bytes())
            .map_err(|e| Error::CredentialUnavailable(format!("Failed to create HMAC: {e}")))?;

        mac.update(username.as_bytes());
        let result = mac.finalize();
        Ok(base64::engine::general_purpose::STANDARD.encode(result.into_bytes()))
    }

    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        let mut urls = vec![self.config.server_url.clone()];

        if self.config.use_tls {
            let tls_url = self.config.server_url.replace("turn:", "turns:");
            if tls_url != self.config.server_url {
                urls.push(tls_url);
            }
        }

        urls
    }
}

#[async_trait]
impl IceConfigProvider for TurnSecretIceConfigProvider {
    async fn fetch_ice_servers(&self) -> Result<IceServerList> {
        let credential = self.generate_credential()?;

        let mut servers = IceServerList::public_stun_defaults().0;
        servers.push(IceServer {
            urls: self.urls(),
            username: Some(credential.username),
            credential: Some(credential.password),
        });

        debug!(expires_at = %credential.expires_at, "Issued TURN credential");
        Ok(IceServerList(servers))
    }
}

/// Always returns the same servers
pub struct StaticIceConfigProvider {
    servers: IceServerList,
}

impl StaticIceConfigProvider {
    #[must_use]
    pub const fn new(servers: IceServerList) -> Self {
        Self { servers }
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IceServerList(urls.into_iter().map(IceServer::stun).collect()))
    }
}

#[async_trait]
impl IceConfigProvider for StaticIceConfigProvider {
    async fn fetch_ice_servers(&self) -> Result<IceServerList> {
        if self.servers.is_empty() {
            return Err(Error::CredentialUnavailable(
                "No static ICE servers configured".to_string(),
            ));
        }
        Ok(self.servers.clone())
    }
}

/// Build the provider selected by `config.mode`
pub fn provider_from_config(
    config: &IceConfig,
    peer_id: &PeerId,
) -> Result<Arc<dyn IceConfigProvider>> {
    let provider: Arc<dyn IceConfigProvider> = match config.mode {
        IceMode::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| Error::Configuration("ice.endpoint is not set".to_string()))?;
            Arc::new(HttpIceConfigProvider::new(
                endpoint,
                config.bearer_token.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )?)
        }
        IceMode::TurnSecret => {
            let turn = TurnConfig {
                server_url: config.turn_server_url.clone().unwrap_or_default(),
                static_secret: config.turn_static_secret.clone().unwrap_or_default(),
                credential_ttl: Duration::from_secs(config.turn_credential_ttl_secs),
                use_tls: config.turn_use_tls,
            };
            Arc::new(TurnSecretIceConfigProvider::new(turn, peer_id.clone())?)
        }
        IceMode::Static => Arc::new(StaticIceConfigProvider::from_urls(
            config.static_servers.iter().cloned(),
        )),
    };

    info!(mode = ?config.mode, "ICE config provider ready");
    Ok(provider)
}
