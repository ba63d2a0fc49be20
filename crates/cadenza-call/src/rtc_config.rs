//! WebRTC configuration and relay-token fetch.
//!
//! Peer connections are configured from the server's `/webrtc/config`
//! endpoint.  The fetch is cached for the lifetime of this client value, one
//! value per call, so a call never mixes ICE configurations mid-flight.  When
//! the server is unreachable the hardcoded public STUN fallback keeps direct
//! calls possible; relay tokens have no such fallback and the error
//! propagates.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use cadenza_shared::constants::FALLBACK_STUN_URL;

#[derive(Error, Debug)]
pub enum RtcConfigError {
    #[error("config request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server has no media relay configured")]
    NoRelay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SfuConfig {
    pub json_rpc_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    #[serde(default)]
    pub sfu: Option<SfuConfig>,
}

impl RtcConfig {
    /// Minimal configuration for when the server cannot be reached.
    pub fn fallback() -> Self {
        Self {
            ice_servers: vec![IceServer { urls: vec![FALLBACK_STUN_URL.to_string()] }],
            ice_candidate_pool_size: 0,
            sfu: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches and caches the RTC configuration for one call.
pub struct RtcConfigClient {
    http: reqwest::Client,
    base_url: String,
    cached: Option<RtcConfig>,
}

impl RtcConfigClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            cached: None,
        }
    }

    /// The configuration for this call: fetched once, cached afterwards.
    /// An unreachable server degrades to [`RtcConfig::fallback`] (uncached,
    /// so a later retry can still pick up the real configuration).
    pub async fn get(&mut self) -> RtcConfig {
        if let Some(config) = &self.cached {
            return config.clone();
        }
        match self.fetch().await {
            Ok(config) => {
                debug!(
                    ice_servers = config.ice_servers.len(),
                    has_sfu = config.sfu.is_some(),
                    "fetched webrtc config"
                );
                self.cached = Some(config.clone());
                config
            }
            Err(e) => {
                warn!(error = %e, "webrtc config unreachable, using stun fallback");
                RtcConfig::fallback()
            }
        }
    }

    async fn fetch(&self) -> Result<RtcConfig, RtcConfigError> {
        let url = format!("{}/webrtc/config", self.base_url);
        let config = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<RtcConfig>()
            .await?;
        Ok(config)
    }

    /// Mint a relay access token for `identity` in `room`.  No fallback: a
    /// group call cannot proceed without one.
    pub async fn fetch_relay_token(
        &self,
        room: &str,
        identity: &str,
    ) -> Result<String, RtcConfigError> {
        let url = format!("{}/livekit/token", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("room", room), ("identity", identity)])
            .send()
            .await?
            .error_for_status()?
            .json::<TokenResponse>()
            .await?;
        Ok(response.token)
    }
}
