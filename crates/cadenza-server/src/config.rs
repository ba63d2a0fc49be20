//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;

use cadenza_shared::constants::{DEFAULT_HTTP_PORT, FALLBACK_STUN_URL};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// ICE server URLs handed to clients via `/webrtc/config`,
    /// comma-separated.
    /// Env: `ICE_SERVERS`
    /// Default: the public STUN fallback.
    pub ice_servers: Vec<String>,

    /// ICE candidate pool size advertised to clients.
    /// Env: `ICE_CANDIDATE_POOL_SIZE`
    /// Default: `2`
    pub ice_candidate_pool_size: u8,

    /// JSON-RPC URL of the media relay (SFU), if one is deployed.
    /// Env: `SFU_RPC_URL`
    /// Default: none (direct calls only).
    pub sfu_rpc_url: Option<String>,

    /// Lifetime of relay-admission tokens minted by `/livekit/token`.
    /// Env: `RELAY_TOKEN_TTL_SECS`
    /// Default: `600`
    pub relay_token_ttl_secs: u64,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Cadenza Registry"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            ice_servers: vec![FALLBACK_STUN_URL.to_string()],
            ice_candidate_pool_size: 2,
            sfu_rpc_url: None,
            relay_token_ttl_secs: 600,
            instance_name: "Cadenza Registry".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(servers) = std::env::var("ICE_SERVERS") {
            let parsed: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                config.ice_servers = parsed;
            }
        }

        if let Ok(val) = std::env::var("ICE_CANDIDATE_POOL_SIZE") {
            if let Ok(n) = val.parse::<u8>() {
                config.ice_candidate_pool_size = n;
            }
        }

        if let Ok(url) = std::env::var("SFU_RPC_URL") {
            if !url.is_empty() {
                config.sfu_rpc_url = Some(url);
            }
        }

        if let Ok(val) = std::env::var("RELAY_TOKEN_TTL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.relay_token_ttl_secs = n;
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        config
    }
}
