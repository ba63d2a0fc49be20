//! # cadenza-server
//!
//! Signaling server for Cadenza calls.
//!
//! This binary provides:
//! - **Call registry**: the authority over active calls, rosters, and their
//!   owning chats
//! - **Signal transport**: one WebSocket per client carrying command/reply
//!   frames and registry events
//! - **Rate limiting**: per-(user, event) fixed windows at the registry
//!   boundary and per-address buckets at socket accept
//! - **REST API** (axum) for health checks, WebRTC/ICE configuration, and
//!   relay-admission tokens

mod api;
mod config;
mod error;
mod rate_limit;
mod registry;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::{BucketLimiter, EventLimiter};
use crate::registry::CallRegistry;
use crate::transport::TransportHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cadenza_server=debug")),
        )
        .init();

    info!("Starting Cadenza signaling server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let hub = TransportHub::new();
    let event_limiter = EventLimiter::default();
    let bucket_limiter = BucketLimiter::default();
    let registry = CallRegistry::new(hub, event_limiter);

    let app_state = AppState {
        registry,
        bucket_limiter: bucket_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic bucket cleanup (every 5 minutes, evict buckets idle >10 min).
    // The event limiter sweeps itself lazily on every take.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            bucket_limiter.purge_stale(Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
