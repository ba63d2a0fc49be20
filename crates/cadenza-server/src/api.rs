use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use cadenza_shared::types::UserId;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::BucketLimiter;
use crate::registry::CallRegistry;
use crate::transport;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CallRegistry>,
    pub bucket_limiter: BucketLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/webrtc/ice", get(webrtc_config))
        .route("/webrtc/config", get(webrtc_config))
        .route("/livekit/token", get(relay_token))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    instance: String,
    active_calls: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instance: state.config.instance_name.clone(),
        active_calls: state.registry.active_call_count().await,
    })
}

#[derive(Deserialize)]
struct WsParams {
    /// Caller identity. Authentication happens upstream; the registry trusts
    /// the id handed to it here.
    user_id: Uuid,
    user_name: String,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    if !state.bucket_limiter.take(&addr.ip().to_string()).await {
        tracing::warn!(addr = %addr, "rate limited socket upgrade");
        return Err(ServerError::RateLimited);
    }

    let user = UserId(params.user_id);
    let registry = state.registry.clone();
    Ok(ws.on_upgrade(move |socket| {
        transport::run_connection(socket, user, params.user_name, registry)
    }))
}

/// NAT-traversal / relay-connection configuration, fetched once per call by
/// clients and cached for its duration.
#[derive(Serialize)]
struct WebRtcConfigResponse {
    ice_servers: Vec<IceServerEntry>,
    ice_candidate_pool_size: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    sfu: Option<SfuEntry>,
}

#[derive(Serialize)]
struct IceServerEntry {
    urls: Vec<String>,
}

#[derive(Serialize)]
struct SfuEntry {
    json_rpc_url: String,
}

async fn webrtc_config(State(state): State<AppState>) -> Json<WebRtcConfigResponse> {
    Json(WebRtcConfigResponse {
        ice_servers: state
            .config
            .ice_servers
            .iter()
            .map(|url| IceServerEntry { urls: vec![url.clone()] })
            .collect(),
        ice_candidate_pool_size: state.config.ice_candidate_pool_size,
        sfu: state
            .config
            .sfu_rpc_url
            .as_ref()
            .map(|url| SfuEntry { json_rpc_url: url.clone() }),
    })
}

#[derive(Deserialize)]
struct TokenParams {
    room: String,
    identity: String,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    expires_at: i64,
}

/// Mint a short-lived relay-admission credential.  Real deployments delegate
/// issuance to the relay's own key material; this shape is the contract the
/// client consumes.
async fn relay_token(
    State(state): State<AppState>,
    Query(params): Query<TokenParams>,
) -> Result<Json<TokenResponse>, ServerError> {
    if params.room.is_empty() || params.identity.is_empty() {
        return Err(ServerError::BadRequest("room and identity are required".into()));
    }

    let expires_at =
        chrono::Utc::now().timestamp() + state.config.relay_token_ttl_secs as i64;
    let token = format!("{}.{}", Uuid::new_v4().simple(), expires_at);

    tracing::debug!(room = %params.room, identity = %params.identity, "minted relay token");

    Ok(Json(TokenResponse { token, expires_at }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting signaling server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
