//! Axum-based HTTP gateway: health surface plus the `/ws` login channel.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (30s); upgraded WebSocket connections are not affected
//! - CORS restricted to the configured frontend origin
//! - Graceful shutdown on SIGINT/SIGTERM, followed by teardown of every live session

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::lifecycle::{spawn_cleanup_scheduler, SessionManager};
use crate::metrics::Metrics;
use crate::protocol::{BridgeClient, ProtocolClient};
use crate::relay::{ClientMessage, EventRelay, ServerMessage, UNSUPPORTED_REQUEST};
use crate::session::{ChannelId, LoginMode};

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

const SERVICE_NAME: &str = "Mark Sumo Session Service";

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
}

/// Run the gateway until a termination signal arrives, then tear down every
/// live session.
pub async fn run_gateway(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    let store = CredentialStore::new(&config.sessions_dir);
    let purged = store.purge().await?;
    if purged > 0 {
        tracing::info!(purged, root = %store.root().display(), "Removed stale credential directories");
    }

    let protocol: Arc<dyn ProtocolClient> =
        Arc::new(BridgeClient::new(config.protocol.bridge_url.clone()));
    let metrics = Arc::new(Metrics::new()?);
    let sessions = SessionManager::new(
        protocol,
        store,
        config.connect_options(),
        config.completion_grace(),
        Arc::new(EventRelay::new()),
        Arc::clone(&metrics),
    );

    let shutdown = CancellationToken::new();
    let scheduler = spawn_cleanup_scheduler(
        Arc::clone(&sessions),
        config.sweep_interval(),
        config.session_timeout(),
        shutdown.clone(),
    );

    let state = AppState {
        sessions: Arc::clone(&sessions),
        metrics,
    };
    let app = build_router(state, &config.frontend_url)?;

    tracing::info!(
        addr = %actual_addr,
        frontend = %config.frontend_url,
        bridge = %config.protocol.bridge_url,
        session_timeout_ms = config.session_timeout_ms,
        "Session service listening"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler.await {
        tracing::warn!(error = %e, "Cleanup scheduler ended abnormally");
    }
    sessions.shutdown().await;
    Ok(())
}

/// Build the router with its middleware stack.
pub fn build_router(state: AppState, frontend_url: &str) -> Result<Router> {
    let origin = HeaderValue::from_str(frontend_url)
        .with_context(|| format!("Invalid frontend origin {frontend_url:?}"))?;

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    Ok(Router::new()
        .route("/", get(handle_root))
        .route("/api/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/ws", get(handle_ws))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// `GET /`: liveness
async fn handle_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /api/health`: live session count
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "activeSessions": state.sessions.count(),
    }))
}

/// `GET /metrics`: Prometheus text exposition
async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

/// `GET /ws`: WebSocket upgrade for the login channel.
///
/// Each connection is one channel: it may own at most one session at a time,
/// and closing it tears that session down.
async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state.sessions))
}

async fn handle_ws_connection(socket: WebSocket, sessions: Arc<SessionManager>) {
    use futures_util::{SinkExt, StreamExt};

    let channel_id = ChannelId::new();
    let mut outbound = sessions.relay().register_channel(channel_id);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    tracing::debug!(channel_id = %channel_id, "Client connected");

    // Forward relayed events to this client, in order.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if ws_sender
                .send(Message::Text(message.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => handle_client_frame(&sessions, channel_id, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    sessions.channel_closed(&channel_id).await;
    send_task.abort();
    tracing::debug!(channel_id = %channel_id, "Client disconnected");
}

/// Act on one text frame from a client.
async fn handle_client_frame(sessions: &Arc<SessionManager>, channel_id: ChannelId, text: &str) {
    let login_mode = match ClientMessage::parse(text) {
        Some(ClientMessage::CreateSession) => LoginMode::Qr,
        Some(ClientMessage::CreatePairingSession { phone_number }) => {
            match LoginMode::phone_pairing(&phone_number) {
                Ok(mode) => mode,
                Err(e) => {
                    tracing::info!(channel_id = %channel_id, error = %e, "Rejected pairing request");
                    sessions
                        .relay()
                        .send_to_channel(&channel_id, ServerMessage::failure(e.failure_reason()));
                    return;
                }
            }
        }
        None => {
            tracing::debug!(channel_id = %channel_id, "Unsupported client frame");
            sessions
                .relay()
                .send_to_channel(&channel_id, ServerMessage::error(UNSUPPORTED_REQUEST));
            return;
        }
    };

    // Failures have already been reported to the client.
    if let Err(e) = sessions.create_session(channel_id, login_mode).await {
        tracing::warn!(channel_id = %channel_id, error = %e, "Session creation failed");
    }
}
