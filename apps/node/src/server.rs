//! HTTP + WebSocket server
//!
//! - `GET /` plaintext greeting; a WebSocket upgrade on `/` or `/ws` speaks the
//!   client protocol
//! - `GET /status`, `GET /ledger` JSON views for tooling
//! - `GET /peer` upgrades to a peer link

use crate::peer::{self, PeerHub};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, Method},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use starfs_core::{FileRegistry, Ledger, RequestHandler};
use starfs_types::{LedgerSnapshot, NodeConfig, NodeStatus};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

/// Plaintext answer to a plain `GET /`
pub const ROOT_GREETING: &str = "StarFS Node";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub handler: RequestHandler,
    pub ledger: Ledger,
    pub registry: FileRegistry,
    pub hub: Arc<PeerHub>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(handle_root))
        .route("/ws", get(handle_client_ws))
        .route("/status", get(handle_status))
        .route("/ledger", get(handle_ledger))
        .route("/peer", get(handle_peer_ws))
        .layer(cors)
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("StarFS node listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============================================================================
// HTTP Handlers
// ============================================================================

type SharedState = State<AppState>;

async fn handle_root(State(state): SharedState, ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| client_session(socket, state.handler))
            .into_response(),
        None => ROOT_GREETING.into_response(),
    }
}

async fn handle_client_ws(State(state): SharedState, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state.handler))
}

async fn handle_status(State(state): SharedState) -> Json<NodeStatus> {
    Json(NodeStatus {
        address: state.config.address.clone(),
        difficulty: state.config.difficulty,
        step: state.config.step,
        files: state.registry.len(),
        peers: state.hub.peer_count(),
        balance: state.ledger.balance(&state.config.address).unwrap_or(0),
    })
}

async fn handle_ledger(State(state): SharedState) -> Json<LedgerSnapshot> {
    Json(state.ledger.snapshot())
}

async fn handle_peer_ws(State(state): SharedState, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| peer_session(socket, state))
}

// ============================================================================
// WebSocket Sessions
// ============================================================================

/// One client connection: every text frame is a request, answered in order
async fn client_session(mut socket: WebSocket, handler: RequestHandler) {
    debug!("Client connected");
    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let reply = handler.handle_text(&text);
        let body = match serde_json::to_string(&reply) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode reply: {}", e);
                continue;
            }
        };
        if socket.send(Message::Text(body)).await.is_err() {
            break;
        }
    }
    debug!("Client disconnected");
}

async fn peer_session(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let outgoing = sink.with(|text: String| {
        futures::future::ready(Ok::<_, axum::Error>(Message::Text(text)))
    });
    let incoming = stream
        .take_while(|frame| {
            futures::future::ready(matches!(frame, Ok(m) if !matches!(m, Message::Close(_))))
        })
        .filter_map(|frame| {
            futures::future::ready(match frame {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });
    peer::run_link(state.hub, state.ledger, Box::pin(incoming), Box::pin(outgoing)).await;
}
