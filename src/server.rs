//! WebSocket front end for the chat client
//!
//! `GET /ws` upgrades to a socket that carries one [`Conversation`] for its
//! whole lifetime. Every text frame is a JSON [`ClientEvent`]; the reply events
//! go back as JSON text frames in order.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use tower::BoxError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn, Instrument};

use crate::groups::{bind_graph, HandoffCoordinator};
use crate::provider::ModelService;
use crate::session::{ClientEvent, Conversation, ServerEvent};
use crate::topology::AgentGraph;
use crate::voice::VoicePipeline;

type BindFn = dyn Fn() -> HandoffCoordinator + Send + Sync;

/// Shared state: how to start a fresh conversation for a new socket.
#[derive(Clone)]
pub struct ServerState {
    bind: Arc<BindFn>,
    voice: Option<Arc<dyn VoicePipeline>>,
}

impl ServerState {
    /// Every socket gets its own agents bound to a clone of `provider`.
    pub fn new<P>(graph: AgentGraph, provider: P) -> Self
    where
        P: ModelService + Clone + Send + Sync + 'static,
        P::Future: Send + 'static,
    {
        Self {
            bind: Arc::new(move || bind_graph(&graph, provider.clone())),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: Arc<dyn VoicePipeline>) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn conversation(&self) -> Conversation {
        let conversation = Conversation::new((self.bind)());
        match &self.voice {
            Some(voice) => conversation.with_voice(voice.clone()),
            None => conversation,
        }
    }
}

/// Routes: `/ws` for the chat socket and `/health` for liveness checks.
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(|| async { "OK" }))
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: SocketAddr, state: ServerState) -> Result<(), BoxError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("storefront server listening on {}", listener.local_addr()?);
    info!("WebSocket endpoint: ws://{}/ws", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("socket", id = %uuid::Uuid::new_v4());
        handle_socket(socket, state).instrument(span)
    })
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    info!("client connected");
    let mut conversation = state.conversation();

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("client closed connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        };

        for event in handle_frame(&mut conversation, text.as_str()).await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("failed to encode server event: {}", e);
                    continue;
                }
            };
            if socket.send(Message::Text(payload.into())).await.is_err() {
                debug!("client went away mid-reply");
                return;
            }
        }
    }
    debug!(agent = %conversation.active_agent(), "socket closed");
}

/// Parse one text frame and run it through `conversation`.
///
/// Failures become a single `error` event; the conversation stays usable.
pub async fn handle_frame(conversation: &mut Conversation, text: &str) -> Vec<ServerEvent> {
    let result = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => conversation.handle(event).await,
        Err(e) => Err(e.into()),
    };
    result.unwrap_or_else(|e| {
        error!("Error handling message: {}", e);
        vec![ServerEvent::Error {
            message: e.to_string(),
        }]
    })
}
