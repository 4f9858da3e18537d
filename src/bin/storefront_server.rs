//! WebSocket server for the storefront chat client.
//!
//! Serves `/ws` on `STOREFRONT_LISTEN_ADDR` (default `0.0.0.0:8000`). Text and
//! voice turns both go through the OpenAI API. Configuration comes from the
//! TOML file named by `STOREFRONT_CONFIG` if set, otherwise from
//! `STOREFRONT_*` variables.

use std::net::SocketAddr;
use std::sync::Arc;

use storefront_agents::provider::OpenAIProvider;
use storefront_agents::server::{serve, ServerState};
use storefront_agents::voice::OpenAIVoice;
use storefront_agents::{config, AgentGraph, MockOrderBackend, StorefrontError};
use tower::BoxError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match std::env::var("STOREFRONT_CONFIG") {
        Ok(path) => config::from_file(path)?,
        Err(_) => config::from_env()?,
    };
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| StorefrontError::Config {
            message: format!("listen_addr={}: {e}", config.listen_addr),
        })?;
    info!(model = %config.model, city = %config.search_city, "starting storefront server");

    let graph = AgentGraph::storefront(Arc::new(MockOrderBackend::default()), &config)?;
    debug!(graph = %serde_json::to_string(&graph.describe())?, "agent graph");

    let client = Arc::new(async_openai::Client::new());
    let state = ServerState::new(graph, OpenAIProvider::new(client.clone()))
        .with_voice(Arc::new(OpenAIVoice::new(client)));
    serve(addr, state).await
}
