//! # Storefront agents
//!
//! Three cooperating agents for a clothing store, built as Tower services on
//! top of OpenAI chat completions:
//!
//! - **Triage Agent**: the entry point; routes each request to a specialist
//! - **Stylist Agent**: fashion advice, with web search near the store's city
//! - **Customer Support Agent**: looks up past orders and files refunds
//!
//! Agents are declared as data ([`AgentSpec`]) and validated into an
//! [`AgentGraph`]. [`bind_graph`] turns the graph into a
//! [`HandoffCoordinator`] over any model provider, and a [`Conversation`]
//! drives it one client turn at a time, remembering which agent is active.
//! [`server::router`] serves conversations over a `/ws` WebSocket, with
//! optional voice turns through a [`voice::VoicePipeline`].
//!
//! Set your OpenAI API key in the `OPENAI_API_KEY` environment variable.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storefront_agents::provider::OpenAIProvider;
//! use storefront_agents::session::{ClientEvent, InputItem, ServerEvent};
//! use storefront_agents::{bind_graph, AgentGraph, Conversation, MockOrderBackend, StorefrontConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let graph = AgentGraph::storefront(
//!     Arc::new(MockOrderBackend::default()),
//!     &StorefrontConfig::default(),
//! )?;
//! let provider = OpenAIProvider::new(Arc::new(async_openai::Client::new()));
//! let mut conversation = Conversation::new(bind_graph(&graph, provider));
//!
//! let events = conversation
//!     .handle(ClientEvent::HistoryUpdate {
//!         inputs: vec![InputItem::user("I'd like a refund for ORD-123")],
//!         reset_agent: false,
//!     })
//!     .await?;
//! if let Some(ServerEvent::HistoryUpdated { inputs, agent_name }) = events.last() {
//!     println!("{agent_name}: {:?}", inputs.last());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod groups;
pub mod mock_api;
pub mod provider;
pub mod server;
pub mod session;
pub mod tools;
pub mod topology;
pub mod voice;

// Core module with main implementation
mod core;

// Re-export core types
pub use crate::core::{
    policies, system_message, tool_error_message, tool_message_content, tool_typed, Agent,
    AgentBuilder, AgentLoop, AgentLoopLayer, AgentPolicy, AgentRun, AgentStopReason, AgentSvc,
    CompositePolicy, LoopState, PolicyFn, ProviderSvc, Step, StepAux, StepLayer, StepOutcome,
    ToolDef, ToolInvocation, ToolOutput, ToolRouter, ToolSvc, UnknownTool,
};

// Public re-exports for convenience
pub use agents::{AgentRecord, AgentSpec, ModelSettings, STYLE_INSTRUCTIONS};
pub use config::{ConfigBuilder, StorefrontConfig};
pub use error::{Result, StorefrontError};
pub use groups::{bind_graph, HandoffCoordinator, RouteRequest, RoutedRun};
pub use mock_api::{MockOrderBackend, Order, OrderBackend, OrderItem, OrderStatus};
pub use session::Conversation;
pub use topology::{starting_agent, storefront_graph, AgentGraph};

// Re-export async-openai types that users need
pub use async_openai::{
    config::OpenAIConfig,
    types::{ChatCompletionRequestMessage, CreateChatCompletionRequest},
    Client,
};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
