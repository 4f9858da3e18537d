//! Multi-agent orchestration and handoffs
//!
//! Each agent in a group advertises one `transfer_to_<agent>` tool per outgoing
//! handoff edge. When the model calls one, the agent's loop stops, the tool
//! call is answered with the target's name, and the [`HandoffCoordinator`]
//! re-runs the whole transcript through the target agent. The coordinator
//! keeps going until an agent answers without handing off.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use storefront_agents::{bind_graph, AgentGraph, MockOrderBackend, StorefrontConfig};
//! # use storefront_agents::provider::OpenAIProvider;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = AgentGraph::storefront(Arc::new(MockOrderBackend::default()), &StorefrontConfig::default())?;
//! let provider = OpenAIProvider::new(Arc::new(async_openai::Client::new()));
//! let coordinator = bind_graph(&graph, provider);
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionTool, ChatCompletionToolType,
    CreateChatCompletionRequest, FunctionObject,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::{util::BoxCloneSyncService, BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::core::{
    is_system, Agent, AgentRun, AgentSvc, ToolInvocation, ToolOutput, ToolRouter, ToolSvc,
};
use crate::provider::ModelService;
use crate::topology::AgentGraph;

pub type AgentName = String;

// ================================================================================================
// Handoff Types
// ================================================================================================

/// Request to handoff conversation to another agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    /// Target agent to handoff to
    pub target_agent: String,
    /// Optional reason for the handoff
    pub reason: Option<String>,
}

/// A handoff that actually happened during a routed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub from_agent: AgentName,
    pub to_agent: AgentName,
    pub reason: Option<String>,
}

/// Defines the handoff tools an agent can call and how a call is interpreted.
pub trait HandoffPolicy: Send + Sync + 'static {
    /// Function specs advertised to the model alongside the agent's own tools.
    fn handoff_tools(&self) -> Vec<ChatCompletionTool>;

    /// Turn a handoff tool call into a request for the target agent.
    fn handle_handoff_tool(&self, invocation: &ToolInvocation) -> Result<HandoffRequest, BoxError>;

    fn is_handoff_tool(&self, tool_name: &str) -> bool;
}

pub const TRANSFER_TOOL_PREFIX: &str = "transfer_to_";

/// Name of the tool that transfers control to `agent`.
///
/// `"Customer Support Agent"` becomes `"transfer_to_customer_support_agent"`.
/// Characters outside ASCII letters and digits only separate words, so
/// different names can share a tool name; [`AgentGraph::new`] rejects those.
pub fn transfer_tool_name(agent: &str) -> String {
    let mut slug = String::with_capacity(agent.len());
    for word in agent.split(|c: char| !c.is_ascii_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        if !slug.is_empty() {
            slug.push('_');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    format!("{TRANSFER_TOOL_PREFIX}{slug}")
}

/// Handoff policy built from one agent's outgoing edges.
///
/// Tools are advertised in edge order, which keeps requests to the model
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct EdgeHandoffPolicy {
    edges: Vec<(String, AgentName)>,
}

impl EdgeHandoffPolicy {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentName>,
    {
        targets
            .into_iter()
            .fold(Self::default(), |policy, target| policy.add_target(target))
    }

    /// Add a handoff edge to `target`.
    pub fn add_target(mut self, target: impl Into<AgentName>) -> Self {
        let target = target.into();
        self.edges.push((transfer_tool_name(&target), target));
        self
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(|(_, target)| target.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn target_of(&self, tool_name: &str) -> Option<&AgentName> {
        self.edges
            .iter()
            .find(|(name, _)| name == tool_name)
            .map(|(_, target)| target)
    }
}

impl HandoffPolicy for EdgeHandoffPolicy {
    fn handoff_tools(&self) -> Vec<ChatCompletionTool> {
        trace!(count = self.edges.len(), "generating handoff tools");
        self.edges
            .iter()
            .map(|(tool_name, target_agent)| ChatCompletionTool {
                r#type: ChatCompletionToolType::Function,
                function: FunctionObject {
                    name: tool_name.clone(),
                    description: Some(format!(
                        "Handoff to the {target_agent} agent to handle the request."
                    )),
                    parameters: Some(json!({
                        "type": "object",
                        "properties": {
                            "reason": {
                                "type": "string",
                                "description": "Reason for the handoff"
                            }
                        }
                    })),
                    ..Default::default()
                },
            })
            .collect()
    }

    fn handle_handoff_tool(&self, invocation: &ToolInvocation) -> Result<HandoffRequest, BoxError> {
        let target_agent = self
            .target_of(&invocation.name)
            .ok_or_else(|| format!("Not a handoff tool: {}", invocation.name))?;

        let reason = invocation
            .arguments
            .get("reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(HandoffRequest {
            target_agent: target_agent.clone(),
            reason,
        })
    }

    fn is_handoff_tool(&self, tool_name: &str) -> bool {
        self.target_of(tool_name).is_some()
    }
}

// ================================================================================================
// Handoff layer over tool routing
// ================================================================================================

/// Layer that answers handoff tool calls and passes every other call through.
#[derive(Debug, Clone)]
pub struct HandoffLayer<P> {
    handoff_policy: P,
}

impl<P> HandoffLayer<P>
where
    P: HandoffPolicy,
{
    pub fn new(policy: P) -> Self {
        Self {
            handoff_policy: policy,
        }
    }
}

impl<S, P> Layer<S> for HandoffLayer<P>
where
    P: HandoffPolicy + Clone,
{
    type Service = HandoffService<S, P>;

    fn layer(&self, inner: S) -> Self::Service {
        HandoffService {
            inner,
            handoff_policy: self.handoff_policy.clone(),
        }
    }
}

/// Tool service with handoff awareness.
///
/// A handoff call never reaches the inner router; its output names the agent
/// taking over, e.g. `{"assistant": "Stylist Agent"}`.
#[derive(Debug, Clone)]
pub struct HandoffService<S, P> {
    inner: S,
    handoff_policy: P,
}

impl<S, P> Service<ToolInvocation> for HandoffService<S, P>
where
    S: Service<ToolInvocation, Response = ToolOutput, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    P: HandoffPolicy + Clone,
{
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        if self.handoff_policy.is_handoff_tool(&req.name) {
            let policy = self.handoff_policy.clone();
            Box::pin(async move {
                let handoff = policy.handle_handoff_tool(&req)?;
                debug!(tool = %req.name, target = %handoff.target_agent, "handoff tool called");
                Ok(ToolOutput {
                    id: req.id,
                    result: json!({ "assistant": handoff.target_agent }),
                })
            })
        } else {
            let future = self.inner.call(req);
            Box::pin(future)
        }
    }
}

/// Wrap a tool router so the agent's handoff tools resolve through `policy`.
pub fn layer_tool_router_with_handoff<P>(router: ToolRouter, policy: P) -> ToolSvc
where
    P: HandoffPolicy + Clone,
{
    BoxCloneSyncService::new(HandoffLayer::new(policy).layer(router))
}

// ================================================================================================
// Coordinator
// ================================================================================================

/// Run a transcript starting at a specific agent.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub agent: AgentName,
    pub messages: Vec<ChatCompletionRequestMessage>,
}

/// Result of a routed run: who answered last and how control got there.
#[derive(Debug, Clone)]
pub struct RoutedRun {
    /// Agent that produced the final answer
    pub agent: AgentName,
    /// Full transcript across every agent involved, steps summed
    pub run: AgentRun,
    /// Handoffs in the order they happened
    pub handoffs: Vec<HandoffEvent>,
}

/// Service that runs agents and follows their handoffs.
///
/// There is no cap on the number of handoffs; the graph alone decides where
/// control can go.
pub struct HandoffCoordinator {
    agents: Arc<tokio::sync::Mutex<HashMap<AgentName, AgentSvc>>>,
    policies: Arc<HashMap<AgentName, EdgeHandoffPolicy>>,
    starting_agent: AgentName,
}

impl HandoffCoordinator {
    pub fn starting_agent(&self) -> &str {
        &self.starting_agent
    }

    /// Handoff targets available from `agent`, in advertised order.
    pub fn handoff_targets(&self, agent: &str) -> Vec<AgentName> {
        self.policies
            .get(agent)
            .map(|p| p.targets().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// First handoff tool call in the messages an agent just produced.
fn find_handoff(
    policy: &EdgeHandoffPolicy,
    produced: &[ChatCompletionRequestMessage],
) -> Result<Option<HandoffRequest>, BoxError> {
    for message in produced {
        let ChatCompletionRequestMessage::Assistant(msg) = message else {
            continue;
        };
        for tool_call in msg.tool_calls.iter().flatten() {
            if !policy.is_handoff_tool(&tool_call.function.name) {
                continue;
            }
            let arguments = if tool_call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tool_call.function.arguments).unwrap_or_else(|e| {
                    warn!("Failed to parse handoff arguments: {}", e);
                    json!({})
                })
            };
            let invocation = ToolInvocation {
                id: tool_call.id.clone(),
                name: tool_call.function.name.clone(),
                arguments,
            };
            return policy.handle_handoff_tool(&invocation).map(Some);
        }
    }
    Ok(None)
}

impl Service<RouteRequest> for HandoffCoordinator {
    type Response = RoutedRun;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RouteRequest) -> Self::Future {
        let agents = self.agents.clone();
        let policies = self.policies.clone();
        let span = info_span!(
            "handoff_coordinator",
            request_id = %uuid::Uuid::new_v4(),
            start = %request.agent
        );

        Box::pin(
            async move {
                let mut current_agent = request.agent;
                // Every agent brings its own system prompt.
                let mut transcript: Vec<ChatCompletionRequestMessage> =
                    request.messages.into_iter().filter(|m| !is_system(m)).collect();
                let mut handoffs: Vec<HandoffEvent> = Vec::new();
                let mut total_steps = 0;

                loop {
                    info!(agent = %current_agent, messages = transcript.len(), "running agent");
                    let input_len = transcript.len();
                    let agent_request = CreateChatCompletionRequest {
                        messages: transcript.clone(),
                        ..Default::default()
                    };

                    let agent_run = {
                        let mut agents_guard = agents.lock().await;
                        let agent = agents_guard
                            .get_mut(&current_agent)
                            .ok_or_else(|| format!("Unknown agent: {}", current_agent))?;
                        ServiceExt::ready(agent).await?.call(agent_request).await?
                    };
                    total_steps += agent_run.steps;
                    debug!(
                        agent = %current_agent,
                        steps = agent_run.steps,
                        stop = ?agent_run.stop,
                        "agent finished"
                    );

                    let produced = agent_run.messages.get(input_len..).unwrap_or(&[]);
                    let handoff = match policies.get(&current_agent) {
                        Some(policy) => find_handoff(policy, produced)?,
                        None => None,
                    };
                    transcript = agent_run.messages;

                    match handoff {
                        Some(handoff) => {
                            info!(
                                from = %current_agent,
                                to = %handoff.target_agent,
                                reason = ?handoff.reason,
                                "handing off"
                            );
                            handoffs.push(HandoffEvent {
                                from_agent: current_agent.clone(),
                                to_agent: handoff.target_agent.clone(),
                                reason: handoff.reason,
                            });
                            current_agent = handoff.target_agent;
                        }
                        None => {
                            info!(agent = %current_agent, handoffs = handoffs.len(), "conversation turn complete");
                            return Ok(RoutedRun {
                                agent: current_agent,
                                run: AgentRun {
                                    messages: transcript,
                                    steps: total_steps,
                                    stop: agent_run.stop,
                                },
                                handoffs,
                            });
                        }
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Bind every agent in `graph` to `provider` and group them under one coordinator.
pub fn bind_graph<P>(graph: &AgentGraph, provider: P) -> HandoffCoordinator
where
    P: ModelService + Clone + Send + 'static,
    P::Future: Send + 'static,
{
    let mut agents = HashMap::new();
    let mut policies = HashMap::new();
    for spec in graph.agents() {
        let policy = EdgeHandoffPolicy::new(spec.handoffs().iter().cloned());
        let mut builder = Agent::builder(provider.clone())
            .model(spec.model())
            .instructions(spec.instructions())
            .tools(spec.tools().to_vec())
            .hosted_tools(spec.hosted_tools().to_vec());
        if let Some(t) = spec.settings().temperature {
            builder = builder.temperature(t);
        }
        if let Some(mt) = spec.settings().max_tokens {
            builder = builder.max_tokens(mt);
        }
        if !policy.is_empty() {
            builder = builder.handoff_policy(policy.clone());
        }
        debug!(agent = %spec.name(), tools = spec.tools().len(), handoffs = policy.targets().count(), "binding agent");
        agents.insert(spec.name().to_string(), builder.build());
        policies.insert(spec.name().to_string(), policy);
    }
    HandoffCoordinator {
        agents: Arc::new(tokio::sync::Mutex::new(agents)),
        policies: Arc::new(policies),
        starting_agent: graph.starting_agent().name().to_string(),
    }
}
