//! Core agent runtime using Tower services and static dependency injection.
//!
//! A bound agent is a stack of three services: a [`ToolRouter`] over its
//! function tools (optionally wrapped by a handoff layer), a [`Step`] that makes
//! one model call and runs the requested tools, and an [`AgentLoop`] that
//! repeats steps until a policy says stop.

use std::{future::Future, pin::Pin, sync::Arc};

use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionTool, ChatCompletionToolType, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, FunctionObject, WebSearchOptions,
};
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::{
    util::{BoxCloneSyncService, BoxService},
    BoxError, Layer, Service, ServiceExt,
};
use tracing::{debug, trace, warn};

use crate::groups::{layer_tool_router_with_handoff, EdgeHandoffPolicy, HandoffPolicy};
use crate::provider::{ModelService, ProviderResponse};
use crate::tools::HostedTool;

// =============================
// Tool service modeling
// =============================

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,   // tool_call_id
    pub name: String, // function.name
    pub arguments: Value,
}

/// Uniform tool output produced by tool services.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub id: String, // same as invocation.id
    pub result: Value,
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneSyncService<ToolInvocation, ToolOutput, BoxError>;

/// Definition of a tool: function spec (for OpenAI) + service implementation.
#[derive(Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters_schema: Value,
    pub service: ToolSvc,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters_schema", &self.parameters_schema)
            .finish()
    }
}

impl ToolDef {
    /// Create a tool definition from a handler function that takes JSON args and returns JSON.
    pub fn from_handler(
        name: &'static str,
        description: &'static str,
        parameters_schema: Value,
        handler: Arc<
            dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync + 'static,
        >,
    ) -> Self {
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            async move {
                if inv.name != name {
                    return Err::<ToolOutput, BoxError>(
                        format!("routed to wrong tool: expected={}, got={}", name, inv.name).into(),
                    );
                }
                let out = (handler)(inv.arguments).await?;
                Ok(ToolOutput {
                    id: inv.id,
                    result: out,
                })
            }
        });
        Self {
            name,
            description,
            parameters_schema,
            service: BoxCloneSyncService::new(svc),
        }
    }

    /// Convert this tool's function signature into an OpenAI ChatCompletionTool spec.
    pub fn to_openai_tool(&self) -> ChatCompletionTool {
        ChatCompletionTool {
            r#type: ChatCompletionToolType::Function,
            function: FunctionObject {
                name: self.name.to_string(),
                description: Some(self.description.to_string()),
                parameters: Some(self.parameters_schema.clone()),
                ..Default::default()
            },
        }
    }

    /// Invoke the tool directly, outside of any agent.
    pub async fn invoke(&self, arguments: Value) -> Result<Value, BoxError> {
        let mut svc = self.service.clone();
        let out = ServiceExt::ready(&mut svc)
            .await?
            .call(ToolInvocation {
                id: format!("direct_{}", self.name),
                name: self.name.to_string(),
                arguments,
            })
            .await?;
        Ok(out.result)
    }
}

/// DX sugar: create a tool from a typed handler.
/// - `A` is the input args struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize)
pub fn tool_typed<A, H, Fut, R>(
    name: &'static str,
    description: &'static str,
    handler: H,
) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: serde::Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let params_value = serde_json::to_value(schema.schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
    let handler = Arc::new(handler);
    let erased: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync> =
        Arc::new(move |raw: Value| {
            let h = handler.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(raw)?;
                let out: R = (h.as_ref())(args).await?;
                let val = serde_json::to_value(out)?;
                Ok(val)
            })
        });
    ToolDef::from_handler(name, description, params_value, erased)
}

/// Raised by [`ToolRouter`] for a tool name the agent never advertised.
///
/// Unlike a failing tool, this ends the run: the model asked for something
/// outside its own tool set.
#[derive(Debug, thiserror::Error)]
#[error("unknown tool: {0}")]
pub struct UnknownTool(pub String);

/// Simple router service over tools using a name → index table.
#[derive(Clone)]
pub struct ToolRouter {
    name_to_index: std::collections::HashMap<&'static str, usize>,
    services: Vec<ToolSvc>, // index 0 is the unknown-tool fallback
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> (Self, Vec<ChatCompletionTool>) {
        use std::collections::HashMap;

        let unknown = BoxCloneSyncService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Err::<ToolOutput, BoxError>(Box::new(UnknownTool(inv.name)))
        }));

        let mut services: Vec<ToolSvc> = vec![unknown];
        let mut specs: Vec<ChatCompletionTool> = Vec::with_capacity(tools.len());
        let mut name_to_index: HashMap<&'static str, usize> = HashMap::new();

        for (i, td) in tools.into_iter().enumerate() {
            name_to_index.insert(td.name, i + 1);
            specs.push(td.to_openai_tool());
            services.push(td.service);
        }

        (
            Self {
                name_to_index,
                services,
            },
            specs,
        )
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // We check readiness per selected service inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let idx = self
            .name_to_index
            .get(req.name.as_str())
            .copied()
            .unwrap_or(0);

        // index 0 is always present (unknown fallback)
        let mut svc = self.services[idx].clone();
        Box::pin(async move { ServiceExt::ready(&mut svc).await?.call(req).await })
    }
}

// =============================
// Step service and layer
// =============================

/// Auxiliary accounting captured per step.
#[derive(Debug, Clone, Default)]
pub struct StepAux {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub tool_invocations: usize,
}

/// Outcome of a single agent step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Next {
        messages: Vec<ChatCompletionRequestMessage>,
        aux: StepAux,
        invoked_tools: Vec<String>,
    },
    Done {
        messages: Vec<ChatCompletionRequestMessage>,
        aux: StepAux,
    },
}

impl StepOutcome {
    fn into_messages(self) -> Vec<ChatCompletionRequestMessage> {
        match self {
            StepOutcome::Next { messages, .. } | StepOutcome::Done { messages, .. } => messages,
        }
    }
}

/// One-step agent service parameterized by a routed tool service `S`.
///
/// The step always calls the provider with its own model; the model named on
/// the incoming request is ignored so every agent keeps its binding.
pub struct Step<S, P> {
    provider: Arc<tokio::sync::Mutex<P>>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    web_search: Option<WebSearchOptions>,
    tools: S,
    tool_specs: Arc<Vec<ChatCompletionTool>>,
}

impl<S, P> Step<S, P> {
    pub fn new(
        provider: P,
        model: impl Into<String>,
        tools: S,
        tool_specs: Vec<ChatCompletionTool>,
    ) -> Self {
        Self {
            provider: Arc::new(tokio::sync::Mutex::new(provider)),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            web_search: None,
            tools,
            tool_specs: Arc::new(tool_specs),
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_tokens(mut self, mt: u32) -> Self {
        self.max_tokens = Some(mt);
        self
    }

    /// Let the provider search the web while answering.
    pub fn web_search(mut self, options: WebSearchOptions) -> Self {
        self.web_search = Some(options);
        self
    }
}

/// Layer that lifts a routed tool service `S` into a `Step<S>` service.
pub struct StepLayer<P> {
    provider: P,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    web_search: Option<WebSearchOptions>,
    tool_specs: Arc<Vec<ChatCompletionTool>>,
}

impl<P> StepLayer<P> {
    pub fn new(provider: P, model: impl Into<String>, tool_specs: Vec<ChatCompletionTool>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            web_search: None,
            tool_specs: Arc::new(tool_specs),
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_tokens(mut self, mt: u32) -> Self {
        self.max_tokens = Some(mt);
        self
    }

    pub fn web_search(mut self, options: WebSearchOptions) -> Self {
        self.web_search = Some(options);
        self
    }
}

impl<S, P> Layer<S> for StepLayer<P>
where
    P: Clone,
{
    type Service = Step<S, P>;

    fn layer(&self, tools: S) -> Self::Service {
        let mut s = Step::new(
            self.provider.clone(),
            self.model.clone(),
            tools,
            (*self.tool_specs).clone(),
        );
        s.temperature = self.temperature;
        s.max_tokens = self.max_tokens;
        s.web_search = self.web_search.clone();
        s
    }
}

/// Text handed back to the model for a tool result.
///
/// Tools that already produce serialized text (a JSON string) are passed
/// through verbatim instead of being quoted a second time.
pub fn tool_message_content(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Tool message the model sees when one of its tool calls failed.
pub fn tool_error_message(error: &BoxError) -> String {
    format!("An error occurred while running the tool. Please try again. Error: {error}")
}

fn parse_tool_arguments(raw: &str) -> Result<Value, BoxError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(raw)?)
}

impl<S, P> Service<CreateChatCompletionRequest> for Step<S, P>
where
    S: Service<ToolInvocation, Response = ToolOutput, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    P: ModelService + Send + 'static,
    P::Future: Send + 'static,
{
    type Response = StepOutcome;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Always ready; we await tools readiness inside `call`
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let provider = self.provider.clone();
        let model = self.model.clone();
        let temperature = self.temperature;
        let max_tokens = self.max_tokens;
        let web_search = self.web_search.clone();
        let tools = self.tools.clone();
        let tool_specs = self.tool_specs.clone();

        Box::pin(async move {
            let mut builder = CreateChatCompletionRequestArgs::default();
            builder.messages(req.messages.clone());
            builder.model(&model);
            if let Some(t) = req.temperature.or(temperature) {
                builder.temperature(t);
            }
            if let Some(mt) = max_tokens {
                #[allow(deprecated)]
                builder.max_tokens(mt);
            }
            if let Some(ws) = req.web_search_options.clone().or(web_search) {
                builder.web_search_options(ws);
            }
            if let Some(ts) = req.tools.clone() {
                builder.tools(ts);
            } else if !tool_specs.is_empty() {
                builder.tools((*tool_specs).clone());
            }

            let rebuilt_req = builder
                .build()
                .map_err(|e| format!("request build error: {}", e))?;

            let mut messages = rebuilt_req.messages.clone();

            let ProviderResponse {
                assistant,
                prompt_tokens,
                completion_tokens,
            } = {
                let mut p = provider.lock().await;
                ServiceExt::ready(&mut *p).await?.call(rebuilt_req).await?
            };
            let mut aux = StepAux {
                prompt_tokens,
                completion_tokens,
                tool_invocations: 0,
            };

            // Append assistant message by constructing request-side equivalent
            let mut asst_builder = ChatCompletionRequestAssistantMessageArgs::default();
            asst_builder.content(assistant.content.clone().unwrap_or_default());
            if let Some(tool_calls) = assistant.tool_calls.clone() {
                asst_builder.tool_calls(tool_calls);
            }
            let asst_req = asst_builder
                .build()
                .map_err(|e| format!("assistant msg build error: {}", e))?;
            messages.push(ChatCompletionRequestMessage::from(asst_req));

            let tool_calls = assistant.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                trace!(model = %model, "step produced a final answer");
                return Ok(StepOutcome::Done { messages, aux });
            }

            let mut invoked_names: Vec<String> = Vec::with_capacity(tool_calls.len());
            for tc in tool_calls {
                let call_id = tc.id;
                let name = tc.function.name;
                let raw_arguments = tc.function.arguments;
                debug!(tool = %name, call_id = %call_id, "invoking tool");
                invoked_names.push(name.clone());
                let mut svc = tools.clone();
                let outcome = async {
                    let inv = ToolInvocation {
                        id: call_id.clone(),
                        name: name.clone(),
                        arguments: parse_tool_arguments(&raw_arguments)?,
                    };
                    ServiceExt::ready(&mut svc).await?.call(inv).await
                }
                .await;
                aux.tool_invocations += 1;
                // A failing tool is reported back to the model; an unadvertised one ends the run.
                let content = match outcome {
                    Ok(ToolOutput { result, .. }) => tool_message_content(&result),
                    Err(e) if e.downcast_ref::<UnknownTool>().is_some() => return Err(e),
                    Err(e) => {
                        warn!(tool = %name, call_id = %call_id, error = %e, "tool failed");
                        tool_error_message(&e)
                    }
                };
                let tool_msg = ChatCompletionRequestToolMessageArgs::default()
                    .content(content)
                    .tool_call_id(call_id)
                    .build()?;
                messages.push(tool_msg.into());
            }

            Ok(StepOutcome::Next {
                messages,
                aux,
                invoked_tools: invoked_names,
            })
        })
    }
}

// =============================
// Agent loop: composable policies and layer
// =============================

/// Stop reasons reported by the agent loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStopReason {
    DoneNoToolCalls,
    ToolCalled(String),
}

/// Boxed agent service type for ergonomic returns.
pub type AgentSvc = BoxService<CreateChatCompletionRequest, AgentRun, BoxError>;

/// Boxed model provider shared by every agent built from one builder.
pub type ProviderSvc = tower::util::BoxCloneService<CreateChatCompletionRequest, ProviderResponse, BoxError>;

/// Thin facade to build an agent stack from tools, model, and policy.
pub struct Agent;

pub struct AgentBuilder {
    provider: ProviderSvc,
    model: String,
    instructions: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    tools: Vec<ToolDef>,
    hosted_tools: Vec<HostedTool>,
    handoff: Option<EdgeHandoffPolicy>,
}

impl Agent {
    pub fn builder<P>(provider: P) -> AgentBuilder
    where
        P: ModelService + Clone + Send + 'static,
        P::Future: Send + 'static,
    {
        AgentBuilder {
            provider: tower::util::BoxCloneService::new(provider),
            model: crate::config::DEFAULT_MODEL.to_string(),
            instructions: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            hosted_tools: Vec::new(),
            handoff: None,
        }
    }
}

impl AgentBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
    /// System instructions prepended to every model call this agent makes.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }
    pub fn max_tokens(mut self, mt: u32) -> Self {
        self.max_tokens = Some(mt);
        self
    }
    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }
    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Vendor-hosted tools; web search is sent as the request's search options.
    pub fn hosted_tools(mut self, tools: Vec<HostedTool>) -> Self {
        self.hosted_tools.extend(tools);
        self
    }
    /// Advertise handoff tools and stop the loop as soon as one is called
    pub fn handoff_policy(mut self, policy: EdgeHandoffPolicy) -> Self {
        self.handoff = Some(policy);
        self
    }

    pub fn build(self) -> AgentSvc {
        let (router, mut specs) = ToolRouter::new(self.tools);
        let mut policy = CompositePolicy::default();
        let routed: ToolSvc = match &self.handoff {
            Some(handoff) => {
                let hand_spec = handoff.handoff_tools();
                for spec in &hand_spec {
                    policy.push(policies::until_tool_called(spec.function.name.clone()));
                }
                specs.extend(hand_spec);
                layer_tool_router_with_handoff(router, handoff.clone())
            }
            None => BoxCloneSyncService::new(router),
        };

        let mut step_layer = StepLayer::new(self.provider, self.model, specs);
        if let Some(t) = self.temperature {
            step_layer = step_layer.temperature(t);
        }
        if let Some(mt) = self.max_tokens {
            step_layer = step_layer.max_tokens(mt);
        }
        if let Some(ws) = self.hosted_tools.iter().find_map(HostedTool::web_search_options) {
            step_layer = step_layer.web_search(ws);
        }
        let step = step_layer.layer(routed);
        let mut loop_layer = AgentLoopLayer::new(policy);
        if let Some(instructions) = self.instructions {
            loop_layer = loop_layer.instructions(instructions);
        }
        BoxService::new(loop_layer.layer(step))
    }
}

/// Loop state visible to policies.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub steps: usize,
}

/// Policy interface controlling loop termination.
pub trait AgentPolicy: Send + Sync {
    fn decide(&self, state: &LoopState, last: &StepOutcome) -> Option<AgentStopReason>;
}

/// Function-backed policy for ergonomic composition.
#[derive(Clone)]
#[allow(clippy::type_complexity)]
pub struct PolicyFn(
    pub Arc<dyn Fn(&LoopState, &StepOutcome) -> Option<AgentStopReason> + Send + Sync + 'static>,
);

impl AgentPolicy for PolicyFn {
    fn decide(&self, state: &LoopState, last: &StepOutcome) -> Option<AgentStopReason> {
        (self.0)(state, last)
    }
}

/// Composite policy: stop when any sub-policy returns a stop reason.
#[derive(Clone, Default)]
pub struct CompositePolicy {
    policies: Vec<PolicyFn>,
}

impl CompositePolicy {
    pub fn push(&mut self, p: PolicyFn) {
        self.policies.push(p);
    }
}

impl AgentPolicy for CompositePolicy {
    fn decide(&self, state: &LoopState, last: &StepOutcome) -> Option<AgentStopReason> {
        for p in &self.policies {
            if let Some(r) = p.decide(state, last) {
                return Some(r);
            }
        }
        None
    }
}

/// Built-in policies
pub mod policies {
    use super::*;

    pub fn until_tool_called(tool_name: impl Into<String>) -> PolicyFn {
        let target = tool_name.into();
        PolicyFn(Arc::new(move |_s, last| match last {
            StepOutcome::Next { invoked_tools, .. } => {
                if invoked_tools.iter().any(|n| n == &target) {
                    Some(AgentStopReason::ToolCalled(target.clone()))
                } else {
                    None
                }
            }
            _ => None,
        }))
    }
}

/// Final run summary from the agent loop.
///
/// `messages` is the conversation transcript without the agent's own system
/// message: the input messages followed by everything the run produced.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub messages: Vec<ChatCompletionRequestMessage>,
    pub steps: usize,
    pub stop: AgentStopReason,
}

/// Layer to wrap a step service with an agent loop controlled by a policy.
pub struct AgentLoopLayer<P> {
    policy: P,
    instructions: Option<Arc<str>>,
}

impl<P> AgentLoopLayer<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            instructions: None,
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(Arc::from(instructions.into()));
        self
    }
}

pub struct AgentLoop<S, P> {
    inner: Arc<tokio::sync::Mutex<S>>,
    policy: P,
    instructions: Option<Arc<str>>,
}

impl<S, P> Layer<S> for AgentLoopLayer<P>
where
    P: Clone,
{
    type Service = AgentLoop<S, P>;
    fn layer(&self, inner: S) -> Self::Service {
        AgentLoop {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            policy: self.policy.clone(),
            instructions: self.instructions.clone(),
        }
    }
}

/// Build a system message from plain text.
pub fn system_message(text: &str) -> Result<ChatCompletionRequestMessage, BoxError> {
    let msg = ChatCompletionRequestSystemMessageArgs::default()
        .content(text)
        .build()?;
    Ok(msg.into())
}

pub(crate) fn is_system(message: &ChatCompletionRequestMessage) -> bool {
    matches!(
        message,
        ChatCompletionRequestMessage::System(_) | ChatCompletionRequestMessage::Developer(_)
    )
}

impl<S, P> Service<CreateChatCompletionRequest> for AgentLoop<S, P>
where
    S: Service<CreateChatCompletionRequest, Response = StepOutcome, Error = BoxError>
        + Send
        + 'static,
    S::Future: Send + 'static,
    P: AgentPolicy + Send + Sync + Clone + 'static,
{
    type Response = AgentRun;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();
        let instructions = self.instructions.clone();
        Box::pin(async move {
            let mut state = LoopState::default();
            let base_model = req.model.clone();
            // An agent with its own instructions replaces whatever system prompt came in.
            let mut transcript: Vec<ChatCompletionRequestMessage> = match &instructions {
                Some(_) => req.messages.into_iter().filter(|m| !is_system(m)).collect(),
                None => req.messages,
            };
            loop {
                let mut messages = Vec::with_capacity(transcript.len() + 1);
                if let Some(text) = instructions.as_deref() {
                    messages.push(system_message(text)?);
                }
                let prefix = messages.len();
                messages.extend(transcript.iter().cloned());
                let current_req = CreateChatCompletionRequest {
                    model: base_model.clone(),
                    messages,
                    ..Default::default()
                };

                let outcome = {
                    let mut guard = inner.lock().await;
                    guard.ready().await?.call(current_req).await?
                };
                state.steps += 1;

                let stop = policy.decide(&state, &outcome);
                let done = matches!(outcome, StepOutcome::Done { .. });
                transcript = outcome.into_messages().into_iter().skip(prefix).collect();

                if let Some(stop) = stop {
                    return Ok(AgentRun {
                        messages: transcript,
                        steps: state.steps,
                        stop,
                    });
                }
                if done {
                    return Ok(AgentRun {
                        messages: transcript,
                        steps: state.steps,
                        stop: AgentStopReason::DoneNoToolCalls,
                    });
                }
            }
        })
    }
}
