//! Model provider abstraction
//!
//! Steps talk to the model through [`ModelService`], a Tower service from a
//! chat completion request to the assistant message plus token usage. The
//! OpenAI adapter is what the binary uses; the fixed and scripted providers
//! drive agents in tests without a network.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionResponseMessage, ChatCompletionToolType,
    CreateChatCompletionRequest, FunctionCall, Role,
};
use async_openai::Client;
use serde_json::Value;
use tower::{BoxError, Service};
use tracing::debug;

/// Assistant turn returned by a provider
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub assistant: ChatCompletionResponseMessage,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl ProviderResponse {
    /// A plain text answer
    #[allow(deprecated)]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            assistant: ChatCompletionResponseMessage {
                content: Some(content.into()),
                role: Role::Assistant,
                tool_calls: None,
                refusal: None,
                audio: None,
                function_call: None,
            },
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// An assistant turn requesting the given `(call_id, function, arguments)` calls
    #[allow(deprecated)]
    pub fn tool_calls<I, N>(calls: I) -> Self
    where
        I: IntoIterator<Item = (N, N, Value)>,
        N: Into<String>,
    {
        let tool_calls = calls
            .into_iter()
            .map(|(id, name, arguments)| ChatCompletionMessageToolCall {
                id: id.into(),
                r#type: ChatCompletionToolType::Function,
                function: FunctionCall {
                    name: name.into(),
                    arguments: arguments.to_string(),
                },
            })
            .collect();
        Self {
            assistant: ChatCompletionResponseMessage {
                content: None,
                role: Role::Assistant,
                tool_calls: Some(tool_calls),
                refusal: None,
                audio: None,
                function_call: None,
            },
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Anything that can answer a chat completion request
pub trait ModelService:
    Service<CreateChatCompletionRequest, Response = ProviderResponse, Error = BoxError>
{
}

impl<T> ModelService for T where
    T: Service<CreateChatCompletionRequest, Response = ProviderResponse, Error = BoxError>
{
}

/// Provider backed by the OpenAI chat completions API
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Arc<Client<OpenAIConfig>>,
}

impl OpenAIProvider {
    pub fn new(client: Arc<Client<OpenAIConfig>>) -> Self {
        Self { client }
    }
}

impl Service<CreateChatCompletionRequest> for OpenAIProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let model = req.model.clone();
            let resp = client.chat().create(req).await?;
            let (prompt_tokens, completion_tokens) = resp
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens as usize, u.completion_tokens as usize))
                .unwrap_or((0, 0));
            debug!(%model, prompt_tokens, completion_tokens, "chat completion");
            let choice = resp
                .choices
                .into_iter()
                .next()
                .ok_or("provider returned no choices")?;
            Ok(ProviderResponse {
                assistant: choice.message,
                prompt_tokens,
                completion_tokens,
            })
        })
    }
}

/// Provider that answers every request with the same response
#[derive(Clone)]
pub struct FixedProvider {
    response: ProviderResponse,
}

impl FixedProvider {
    pub fn new(response: ProviderResponse) -> Self {
        Self { response }
    }
}

impl Service<CreateChatCompletionRequest> for FixedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: CreateChatCompletionRequest) -> Self::Future {
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }
}

/// Provider that replays a queue of responses and records what it was asked.
///
/// Clones share the queue, so one script can drive several agents in turn.
/// Running out of responses is an error.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<ProviderResponse>>>,
    seen: Arc<Mutex<Vec<CreateChatCompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            script: Arc::new(Mutex::new(responses.into())),
            seen: Arc::default(),
        }
    }

    /// Queue another response
    pub fn push(&self, response: ProviderResponse) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<CreateChatCompletionRequest> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Service<CreateChatCompletionRequest> for ScriptedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(req);
        }
        let next = self
            .script
            .lock()
            .map_err(|_| BoxError::from("script lock poisoned"))
            .and_then(|mut s| s.pop_front().ok_or_else(|| "script exhausted".into()));
        Box::pin(async move { next })
    }
}
