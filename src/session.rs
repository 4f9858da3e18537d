//! Conversation sessions
//!
//! A session speaks the storefront chat protocol: the client sends its whole
//! history in a `history.update` event and gets the extended history back in
//! `history.updated`, together with the agent that answered. The session
//! remembers that agent so the next turn starts with it instead of triage.
//!
//! Voice turns reuse the same history. The client streams PCM with
//! `input_audio_buffer.append`, closes the utterance with
//! `input_audio_buffer.commit`, and receives the spoken reply as
//! `response.audio.delta` chunks followed by `audio.done`.

use std::sync::Arc;

use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestAssistantMessageContent, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestSystemMessageContent,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestToolMessageContent,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    ChatCompletionToolType, FunctionCall,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::core::is_system;
use crate::groups::{AgentName, HandoffCoordinator, RouteRequest};
use crate::voice::{VoicePipeline, AUDIO_CHUNK_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the client-visible history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: Role,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        InputItem::Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        InputItem::Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "history.update")]
    HistoryUpdate {
        inputs: Vec<InputItem>,
        /// Start the turn with the starting agent again
        #[serde(default)]
        reset_agent: bool,
    },
    /// Base64 PCM to add to the pending utterance
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { delta: String },
    /// The pending utterance is complete; answer it
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "history.updated")]
    HistoryUpdated {
        inputs: Vec<InputItem>,
        agent_name: AgentName,
    },
    /// Base64 PCM of the spoken reply
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "audio.done")]
    AudioDone,
    /// The last client event could not be handled
    #[serde(rename = "error")]
    Error { message: String },
}

/// Convert client history into chat messages.
///
/// Consecutive function calls are folded into the assistant message before
/// them, matching how the model produced them.
pub fn to_messages(items: &[InputItem]) -> Result<Vec<ChatCompletionRequestMessage>, BoxError> {
    struct Pending {
        content: Option<String>,
        calls: Vec<ChatCompletionMessageToolCall>,
    }

    fn flush(
        pending: &mut Option<Pending>,
        out: &mut Vec<ChatCompletionRequestMessage>,
    ) -> Result<(), BoxError> {
        if let Some(Pending { content, calls }) = pending.take() {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(content) = content {
                builder.content(content);
            }
            if !calls.is_empty() {
                builder.tool_calls(calls);
            }
            out.push(builder.build()?.into());
        }
        Ok(())
    }

    let mut out = Vec::with_capacity(items.len());
    let mut pending: Option<Pending> = None;

    for item in items {
        match item {
            InputItem::Message {
                role: Role::Assistant,
                content,
            } => {
                flush(&mut pending, &mut out)?;
                pending = Some(Pending {
                    content: Some(content.clone()),
                    calls: Vec::new(),
                });
            }
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let call = ChatCompletionMessageToolCall {
                    id: call_id.clone(),
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: arguments.clone(),
                    },
                };
                pending
                    .get_or_insert_with(|| Pending {
                        content: None,
                        calls: Vec::new(),
                    })
                    .calls
                    .push(call);
            }
            InputItem::Message {
                role: Role::User,
                content,
            } => {
                flush(&mut pending, &mut out)?;
                out.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content.as_str())
                        .build()?
                        .into(),
                );
            }
            InputItem::Message {
                role: Role::System,
                content,
            } => {
                flush(&mut pending, &mut out)?;
                out.push(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(content.as_str())
                        .build()?
                        .into(),
                );
            }
            InputItem::FunctionCallOutput { call_id, output } => {
                flush(&mut pending, &mut out)?;
                out.push(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(output.as_str())
                        .tool_call_id(call_id.as_str())
                        .build()?
                        .into(),
                );
            }
        }
    }
    flush(&mut pending, &mut out)?;
    Ok(out)
}

/// Convert chat messages back into client history.
///
/// Only plain-text content is carried; multi-part content is dropped. An
/// empty assistant text is kept unless the message carries tool calls, where
/// it is only a placeholder.
pub fn from_messages(messages: &[ChatCompletionRequestMessage]) -> Vec<InputItem> {
    let mut items = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            ChatCompletionRequestMessage::User(msg) => match &msg.content {
                ChatCompletionRequestUserMessageContent::Text(text) => {
                    items.push(InputItem::user(text.clone()))
                }
                _ => warn!("dropping multi-part user message"),
            },
            ChatCompletionRequestMessage::System(msg) => match &msg.content {
                ChatCompletionRequestSystemMessageContent::Text(text) => {
                    items.push(InputItem::Message {
                        role: Role::System,
                        content: text.clone(),
                    })
                }
                _ => warn!("dropping multi-part system message"),
            },
            ChatCompletionRequestMessage::Assistant(msg) => {
                let has_calls = msg.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
                if let Some(ChatCompletionRequestAssistantMessageContent::Text(text)) = &msg.content {
                    if !text.is_empty() || !has_calls {
                        items.push(InputItem::assistant(text.clone()));
                    }
                }
                for call in msg.tool_calls.iter().flatten() {
                    items.push(InputItem::FunctionCall {
                        call_id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: call.function.arguments.clone(),
                    });
                }
            }
            ChatCompletionRequestMessage::Tool(msg) => match &msg.content {
                ChatCompletionRequestToolMessageContent::Text(text) => {
                    items.push(InputItem::FunctionCallOutput {
                        call_id: msg.tool_call_id.clone(),
                        output: text.clone(),
                    })
                }
                _ => warn!("dropping multi-part tool output"),
            },
            _ => debug!("skipping unsupported message role"),
        }
    }
    items
}

/// Whether a history asks for a model turn.
///
/// A history that already ends with an assistant reply has nothing to answer;
/// the voice client sends one before streaming audio.
fn awaits_reply(inputs: &[InputItem]) -> bool {
    !matches!(
        inputs.last(),
        None | Some(InputItem::Message {
            role: Role::Assistant,
            ..
        })
    )
}

/// Text of the assistant replies among `items`, joined for speech.
fn spoken_reply(items: &[InputItem]) -> String {
    items
        .iter()
        .filter_map(|item| match item {
            InputItem::Message {
                role: Role::Assistant,
                content,
            } if !content.trim().is_empty() => Some(content.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One client's conversation over a bound agent graph.
pub struct Conversation {
    coordinator: HandoffCoordinator,
    active_agent: AgentName,
    history: Vec<InputItem>,
    audio: Vec<u8>,
    voice: Option<Arc<dyn VoicePipeline>>,
}

impl Conversation {
    pub fn new(coordinator: HandoffCoordinator) -> Self {
        let active_agent = coordinator.starting_agent().to_string();
        Self {
            coordinator,
            active_agent,
            history: Vec::new(),
            audio: Vec::new(),
            voice: None,
        }
    }

    /// Enable voice turns through `voice`
    pub fn with_voice(mut self, voice: Arc<dyn VoicePipeline>) -> Self {
        self.voice = Some(voice);
        self
    }

    /// Agent the next turn will start with
    pub fn active_agent(&self) -> &str {
        &self.active_agent
    }

    /// History as of the last event
    pub fn history(&self) -> &[InputItem] {
        &self.history
    }

    /// Go back to the starting agent
    pub fn reset(&mut self) {
        self.active_agent = self.coordinator.starting_agent().to_string();
    }

    /// Handle one client event and return the events to send back.
    ///
    /// `history.updated` always carries the client's items exactly as sent,
    /// system items included, followed by whatever the turn produced. The
    /// agents themselves never see client system items; each brings its own
    /// prompt. A history ending with an assistant reply is stored without
    /// calling the model.
    pub async fn handle(&mut self, event: ClientEvent) -> Result<Vec<ServerEvent>, BoxError> {
        match event {
            ClientEvent::HistoryUpdate {
                inputs,
                reset_agent,
            } => {
                if reset_agent {
                    debug!(from = %self.active_agent, "resetting active agent");
                    self.reset();
                    self.audio.clear();
                }
                self.history = inputs;
                if awaits_reply(&self.history) {
                    self.run_turn().await?;
                }
                Ok(vec![self.history_updated()])
            }
            ClientEvent::InputAudioBufferAppend { delta } => {
                let pcm = STANDARD.decode(delta.as_bytes())?;
                self.audio.extend_from_slice(&pcm);
                Ok(Vec::new())
            }
            ClientEvent::InputAudioBufferCommit => self.voice_turn().await,
        }
    }

    fn history_updated(&self) -> ServerEvent {
        ServerEvent::HistoryUpdated {
            inputs: self.history.clone(),
            agent_name: self.active_agent.clone(),
        }
    }

    /// Run the stored history from the active agent and append what it produced.
    async fn run_turn(&mut self) -> Result<Vec<InputItem>, BoxError> {
        let messages = to_messages(&self.history)?;
        let carried = messages.iter().filter(|m| !is_system(m)).count();
        let routed = ServiceExt::ready(&mut self.coordinator)
            .await?
            .call(RouteRequest {
                agent: self.active_agent.clone(),
                messages,
            })
            .await?;
        info!(agent = %routed.agent, handoffs = routed.handoffs.len(), "turn answered");
        self.active_agent = routed.agent;

        let produced = from_messages(routed.run.messages.get(carried..).unwrap_or(&[]));
        self.history.extend(produced.iter().cloned());
        Ok(produced)
    }

    async fn voice_turn(&mut self) -> Result<Vec<ServerEvent>, BoxError> {
        let voice = self.voice.clone().ok_or("voice input is not enabled")?;
        let pcm = std::mem::take(&mut self.audio);
        if pcm.is_empty() {
            warn!("audio committed with an empty buffer");
            return Ok(Vec::new());
        }

        let transcript = voice.transcribe(pcm).await?;
        if transcript.trim().is_empty() {
            debug!("no speech in committed audio");
            return Ok(Vec::new());
        }
        self.history.push(InputItem::user(transcript));
        let mut events = vec![self.history_updated()];

        let produced = self.run_turn().await?;
        events.push(self.history_updated());

        let reply = spoken_reply(&produced);
        if !reply.is_empty() {
            let speech = voice.synthesize(reply).await?;
            events.extend(speech.chunks(AUDIO_CHUNK_BYTES).map(|chunk| {
                ServerEvent::ResponseAudioDelta {
                    delta: STANDARD.encode(chunk),
                }
            }));
        }
        events.push(ServerEvent::AudioDone);
        Ok(events)
    }
}
