//! End-to-end turns through the bound storefront graph with a scripted model

use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageContent,
    CreateChatCompletionRequest,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pretty_assertions::assert_eq;
use serde_json::json;
use storefront_agents::agents::{CUSTOMER_SUPPORT_AGENT, STYLIST_AGENT, TRIAGE_AGENT};
use storefront_agents::mock_api::{fixture_orders, refund_accepted};
use storefront_agents::provider::{ProviderResponse, ScriptedProvider};
use storefront_agents::session::{ClientEvent, InputItem, Role, ServerEvent};
use storefront_agents::voice::{FixedVoice, AUDIO_CHUNK_BYTES};
use storefront_agents::{
    bind_graph, tool_error_message, AgentGraph, Conversation, MockOrderBackend, StorefrontConfig,
};

fn graph() -> AgentGraph {
    AgentGraph::storefront(
        Arc::new(MockOrderBackend::default()),
        &StorefrontConfig::default(),
    )
    .unwrap()
}

fn system_prompt(req: &CreateChatCompletionRequest) -> String {
    match &req.messages[0] {
        ChatCompletionRequestMessage::System(msg) => match &msg.content {
            ChatCompletionRequestSystemMessageContent::Text(text) => text.clone(),
            other => panic!("unexpected system content: {other:?}"),
        },
        other => panic!("first message is not a system prompt: {other:?}"),
    }
}

fn tool_names(req: &CreateChatCompletionRequest) -> Vec<String> {
    req.tools
        .iter()
        .flatten()
        .map(|t| t.function.name.clone())
        .collect()
}

fn turn(inputs: Vec<InputItem>) -> ClientEvent {
    ClientEvent::HistoryUpdate {
        inputs,
        reset_agent: false,
    }
}

/// The single `history.updated` a text turn answers with
fn updated(events: Vec<ServerEvent>) -> (Vec<InputItem>, String) {
    match <[ServerEvent; 1]>::try_from(events) {
        Ok([ServerEvent::HistoryUpdated { inputs, agent_name }]) => (inputs, agent_name),
        other => panic!("expected one history.updated, got {other:?}"),
    }
}

#[tokio::test]
async fn refund_goes_through_support_and_stays_there() {
    let graph = graph();
    let provider = ScriptedProvider::new(vec![
        ProviderResponse::tool_calls(vec![(
            "h1",
            "transfer_to_customer_support_agent",
            json!({"reason": "refund"}),
        )]),
        ProviderResponse::tool_calls(vec![("t1", "get_past_orders", json!({}))]),
        ProviderResponse::text("I can see ORD-123. Want me to submit the refund?"),
        ProviderResponse::tool_calls(vec![(
            "t2",
            "submit_refund_request",
            json!({"order_number": "ORD-123"}),
        )]),
        ProviderResponse::text("Done, your refund is on its way."),
    ]);
    let mut conversation = Conversation::new(bind_graph(&graph, provider.clone()));
    assert_eq!(conversation.active_agent(), TRIAGE_AGENT);

    // first turn: triage hands off, support looks up orders and asks to confirm
    let (inputs, agent_name) = updated(
        conversation
            .handle(turn(vec![InputItem::user("I want a refund for ORD-123")]))
            .await
            .unwrap(),
    );
    assert_eq!(agent_name, CUSTOMER_SUPPORT_AGENT);
    assert_eq!(conversation.active_agent(), CUSTOMER_SUPPORT_AGENT);
    assert_eq!(
        inputs,
        vec![
            InputItem::user("I want a refund for ORD-123"),
            InputItem::FunctionCall {
                call_id: "h1".into(),
                name: "transfer_to_customer_support_agent".into(),
                arguments: json!({"reason": "refund"}).to_string(),
            },
            InputItem::FunctionCallOutput {
                call_id: "h1".into(),
                output: json!({"assistant": CUSTOMER_SUPPORT_AGENT}).to_string(),
            },
            InputItem::FunctionCall {
                call_id: "t1".into(),
                name: "get_past_orders".into(),
                arguments: "{}".into(),
            },
            InputItem::FunctionCallOutput {
                call_id: "t1".into(),
                output: serde_json::to_string(&fixture_orders()).unwrap(),
            },
            InputItem::assistant("I can see ORD-123. Want me to submit the refund?"),
        ]
    );

    let seen = provider.requests();
    assert_eq!(seen.len(), 3);
    assert!(system_prompt(&seen[0]).starts_with("Route the user"));
    assert_eq!(
        tool_names(&seen[0]),
        vec![
            "transfer_to_stylist_agent",
            "transfer_to_customer_support_agent"
        ]
    );
    assert!(system_prompt(&seen[1]).starts_with("You are a customer support assistant."));
    assert_eq!(
        tool_names(&seen[1]),
        vec!["get_past_orders", "submit_refund_request"]
    );
    assert!(seen.iter().all(|r| r.model == "gpt-4o-mini"));

    // second turn starts with support, not triage
    let mut history = inputs;
    history.push(InputItem::user("Yes please"));
    let (inputs, agent_name) = updated(conversation.handle(turn(history)).await.unwrap());
    assert_eq!(agent_name, CUSTOMER_SUPPORT_AGENT);

    let seen = provider.requests();
    assert_eq!(seen.len(), 5);
    assert!(system_prompt(&seen[3]).starts_with("You are a customer support assistant."));
    // one system prompt per request, never the previous agent's
    assert_eq!(
        seen[3]
            .messages
            .iter()
            .filter(|m| matches!(m, ChatCompletionRequestMessage::System(_)))
            .count(),
        1
    );

    let refund_output = inputs
        .iter()
        .find_map(|item| match item {
            InputItem::FunctionCallOutput { call_id, output } if call_id == "t2" => {
                Some(output.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&refund_output).unwrap(),
        refund_accepted("ORD-123")
    );
    assert_eq!(
        inputs.last(),
        Some(&InputItem::assistant("Done, your refund is on its way."))
    );
    assert_eq!(provider.remaining(), 0);
}

#[tokio::test]
async fn stylist_answers_and_reset_returns_to_triage() {
    let graph = graph();
    let provider = ScriptedProvider::new(vec![
        ProviderResponse::tool_calls(vec![("h1", "transfer_to_stylist_agent", json!({}))]),
        ProviderResponse::text("Linen and light colours work well in summer."),
        ProviderResponse::text("Happy to help with anything else."),
    ]);
    let mut conversation = Conversation::new(bind_graph(&graph, provider.clone()));

    let (_, agent_name) = updated(
        conversation
            .handle(turn(vec![InputItem::user("What should I wear in July?")]))
            .await
            .unwrap(),
    );
    assert_eq!(agent_name, STYLIST_AGENT);

    let seen = provider.requests();
    assert!(system_prompt(&seen[1]).starts_with("You are a stylist assistant."));
    // web search rides on the request options, not in the function tool list
    assert_eq!(
        tool_names(&seen[1]),
        vec!["transfer_to_customer_support_agent"]
    );
    let search_city = seen[1]
        .web_search_options
        .as_ref()
        .and_then(|o| o.user_location.as_ref())
        .and_then(|l| l.approximate.city.clone());
    assert_eq!(search_city.as_deref(), Some("Tokyo"));
    assert!(seen[0].web_search_options.is_none());

    let (_, agent_name) = updated(
        conversation
            .handle(ClientEvent::HistoryUpdate {
                inputs: vec![InputItem::user("Thanks!")],
                reset_agent: true,
            })
            .await
            .unwrap(),
    );
    assert_eq!(agent_name, TRIAGE_AGENT);
    let seen = provider.requests();
    assert!(system_prompt(&seen[2]).starts_with("Route the user"));
}

#[tokio::test]
async fn empty_history_is_answered_without_a_model_call() {
    let provider = ScriptedProvider::new(vec![]);
    let mut conversation = Conversation::new(bind_graph(&graph(), provider.clone()));
    let events = conversation.handle(turn(vec![])).await.unwrap();
    assert_eq!(
        events,
        vec![ServerEvent::HistoryUpdated {
            inputs: vec![],
            agent_name: TRIAGE_AGENT.to_string(),
        }]
    );
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn handoff_outside_the_graph_fails_the_turn() {
    let provider = ScriptedProvider::new(vec![ProviderResponse::tool_calls(vec![(
        "h1",
        "transfer_to_triage_agent",
        json!({}),
    )])]);
    let mut conversation = Conversation::new(bind_graph(&graph(), provider));

    let err = conversation
        .handle(turn(vec![InputItem::user("hi")]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown tool: transfer_to_triage_agent"));
    assert_eq!(conversation.active_agent(), TRIAGE_AGENT);
}

#[tokio::test]
async fn refund_for_unknown_order_is_answered_by_support() {
    let provider = ScriptedProvider::new(vec![
        ProviderResponse::tool_calls(vec![(
            "h1",
            "transfer_to_customer_support_agent",
            json!({}),
        )]),
        ProviderResponse::tool_calls(vec![(
            "t1",
            "submit_refund_request",
            json!({"order_number": "ORD-999"}),
        )]),
        ProviderResponse::text("I couldn't find ORD-999. Could you check the number?"),
    ]);
    let mut conversation = Conversation::new(bind_graph(&graph(), provider.clone()));

    let (inputs, agent_name) = updated(
        conversation
            .handle(turn(vec![InputItem::user("Refund ORD-999 please")]))
            .await
            .unwrap(),
    );
    assert_eq!(agent_name, CUSTOMER_SUPPORT_AGENT);
    assert_eq!(conversation.active_agent(), CUSTOMER_SUPPORT_AGENT);

    let refund_output = inputs
        .iter()
        .find_map(|item| match item {
            InputItem::FunctionCallOutput { call_id, output } if call_id == "t1" => {
                Some(output.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(
        refund_output,
        tool_error_message(&"Unknown order: ORD-999".into())
    );
    assert_eq!(
        inputs.last(),
        Some(&InputItem::assistant(
            "I couldn't find ORD-999. Could you check the number?"
        ))
    );
    assert_eq!(provider.remaining(), 0);
}

#[tokio::test]
async fn client_items_come_back_as_sent() {
    let provider = ScriptedProvider::new(vec![ProviderResponse::text("")]);
    let mut conversation = Conversation::new(bind_graph(&graph(), provider.clone()));
    let system = InputItem::Message {
        role: Role::System,
        content: "The customer is on the mobile site.".into(),
    };

    let (inputs, _) = updated(
        conversation
            .handle(turn(vec![system.clone(), InputItem::user("hi")]))
            .await
            .unwrap(),
    );
    assert_eq!(
        inputs,
        vec![system, InputItem::user("hi"), InputItem::assistant("")]
    );
    // agents still only see their own system prompt
    let seen = provider.requests();
    assert_eq!(
        seen[0]
            .messages
            .iter()
            .filter(|m| matches!(m, ChatCompletionRequestMessage::System(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn voice_turn_transcribes_answers_and_speaks() {
    let provider = ScriptedProvider::new(vec![ProviderResponse::text("Hello! How can I help?")]);
    let speech = vec![7u8; AUDIO_CHUNK_BYTES + 10];
    let voice = FixedVoice::new("hi there", speech.clone());
    let mut conversation =
        Conversation::new(bind_graph(&graph(), provider.clone())).with_voice(Arc::new(voice.clone()));

    // the client first syncs its history; nothing to answer yet
    let history = vec![InputItem::user("hello"), InputItem::assistant("Hi!")];
    let (inputs, _) = updated(conversation.handle(turn(history.clone())).await.unwrap());
    assert_eq!(inputs, history);
    assert!(provider.requests().is_empty());

    for part in [&[1u8, 0][..], &[2, 0, 3, 0][..]] {
        let events = conversation
            .handle(ClientEvent::InputAudioBufferAppend {
                delta: STANDARD.encode(part),
            })
            .await
            .unwrap();
        assert!(events.is_empty());
    }
    let events = conversation
        .handle(ClientEvent::InputAudioBufferCommit)
        .await
        .unwrap();

    assert_eq!(voice.heard(), vec![vec![1, 0, 2, 0, 3, 0]]);
    assert_eq!(voice.spoken(), vec!["Hello! How can I help?".to_string()]);

    let mut with_user = history.clone();
    with_user.push(InputItem::user("hi there"));
    let mut answered = with_user.clone();
    answered.push(InputItem::assistant("Hello! How can I help?"));
    assert_eq!(
        events,
        vec![
            ServerEvent::HistoryUpdated {
                inputs: with_user,
                agent_name: TRIAGE_AGENT.to_string(),
            },
            ServerEvent::HistoryUpdated {
                inputs: answered,
                agent_name: TRIAGE_AGENT.to_string(),
            },
            ServerEvent::ResponseAudioDelta {
                delta: STANDARD.encode(&speech[..AUDIO_CHUNK_BYTES]),
            },
            ServerEvent::ResponseAudioDelta {
                delta: STANDARD.encode(&speech[AUDIO_CHUNK_BYTES..]),
            },
            ServerEvent::AudioDone,
        ]
    );
}
