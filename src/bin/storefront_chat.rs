//! Interactive storefront chat over stdin.
//!
//! Reads one user message per line. `/reset` clears the history and returns to
//! the triage agent. Configuration comes from the TOML file named by
//! `STOREFRONT_CONFIG` if set, otherwise from `STOREFRONT_*` variables.

use std::sync::Arc;

use storefront_agents::provider::OpenAIProvider;
use storefront_agents::session::{ClientEvent, InputItem, Role, ServerEvent};
use storefront_agents::{bind_graph, config, AgentGraph, Conversation, MockOrderBackend};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tower::BoxError;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

fn last_reply(inputs: &[InputItem]) -> Option<&str> {
    inputs.iter().rev().find_map(|item| match item {
        InputItem::Message {
            role: Role::Assistant,
            content,
        } => Some(content.as_str()),
        _ => None,
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let config = match std::env::var("STOREFRONT_CONFIG") {
        Ok(path) => config::from_file(path)?,
        Err(_) => config::from_env()?,
    };
    info!(model = %config.model, city = %config.search_city, "starting storefront chat");

    let graph = AgentGraph::storefront(Arc::new(MockOrderBackend::default()), &config)?;
    debug!(graph = %serde_json::to_string(&graph.describe())?, "agent graph");

    let provider = OpenAIProvider::new(Arc::new(async_openai::Client::new()));
    let mut conversation = Conversation::new(bind_graph(&graph, provider));
    let mut history: Vec<InputItem> = Vec::new();

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout
            .write_all(format!("[{}] > ", conversation.active_agent()).as_bytes())
            .await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/reset" {
            history.clear();
            conversation
                .handle(ClientEvent::HistoryUpdate {
                    inputs: Vec::new(),
                    reset_agent: true,
                })
                .await?;
            continue;
        }

        history.push(InputItem::user(line));
        let event = ClientEvent::HistoryUpdate {
            inputs: history.clone(),
            reset_agent: false,
        };
        match conversation.handle(event).await {
            Ok(events) => {
                for event in events {
                    if let ServerEvent::HistoryUpdated { inputs, agent_name } = event {
                        let reply = last_reply(&inputs).unwrap_or_default();
                        stdout
                            .write_all(format!("{agent_name}: {reply}\n").as_bytes())
                            .await?;
                        history = inputs;
                    }
                }
            }
            Err(e) => {
                error!("turn failed: {e}");
                history.pop();
            }
        }
    }

    Ok(())
}
