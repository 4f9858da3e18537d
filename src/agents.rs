//! Agent definitions for the storefront
//!
//! An [`AgentSpec`] is plain data: a name, a system prompt, a model binding,
//! the tools the agent may call and the names of agents it may hand off to.
//! Nothing here talks to a model; see [`crate::groups::bind_graph`] for that.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{StorefrontConfig, DEFAULT_MODEL};
use crate::core::ToolDef;
use crate::groups::AgentName;
use crate::mock_api::OrderBackend;
use crate::tools::{get_past_orders_tool, submit_refund_request_tool, HostedTool};

pub const TRIAGE_AGENT: &str = "Triage Agent";
pub const STYLIST_AGENT: &str = "Stylist Agent";
pub const CUSTOMER_SUPPORT_AGENT: &str = "Customer Support Agent";

/// Appended to every agent's prompt.
pub const STYLE_INSTRUCTIONS: &str = "Use a conversational tone and write in a chat style without formal formatting or lists and do not use any emojis.";

/// Per-agent sampling settings; unset fields defer to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl From<&StorefrontConfig> for ModelSettings {
    fn from(config: &StorefrontConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Declarative description of one agent
#[derive(Debug, Clone)]
pub struct AgentSpec {
    name: AgentName,
    instructions: String,
    model: String,
    settings: ModelSettings,
    tools: Vec<ToolDef>,
    hosted_tools: Vec<HostedTool>,
    handoffs: Vec<AgentName>,
}

/// Serializable view of an [`AgentSpec`], for logging and inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub name: AgentName,
    pub instructions: String,
    pub model: String,
    pub model_settings: ModelSettings,
    pub tools: Vec<String>,
    pub hosted_tools: Vec<HostedTool>,
    pub handoffs: Vec<AgentName>,
}

impl AgentSpec {
    pub fn new(name: impl Into<AgentName>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model: DEFAULT_MODEL.to_string(),
            settings: ModelSettings::default(),
            tools: Vec::new(),
            hosted_tools: Vec::new(),
            handoffs: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_hosted_tool(mut self, tool: HostedTool) -> Self {
        self.hosted_tools.push(tool);
        self
    }

    /// Allow handing off to `target`. Order of calls is the advertised order.
    pub fn with_handoff(mut self, target: impl Into<AgentName>) -> Self {
        self.handoffs.push(target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn tools(&self) -> &[ToolDef] {
        &self.tools
    }

    pub fn hosted_tools(&self) -> &[HostedTool] {
        &self.hosted_tools
    }

    pub fn handoffs(&self) -> &[AgentName] {
        &self.handoffs
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name).collect()
    }

    pub fn record(&self) -> AgentRecord {
        AgentRecord {
            name: self.name.clone(),
            instructions: self.instructions.clone(),
            model: self.model.clone(),
            model_settings: self.settings.clone(),
            tools: self.tool_names().into_iter().map(str::to_string).collect(),
            hosted_tools: self.hosted_tools.clone(),
            handoffs: self.handoffs.clone(),
        }
    }
}

fn persona(prompt: &str) -> String {
    format!("{prompt} {STYLE_INSTRUCTIONS}")
}

/// Looks up orders and files refunds. Terminal: hands off to nobody.
pub fn customer_support_agent(
    backend: Arc<dyn OrderBackend>,
    config: &StorefrontConfig,
) -> AgentSpec {
    AgentSpec::new(
        CUSTOMER_SUPPORT_AGENT,
        persona("You are a customer support assistant."),
    )
    .with_model(&config.model)
    .with_settings(config.into())
    .with_tool(get_past_orders_tool(backend.clone()))
    .with_tool(submit_refund_request_tool(backend))
}

/// Fashion advice with web search; escalates order questions to support.
pub fn stylist_agent(config: &StorefrontConfig) -> AgentSpec {
    AgentSpec::new(STYLIST_AGENT, persona("You are a stylist assistant."))
        .with_model(&config.model)
        .with_settings(config.into())
        .with_hosted_tool(HostedTool::web_search_near(&config.search_city))
        .with_handoff(CUSTOMER_SUPPORT_AGENT)
}

/// Entry point. Only routes.
pub fn triage_agent(config: &StorefrontConfig) -> AgentSpec {
    AgentSpec::new(
        TRIAGE_AGENT,
        persona("Route the user to the appropriate agent based on their request."),
    )
    .with_model(&config.model)
    .with_settings(config.into())
    .with_handoff(STYLIST_AGENT)
    .with_handoff(CUSTOMER_SUPPORT_AGENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_api::MockOrderBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn prompts_end_with_style_instructions() {
        let config = StorefrontConfig::default();
        let backend: Arc<dyn OrderBackend> = Arc::new(MockOrderBackend::default());
        for spec in [
            triage_agent(&config),
            stylist_agent(&config),
            customer_support_agent(backend, &config),
        ] {
            assert!(spec.instructions().ends_with(STYLE_INSTRUCTIONS), "{}", spec.name());
            assert_eq!(spec.model(), "gpt-4o-mini");
        }
    }

    #[test]
    fn triage_prompt_is_exact() {
        let spec = triage_agent(&StorefrontConfig::default());
        assert_eq!(
            spec.instructions(),
            "Route the user to the appropriate agent based on their request. Use a conversational tone and write in a chat style without formal formatting or lists and do not use any emojis."
        );
        assert!(spec.tools().is_empty());
        assert!(spec.hosted_tools().is_empty());
    }

    #[test]
    fn stylist_searches_near_configured_city() {
        let config = crate::config::ConfigBuilder::new().search_city("Osaka").build();
        let spec = stylist_agent(&config);
        assert_eq!(spec.hosted_tools(), &[HostedTool::web_search_near("Osaka")]);
        assert_eq!(spec.handoffs(), &[CUSTOMER_SUPPORT_AGENT.to_string()]);
    }

    #[test]
    fn record_lists_tool_names() {
        let backend: Arc<dyn OrderBackend> = Arc::new(MockOrderBackend::default());
        let record = customer_support_agent(backend, &StorefrontConfig::default()).record();
        assert_eq!(record.tools, vec!["get_past_orders", "submit_refund_request"]);
        assert!(record.handoffs.is_empty());
        assert_eq!(record.model_settings, ModelSettings::default());
    }
}
