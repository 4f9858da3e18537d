//! Tools the storefront agents can call
//!
//! Two function tools wrap the order backend; the stylist's web search is a
//! hosted tool that the model vendor runs.

use std::sync::Arc;

use async_openai::types::{
    WebSearchContextSize, WebSearchLocation, WebSearchOptions, WebSearchUserLocation,
    WebSearchUserLocationType,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::BoxError;
use tracing::{debug, info, instrument};

use crate::core::{tool_typed, ToolDef};
use crate::error::Result;
use crate::mock_api::OrderBackend;

pub const GET_PAST_ORDERS: &str = "get_past_orders";
pub const SUBMIT_REFUND_REQUEST: &str = "submit_refund_request";

/// The customer's past orders, serialized as a JSON string.
#[instrument(skip(backend))]
pub fn past_orders_json(backend: &dyn OrderBackend) -> Result<String> {
    let orders = backend.past_orders()?;
    Ok(serde_json::to_string(&orders)?)
}

/// Forward a refund request; the backend's answer is returned untouched.
#[instrument(skip(backend))]
pub fn submit_refund(backend: &dyn OrderBackend, order_number: &str) -> Result<Value> {
    backend.submit_refund_request(order_number)
}

/// No arguments
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RefundArgs {
    /// Order to refund, e.g. "ORD-123"
    pub order_number: String,
}

pub fn get_past_orders_tool(backend: Arc<dyn OrderBackend>) -> ToolDef {
    tool_typed(
        GET_PAST_ORDERS,
        "Look up the customer's past orders.",
        move |_: NoArgs| {
            let backend = backend.clone();
            async move {
                let orders = past_orders_json(backend.as_ref())?;
                debug!(bytes = orders.len(), "fetched past orders");
                Ok::<_, BoxError>(orders)
            }
        },
    )
}

pub fn submit_refund_request_tool(backend: Arc<dyn OrderBackend>) -> ToolDef {
    tool_typed(
        SUBMIT_REFUND_REQUEST,
        "Confirm with the user first",
        move |args: RefundArgs| {
            let backend = backend.clone();
            async move {
                info!(order_number = %args.order_number, "submitting refund request");
                let out = submit_refund(backend.as_ref(), &args.order_number)?;
                Ok::<_, BoxError>(out)
            }
        },
    )
}

// =============================
// Hosted tools
// =============================

/// How precisely the search location is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Approximate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLocation {
    #[serde(rename = "type")]
    pub kind: LocationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl UserLocation {
    /// Approximate location known only by city
    pub fn city(city: impl Into<String>) -> Self {
        Self {
            kind: LocationKind::Approximate,
            city: Some(city.into()),
            country: None,
            region: None,
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchContextSize {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchTool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_location: Option<UserLocation>,
    #[serde(default)]
    pub search_context_size: SearchContextSize,
}

/// Tools executed by the model vendor rather than by this process.
///
/// Chat completions has no hosted tool list; web search travels as the
/// request's `web_search_options` instead (see [`HostedTool::web_search_options`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostedTool {
    #[serde(rename = "web_search_preview")]
    WebSearch(WebSearchTool),
}

impl HostedTool {
    /// Web search biased towards `city`
    pub fn web_search_near(city: impl Into<String>) -> Self {
        HostedTool::WebSearch(WebSearchTool {
            user_location: Some(UserLocation::city(city)),
            search_context_size: SearchContextSize::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostedTool::WebSearch(_) => "web_search_preview",
        }
    }

    /// Search options for a chat completions request, if this tool is web search.
    pub fn web_search_options(&self) -> Option<WebSearchOptions> {
        let HostedTool::WebSearch(search) = self;
        Some(WebSearchOptions {
            search_context_size: Some(match search.search_context_size {
                SearchContextSize::Low => WebSearchContextSize::Low,
                SearchContextSize::Medium => WebSearchContextSize::Medium,
                SearchContextSize::High => WebSearchContextSize::High,
            }),
            user_location: search.user_location.as_ref().map(|loc| WebSearchUserLocation {
                r#type: match loc.kind {
                    LocationKind::Approximate => WebSearchUserLocationType::Approximate,
                },
                approximate: WebSearchLocation {
                    country: loc.country.clone(),
                    region: loc.region.clone(),
                    city: loc.city.clone(),
                    timezone: loc.timezone.clone(),
                },
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_api::{fixture_orders, MockOrderBackend};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn backend() -> Arc<dyn OrderBackend> {
        Arc::new(MockOrderBackend::default())
    }

    #[tokio::test]
    async fn past_orders_tool_returns_serialized_fixture() {
        let tool = get_past_orders_tool(backend());
        let out = tool.invoke(json!({})).await.unwrap();
        let expected = serde_json::to_string(&fixture_orders()).unwrap();
        assert_eq!(out, Value::String(expected));
    }

    #[tokio::test]
    async fn refund_tool_requires_order_number() {
        let tool = submit_refund_request_tool(backend());
        assert_eq!(tool.description, "Confirm with the user first");
        assert!(tool.parameters_schema["required"]
            .as_array()
            .unwrap()
            .contains(&json!("order_number")));
        assert!(tool.invoke(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn refund_tool_surfaces_backend_errors() {
        let tool = submit_refund_request_tool(backend());
        let err = tool
            .invoke(json!({"order_number": "ORD-000"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ORD-000"));
    }

    #[test]
    fn hosted_web_search_serializes_with_location() {
        let tool = HostedTool::web_search_near("Tokyo");
        assert_eq!(tool.name(), "web_search_preview");
        assert_eq!(
            serde_json::to_value(&tool).unwrap(),
            json!({
                "type": "web_search_preview",
                "user_location": {"type": "approximate", "city": "Tokyo"},
                "search_context_size": "medium"
            })
        );
    }

    #[test]
    fn web_search_becomes_approximate_location_options() {
        let options = HostedTool::web_search_near("Tokyo").web_search_options().unwrap();
        assert_eq!(options.search_context_size, Some(WebSearchContextSize::Medium));
        let location = options.user_location.unwrap();
        assert_eq!(location.r#type, WebSearchUserLocationType::Approximate);
        assert_eq!(location.approximate.city.as_deref(), Some("Tokyo"));
        assert_eq!(location.approximate.country, None);
    }
}
