//! Shape of the shipped agent graph

use std::collections::HashSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use storefront_agents::agents::{CUSTOMER_SUPPORT_AGENT, STYLIST_AGENT, TRIAGE_AGENT};
use storefront_agents::groups::transfer_tool_name;
use storefront_agents::tools::HostedTool;
use storefront_agents::{
    starting_agent, storefront_graph, AgentGraph, ConfigBuilder, MockOrderBackend,
    STYLE_INSTRUCTIONS,
};

#[test]
fn three_agents_with_unique_names() {
    let graph = storefront_graph();
    let names: Vec<_> = graph.agents().iter().map(|a| a.name()).collect();
    assert_eq!(names, vec![TRIAGE_AGENT, STYLIST_AGENT, CUSTOMER_SUPPORT_AGENT]);
    let unique: HashSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len());
}

#[test]
fn triage_is_the_entry_point() {
    assert_eq!(starting_agent().name(), TRIAGE_AGENT);
    assert_eq!(storefront_graph().starting_agent().name(), TRIAGE_AGENT);
}

#[test]
fn handoff_edges_match_the_store_layout() {
    let graph = storefront_graph();
    assert_eq!(
        graph.handoff_targets(TRIAGE_AGENT).unwrap(),
        &[STYLIST_AGENT.to_string(), CUSTOMER_SUPPORT_AGENT.to_string()]
    );
    assert_eq!(
        graph.handoff_targets(STYLIST_AGENT).unwrap(),
        &[CUSTOMER_SUPPORT_AGENT.to_string()]
    );
    assert!(graph.handoff_targets(CUSTOMER_SUPPORT_AGENT).unwrap().is_empty());
    assert!(graph.handoff_targets("Billing Agent").is_none());

    // nothing ever routes back to triage
    assert!(graph.edges().iter().all(|(_, to)| *to != TRIAGE_AGENT));
}

#[test]
fn every_agent_uses_the_shared_style() {
    for agent in storefront_graph().agents() {
        assert!(
            agent.instructions().contains(STYLE_INSTRUCTIONS),
            "{} is missing the style instructions",
            agent.name()
        );
        assert_eq!(agent.model(), "gpt-4o-mini");
    }
}

#[test]
fn tools_are_placed_on_the_right_agents() {
    let graph = storefront_graph();
    assert!(graph.agent(TRIAGE_AGENT).unwrap().tools().is_empty());

    let stylist = graph.agent(STYLIST_AGENT).unwrap();
    assert!(stylist.tools().is_empty());
    assert_eq!(stylist.hosted_tools(), &[HostedTool::web_search_near("Tokyo")]);

    let support = graph.agent(CUSTOMER_SUPPORT_AGENT).unwrap();
    assert_eq!(
        support.tool_names(),
        vec!["get_past_orders", "submit_refund_request"]
    );
    assert!(support.hosted_tools().is_empty());
}

#[test]
fn describe_is_serializable() {
    let records = storefront_graph().describe();
    let value = serde_json::to_value(&records).unwrap();
    assert_eq!(value[0]["name"], TRIAGE_AGENT);
    assert_eq!(
        value[1]["hosted_tools"][0]["user_location"]["city"],
        "Tokyo"
    );
    assert_eq!(value[2]["tools"][1], "submit_refund_request");
}

#[test]
fn configured_graph_overrides_model_and_city() {
    let config = ConfigBuilder::new()
        .model("gpt-4o")
        .search_city("Paris")
        .temperature(0.2)
        .build();
    let graph = AgentGraph::storefront(Arc::new(MockOrderBackend::default()), &config).unwrap();
    for agent in graph.agents() {
        assert_eq!(agent.model(), "gpt-4o");
        assert_eq!(agent.settings().temperature, Some(0.2));
    }
    assert_eq!(
        graph.agent(STYLIST_AGENT).unwrap().hosted_tools(),
        &[HostedTool::web_search_near("Paris")]
    );
}

#[test]
fn transfer_tools_are_distinct_per_target() {
    let graph = storefront_graph();
    let names: HashSet<_> = graph
        .agents()
        .iter()
        .map(|a| transfer_tool_name(a.name()))
        .collect();
    assert_eq!(names.len(), 3);
}
