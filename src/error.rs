//! Error types for the storefront agents

use thiserror::Error;

/// Result type alias for configuration and backend operations
pub type Result<T> = std::result::Result<T, StorefrontError>;

/// Main error type for building the agent graph and talking to the order backend.
///
/// Failures raised while a conversation is running travel through the Tower
/// stack as [`tower::BoxError`]; this enum converts into one via `?`.
#[derive(Debug, Error)]
pub enum StorefrontError {
    /// Two agents share a name
    #[error("Duplicate agent name: {name}")]
    DuplicateAgent { name: String },

    /// A handoff edge points at an agent that is not part of the graph
    #[error("Agent {source_agent} hands off to undefined agent {target}")]
    UnknownHandoffTarget {
        source_agent: String,
        target: String,
    },

    /// Two agent names map to the same `transfer_to_*` tool
    #[error("Agents {first} and {second} share the handoff tool name {tool}")]
    HandoffToolCollision {
        first: String,
        second: String,
        tool: String,
    },

    /// The name has no ASCII letters or digits to build a handoff tool name from
    #[error("Agent name {name:?} cannot be turned into a handoff tool name")]
    UnnamedHandoffTool { name: String },

    /// The designated entry point is not part of the graph
    #[error("Starting agent is not defined: {name}")]
    UnknownStartingAgent { name: String },

    /// The order backend does not know this order
    #[error("Unknown order: {order_number}")]
    UnknownOrder { order_number: String },

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorefrontError::UnknownHandoffTarget {
            source_agent: "Triage Agent".to_string(),
            target: "Billing Agent".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Agent Triage Agent hands off to undefined agent Billing Agent"
        );

        let err = StorefrontError::UnknownOrder {
            order_number: "ORD-999".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown order: ORD-999");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StorefrontError = serde_err.into();
        assert!(matches!(err, StorefrontError::Serialization(_)));
    }

    #[test]
    fn test_error_boxes_for_tower() {
        fn might_fail() -> std::result::Result<(), tower::BoxError> {
            Err(StorefrontError::DuplicateAgent {
                name: "Stylist Agent".to_string(),
            })?;
            Ok(())
        }

        let err = might_fail().unwrap_err();
        assert!(err.to_string().contains("Stylist Agent"));
        assert!(err.downcast_ref::<StorefrontError>().is_some());
    }
}
