use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum TradeflowError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Structural errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid flow: {}", errors.join("; "))]
    InvalidFlow { errors: Vec<String> },

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported cron expression: {0}")]
    Cron(String),

    // Execution errors
    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Plugin errors
    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Plugin not initialized: {0}")]
    PluginNotInitialized(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TradeflowError {
    /// Infrastructure failures that are worth retrying. Business failures
    /// (an action deliberately reporting `success: false`) never land here.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TradeflowError::Transient(_) | TradeflowError::Timeout(_) | TradeflowError::Io(_)
        )
    }
}

/// Result type alias for TradeflowError
pub type Result<T> = std::result::Result<T, TradeflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_flow_lists_every_error() {
        let err = TradeflowError::InvalidFlow {
            errors: vec!["no trigger".to_string(), "cycle".to_string()],
        };
        assert_eq!(err.to_string(), "Invalid flow: no trigger; cycle");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TradeflowError::Transient("rpc reset".into()).is_transient());
        assert!(TradeflowError::Timeout("5000ms".into()).is_transient());
        assert!(!TradeflowError::ActionFailed("slippage".into()).is_transient());
        assert!(!TradeflowError::Validation("missing token".into()).is_transient());
    }
}
