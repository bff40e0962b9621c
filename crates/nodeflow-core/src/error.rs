use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Workflow has no start node")]
    NoStartNode,

    #[error("Invalid workflow graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Traversal depth exceeded ({0} nodes deep)")]
    DepthExceeded(usize),

    // Run errors
    #[error("Run {0} is already executing")]
    DuplicateRun(String),

    // Authorization errors
    #[error("Permission denied for node type {node_type}: role '{role}' lacks {capability}")]
    PermissionDenied {
        node_type: String,
        role: String,
        capability: String,
    },

    // Execution errors
    #[error("Action failed: {node}: {message}")]
    ActionFailure { node: String, message: String },

    #[error("Invalid input '{key}' for node {node}: {message}")]
    InvalidInput {
        node: String,
        key: String,
        message: String,
    },

    #[error("Unresolved template variable: {0}")]
    UnresolvedVariable(String),

    #[error("Action driver error: {0}")]
    Driver(String),

    #[error("No driver session for action '{0}' (run has no profile)")]
    NoDriverSession(String),

    #[error("Audit sink error: {0}")]
    Audit(String),

    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    WaitTimeout { what: String, timeout_ms: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for an `ActionFailure` on the given node.
    pub fn action(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActionFailure {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether a node invocation that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ActionFailure { .. } | Self::Driver(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FlowError::action("n1", "timeout").is_retryable());
        assert!(FlowError::Driver("session lost".into()).is_retryable());
        assert!(!FlowError::UnknownNodeType("nope".into()).is_retryable());
        assert!(!FlowError::NoStartNode.is_retryable());
        assert!(!FlowError::NoDriverSession("browser.open".into()).is_retryable());
        assert!(!FlowError::PermissionDenied {
            node_type: "browser_js_eval".into(),
            role: "staff".into(),
            capability: "browser:js_eval".into(),
        }
        .is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = FlowError::action("fetch", "connection refused");
        assert_eq!(err.to_string(), "Action failed: fetch: connection refused");
        assert_eq!(FlowError::NoStartNode.to_string(), "Workflow has no start node");
    }
}
