use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::policy::RiskTier;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of whoever started a run. Threaded explicitly through every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: String,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Account-specific substitution values a run is bound to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Look up a field. `id` falls back to the profile id.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.data.get(key) {
            Some(v) => Some(v.clone()),
            None if key == "id" => Some(Value::String(self.id.clone())),
            None => None,
        }
    }
}

/// Immutable workflow definition as handed over by the persistence store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// Either graph format, or a JSON string holding one.
    pub graph: Value,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, graph: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            graph,
        }
    }
}

/// A placed node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Editor layout only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

impl NodeInstance {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data: Map::new(),
            position: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// A normalized edge. Ports are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub source_port: u32,
    pub target: String,
    pub target_port: u32,
}

impl Edge {
    /// Edge leaving the first output port.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::from_port(source, 1, target)
    }

    pub fn from_port(source: impl Into<String>, port: u32, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_port: port,
            target: target.into(),
            target_port: 1,
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One completed node execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub inputs: Map<String, Value>,
    pub outputs: Value,
    pub timestamp: DateTime<Utc>,
}

/// Final outcome of a run, handed back to the caller for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub variables: Map<String, Value>,
    pub executed_nodes: Vec<ExecutedNode>,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of a live run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_node: Option<String>,
    pub executed_count: usize,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
}

/// Structured audit record for risk-tiered nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event: String,
    pub run_id: String,
    pub node_id: String,
    pub node_type: String,
    pub risk_level: RiskTier,
    pub caller: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn node_execution(
        run_id: &RunId,
        node_id: &str,
        node_type: &str,
        risk_level: RiskTier,
        caller: &Caller,
    ) -> Self {
        Self {
            event: "node_execution".to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            risk_level,
            caller: caller.id.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// What a node needs the capability authority to approve.
#[derive(Debug, Clone, Copy)]
pub struct NodeRequirements<'a> {
    pub node_type: &'a str,
    pub capabilities: &'a [String],
    pub risk: RiskTier,
}

/// A single effect request handed to an action driver.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub action: String,
    pub inputs: Map<String, Value>,
}

/// Request for a human operator to act on a paused run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanActionRequest {
    pub message: String,
    #[serde(default)]
    pub show_browser: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Notification sent to the hosting UI when a human must act.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanActionNotice {
    pub run_id: String,
    pub message: String,
    pub show_browser: bool,
    pub timeout: Option<u64>,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Run registered and about to walk its graph.
    RunStarted { run_id: RunId, workflow_id: String },
    /// Node visit began.
    NodeStarted {
        run_id: RunId,
        node_id: String,
        node_type: String,
    },
    /// Node produced outputs.
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        elapsed_ms: u64,
    },
    /// Node attempt failed and will be retried.
    NodeRetry {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        error: String,
    },
    /// Run left the live-run table.
    RunFinished { run_id: RunId, status: RunStatus },
    /// A node registered a webhook and is waiting on it.
    WebhookRegistered {
        run_id: String,
        webhook_id: String,
        callback_url: String,
    },
    /// An inbound webhook payload arrived.
    WebhookReceived {
        run_id: String,
        webhook_id: String,
        queued: bool,
    },
    /// A human operator must act.
    HumanActionRequested(HumanActionNotice),
    /// The operator acknowledged the request.
    HumanActionCompleted { run_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_lookup_falls_back_to_id() {
        let profile = Profile::new("acct-7").with_field("email", serde_json::json!("a@b.c"));
        assert_eq!(profile.get("email"), Some(serde_json::json!("a@b.c")));
        assert_eq!(profile.get("id"), Some(serde_json::json!("acct-7")));
        assert_eq!(profile.get("missing"), None);
    }

    #[test]
    fn run_status_parse_and_display() {
        assert_eq!("completed".parse::<RunStatus>().unwrap(), RunStatus::Completed);
        assert_eq!("Canceled".parse::<RunStatus>().unwrap(), RunStatus::Cancelled);
        assert!("paused".parse::<RunStatus>().is_err());
        assert_eq!(RunStatus::Error.to_string(), "error");
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = RunSummary {
            run_id: RunId::from_str("r1"),
            workflow_id: "wf".into(),
            status: RunStatus::Completed,
            duration_ms: 12,
            variables: Map::new(),
            executed_nodes: vec![],
            errors: vec![],
            error: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["duration"], 12);
        assert!(json["executedNodes"].is_array());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn audit_event_shape() {
        let caller = Caller::new("u-1", "staff");
        let event = AuditEvent::node_execution(
            &RunId::from_str("r1"),
            "n1",
            "browser_open",
            RiskTier::Medium,
            &caller,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node_execution");
        assert_eq!(json["nodeType"], "browser_open");
        assert_eq!(json["riskLevel"], "medium");
        assert_eq!(json["caller"], "u-1");
    }
}
