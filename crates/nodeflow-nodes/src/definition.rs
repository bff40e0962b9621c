use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use nodeflow_core::context::NodeContext;
use nodeflow_core::error::Result;
use nodeflow_core::policy::RiskTier;

use crate::builtin::{self, ControlOp, DataOp, InteractionOp};

/// Catalog grouping of node definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Control,
    Data,
    Browser,
    Network,
    Interaction,
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Data => write!(f, "data"),
            Self::Browser => write!(f, "browser"),
            Self::Network => write!(f, "network"),
            Self::Interaction => write!(f, "interaction"),
        }
    }
}

impl std::str::FromStr for NodeCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "control" => Ok(Self::Control),
            "data" => Ok(Self::Data),
            "browser" => Ok(Self::Browser),
            "network" => Ok(Self::Network),
            "interaction" => Ok(Self::Interaction),
            other => Err(format!("unknown node category: {}", other)),
        }
    }
}

/// Value type of a declared input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    String,
    Text,
    Number,
    Boolean,
    Json,
    Select,
}

impl InputKind {
    /// Convert a resolved value into the declared type where the text allows it.
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (Self::Number, Value::String(s)) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    Value::from(i)
                } else if let Ok(f) = t.parse::<f64>() {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or(Value::String(s))
                } else {
                    Value::String(s)
                }
            }
            (Self::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" | "" => Value::Bool(false),
                _ => Value::String(s),
            },
            (Self::Json, Value::String(s)) => {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
            (_, v) => v,
        }
    }
}

/// One entry of a node's input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub key: String,
    pub kind: InputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values for `Select` inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub required: bool,
}

impl InputSpec {
    pub fn new(key: impl Into<String>, kind: InputKind) -> Self {
        Self {
            key: key.into(),
            kind,
            default: None,
            options: Vec::new(),
            sensitive: false,
            required: false,
        }
    }

    pub fn string(key: &str) -> Self {
        Self::new(key, InputKind::String)
    }

    pub fn text(key: &str) -> Self {
        Self::new(key, InputKind::Text)
    }

    pub fn number(key: &str) -> Self {
        Self::new(key, InputKind::Number)
    }

    pub fn boolean(key: &str) -> Self {
        Self::new(key, InputKind::Boolean)
    }

    pub fn json(key: &str) -> Self {
        Self::new(key, InputKind::Json)
    }

    pub fn select(key: &str, options: &[&str]) -> Self {
        let mut spec = Self::new(key, InputKind::Select);
        spec.options = options.iter().map(|s| s.to_string()).collect();
        spec
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Linear-backoff retry settings for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, retry_delay_ms: u64) -> Self {
        Self {
            retry_count,
            retry_delay_ms,
        }
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// What a node does when visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Control(ControlOp),
    Data(DataOp),
    Http,
    Interaction(InteractionOp),
    /// Delegated to the run's action driver under this action name.
    Action(String),
}

/// Static description of a node type.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub name: String,
    pub category: NodeCategory,
    pub risk: RiskTier,
    pub capabilities: Vec<String>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<String>,
    pub retry: RetryPolicy,
    pub is_loop_start: bool,
    pub output_ports: u8,
    pub kind: NodeKind,
}

impl NodeDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: NodeCategory,
        kind: NodeKind,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            risk: RiskTier::Low,
            capabilities: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            is_loop_start: false,
            output_ports: 1,
            kind,
        }
    }

    pub fn with_risk(mut self, risk: RiskTier) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay_ms: u64) -> Self {
        self.retry = RetryPolicy::new(retry_count, retry_delay_ms);
        self
    }

    pub fn loop_start(mut self) -> Self {
        self.is_loop_start = true;
        self
    }

    pub fn with_ports(mut self, ports: u8) -> Self {
        self.output_ports = ports;
        self
    }

    pub fn input(&self, key: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.key == key)
    }

    /// Run this node's behaviour against already-resolved inputs.
    pub async fn execute(&self, inputs: &Map<String, Value>, ctx: &mut NodeContext<'_>) -> Result<Value> {
        let output = match &self.kind {
            NodeKind::Control(op) => builtin::control::run(*op, inputs, ctx).await?,
            NodeKind::Data(op) => builtin::data::run(*op, inputs, ctx)?,
            NodeKind::Http => builtin::network::http_request(inputs, ctx).await?,
            NodeKind::Interaction(op) => builtin::interaction::run(*op, inputs, ctx).await?,
            NodeKind::Action(action) => builtin::browser::perform(action, inputs, ctx).await?,
        };

        if let Some(var) = builtin::str_input(inputs, "output_var") {
            let value = output.get("result").cloned().unwrap_or_else(|| output.clone());
            ctx.run.set_variable(var, value);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_by_kind() {
        assert_eq!(InputKind::Number.coerce(json!("42")), json!(42));
        assert_eq!(InputKind::Number.coerce(json!("2.5")), json!(2.5));
        assert_eq!(InputKind::Number.coerce(json!("n/a")), json!("n/a"));
        assert_eq!(InputKind::Boolean.coerce(json!("TRUE")), json!(true));
        assert_eq!(InputKind::Boolean.coerce(json!("")), json!(false));
        assert_eq!(InputKind::Json.coerce(json!("[1,2]")), json!([1, 2]));
        assert_eq!(InputKind::Json.coerce(json!("not json")), json!("not json"));
        assert_eq!(InputKind::String.coerce(json!("7")), json!("7"));
    }

    #[test]
    fn builder_defaults() {
        let def = NodeDefinition::new(
            "custom_scrape",
            "Scrape",
            NodeCategory::Browser,
            NodeKind::Action("custom.scrape".into()),
        )
        .with_risk(RiskTier::High)
        .with_capability("browser:basic")
        .with_input(InputSpec::string("url").required())
        .with_retry(3, 250);

        assert_eq!(def.output_ports, 1);
        assert!(!def.is_loop_start);
        assert_eq!(def.retry.attempts(), 4);
        assert!(def.input("url").is_some_and(|i| i.required));
        assert!(def.input("missing").is_none());
    }

    #[test]
    fn category_parse() {
        assert_eq!("Browser".parse::<NodeCategory>().unwrap(), NodeCategory::Browser);
        assert!("storage".parse::<NodeCategory>().is_err());
        assert_eq!(NodeCategory::Interaction.to_string(), "interaction");
    }
}
