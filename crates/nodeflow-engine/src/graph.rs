use std::collections::HashMap;

use serde_json::{Map, Value};

use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::types::{Edge, NodeInstance};

/// A workflow graph normalized from either accepted input format.
///
/// Direct form: `{nodes: [...], edges: [...]}`. Keyed form: an object of
/// `{<id>: {name|class, data, outputs: {<port>: {connections: [...]}}}}`,
/// optionally wrapped in `{"drawflow": {<module>: {"data": {...}}}}`.
#[derive(Debug, Clone, Default)]
pub struct ParsedGraph {
    nodes: Vec<NodeInstance>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl ParsedGraph {
    pub fn parse(graph: &Value) -> Result<Self> {
        match graph {
            Value::String(text) => {
                let inner: Value = serde_json::from_str(text)
                    .map_err(|e| FlowError::InvalidGraph(format!("graph is not valid JSON: {}", e)))?;
                if inner.is_string() {
                    return Err(FlowError::InvalidGraph("graph is a doubly-encoded string".into()));
                }
                Self::parse(&inner)
            }
            Value::Object(obj) => {
                if let Some(drawflow) = obj.get("drawflow") {
                    Self::parse_keyed(editor_data(drawflow)?)
                } else if obj.contains_key("nodes") {
                    Self::parse_direct(obj)
                } else {
                    Self::parse_keyed(obj)
                }
            }
            Value::Null => Err(FlowError::InvalidGraph("graph is empty".into())),
            other => Err(FlowError::InvalidGraph(format!(
                "expected an object, got {}",
                kind_of(other)
            ))),
        }
    }

    fn parse_direct(obj: &Map<String, Value>) -> Result<Self> {
        let nodes = match obj.get("nodes") {
            Some(Value::Array(items)) => items,
            _ => return Err(FlowError::InvalidGraph("'nodes' must be an array".into())),
        };

        let mut graph = Self::default();
        for (i, raw) in nodes.iter().enumerate() {
            let id = raw
                .get("id")
                .and_then(id_string)
                .ok_or_else(|| FlowError::InvalidGraph(format!("node #{} has no id", i)))?;
            let node_type = raw
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| FlowError::InvalidGraph(format!("node '{}' has no type", id)))?;
            let mut node = NodeInstance::new(id, node_type);
            node.data = data_map(raw.get("data"));
            node.position = raw.get("position").cloned();
            graph.push_node(node)?;
        }

        if let Some(edges) = obj.get("edges") {
            let edges = edges
                .as_array()
                .ok_or_else(|| FlowError::InvalidGraph("'edges' must be an array".into()))?;
            for (i, raw) in edges.iter().enumerate() {
                let endpoint = |key: &str| {
                    raw.get(key)
                        .and_then(id_string)
                        .ok_or_else(|| FlowError::InvalidGraph(format!("edge #{} has no {}", i, key)))
                };
                graph.edges.push(Edge {
                    source: endpoint("source")?,
                    source_port: normalize_port(raw.get("sourcePort").or_else(|| raw.get("sourceOutput"))),
                    target: endpoint("target")?,
                    target_port: normalize_port(raw.get("targetPort").or_else(|| raw.get("targetInput"))),
                });
            }
        }
        Ok(graph)
    }

    fn parse_keyed(obj: &Map<String, Value>) -> Result<Self> {
        let mut keys: Vec<&String> = obj.keys().collect();
        keys.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        });

        let mut graph = Self::default();
        for key in keys {
            let raw = &obj[key.as_str()];
            let node_type = raw
                .get("name")
                .or_else(|| raw.get("class"))
                .and_then(Value::as_str)
                .ok_or_else(|| FlowError::InvalidGraph(format!("node '{}' has no name or class", key)))?;
            let mut node = NodeInstance::new(key.as_str(), node_type);
            node.data = data_map(raw.get("data"));
            if let (Some(x), Some(y)) = (raw.get("pos_x"), raw.get("pos_y")) {
                node.position = Some(serde_json::json!({ "x": x, "y": y }));
            }
            graph.push_node(node)?;

            let Some(outputs) = raw.get("outputs").and_then(Value::as_object) else {
                continue;
            };
            let mut ports: Vec<(&String, &Value)> = outputs.iter().collect();
            ports.sort_by_key(|(name, _)| normalize_port(Some(&Value::String((*name).clone()))));
            for (port_name, port) in ports {
                let source_port = normalize_port(Some(&Value::String(port_name.clone())));
                let connections = port
                    .get("connections")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for conn in connections {
                    let target = conn.get("node").and_then(id_string).ok_or_else(|| {
                        FlowError::InvalidGraph(format!("connection from '{}' has no node", key))
                    })?;
                    graph.edges.push(Edge {
                        source: key.clone(),
                        source_port,
                        target,
                        target_port: normalize_port(conn.get("output").or_else(|| conn.get("input"))),
                    });
                }
            }
        }
        Ok(graph)
    }

    fn push_node(&mut self, node: NodeInstance) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(FlowError::InvalidGraph(format!("duplicate node id '{}'", node.id)));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// First node of type `start`, else the first node.
    pub fn start_node(&self) -> Result<&NodeInstance> {
        self.nodes
            .iter()
            .find(|n| n.node_type == "start")
            .or_else(|| self.nodes.first())
            .ok_or(FlowError::NoStartNode)
    }

    pub fn node(&self, id: &str) -> Option<&NodeInstance> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[NodeInstance] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Every edge leaving `id`, in declared order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Edges leaving `id` on one output port, in declared order.
    pub fn outgoing_on<'a>(&'a self, id: &'a str, port: u32) -> impl Iterator<Item = &'a Edge> + 'a {
        self.outgoing(id).filter(move |e| e.source_port == port)
    }
}

fn editor_data(drawflow: &Value) -> Result<&Map<String, Value>> {
    let modules = drawflow
        .as_object()
        .ok_or_else(|| FlowError::InvalidGraph("'drawflow' must be an object".into()))?;
    let module = modules
        .get("Home")
        .or_else(|| modules.values().next())
        .ok_or_else(|| FlowError::InvalidGraph("'drawflow' has no modules".into()))?;
    module
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| FlowError::InvalidGraph("editor module has no data".into()))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn data_map(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `output_N`, `input_N`, `N` -> N; `"true"` -> 1; `"false"` -> 2; anything else -> 1.
pub fn normalize_port(value: Option<&Value>) -> u32 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        Some(Value::Bool(true)) => Some(1),
        Some(Value::Bool(false)) => Some(2),
        Some(Value::String(s)) => {
            let s = s.trim();
            match s {
                "true" => Some(1),
                "false" => Some(2),
                _ => s
                    .strip_prefix("output_")
                    .or_else(|| s.strip_prefix("input_"))
                    .unwrap_or(s)
                    .parse::<u32>()
                    .ok(),
            }
        }
        _ => None,
    };
    parsed.filter(|&p| p > 0).unwrap_or(1)
}
