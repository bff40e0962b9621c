use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use nodeflow_core::context::NodeContext;
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::types::RunStatus;

use super::{is_truthy, required_str, str_input, text_of, u64_input};
use crate::definition::{InputSpec, NodeCategory, NodeDefinition, NodeKind};

/// Flow-control behaviours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Start,
    End,
    Condition,
    Loop,
    BreakLoop,
    ContinueLoop,
    StopWorkflow,
    Delay,
    SetVariable,
}

pub fn definitions() -> Vec<NodeDefinition> {
    let def = |id: &str, name: &str, op: ControlOp| {
        NodeDefinition::new(id, name, NodeCategory::Control, NodeKind::Control(op))
            .with_capability("control:flow")
    };

    vec![
        def("start", "Start", ControlOp::Start),
        def("end", "End", ControlOp::End),
        def("condition", "Condition", ControlOp::Condition)
            .with_ports(2)
            .with_input(InputSpec::json("left"))
            .with_input(
                InputSpec::select("operator", &["eq", "ne", "contains", "gt", "lt", "truthy", "empty"])
                    .default_value(json!("eq")),
            )
            .with_input(InputSpec::json("right"))
            .with_outputs(&["result"]),
        def("loop", "Loop", ControlOp::Loop)
            .loop_start()
            .with_input(InputSpec::json("items"))
            .with_input(InputSpec::number("count"))
            .with_input(InputSpec::string("item_var").default_value(json!("item")))
            .with_input(InputSpec::string("index_var").default_value(json!("index")))
            .with_outputs(&["loop", "count"]),
        def("break_loop", "Break Loop", ControlOp::BreakLoop),
        def("continue_loop", "Continue Loop", ControlOp::ContinueLoop),
        def("stop_workflow", "Stop Workflow", ControlOp::StopWorkflow)
            .with_input(InputSpec::string("reason").default_value(json!("stopped by workflow")))
            .with_input(
                InputSpec::select("status", &["completed", "cancelled", "error"])
                    .default_value(json!("completed")),
            ),
        def("delay", "Delay", ControlOp::Delay)
            .with_input(InputSpec::number("ms").default_value(json!(1000))),
        def("set_variable", "Set Variable", ControlOp::SetVariable)
            .with_input(InputSpec::string("name").required())
            .with_input(InputSpec::json("value"))
            .with_outputs(&["name", "value"]),
    ]
}

pub(crate) async fn run(
    op: ControlOp,
    inputs: &Map<String, Value>,
    ctx: &mut NodeContext<'_>,
) -> Result<Value> {
    match op {
        ControlOp::Start => Ok(json!({ "started": true })),
        ControlOp::End => Ok(json!({ "ended": true })),
        ControlOp::Condition => {
            let operator = str_input(inputs, "operator").unwrap_or("eq");
            let left = inputs.get("left").unwrap_or(&Value::Null);
            let right = inputs.get("right").unwrap_or(&Value::Null);
            let result = evaluate(ctx.node_id, operator, left, right)?;
            Ok(json!({ "result": result }))
        }
        ControlOp::Loop => {
            let items = loop_items(ctx.node_id, inputs)?;
            let item_var = str_input(inputs, "item_var").unwrap_or("item");
            let index_var = str_input(inputs, "index_var").unwrap_or("index");
            debug!(node_id = %ctx.node_id, count = items.len(), "Loop expanded");
            Ok(json!({
                "loop": { "items": items, "itemVar": item_var, "indexVar": index_var },
                "count": items.len(),
            }))
        }
        ControlOp::BreakLoop => {
            ctx.handle().request_break();
            Ok(json!({ "break": true }))
        }
        ControlOp::ContinueLoop => {
            ctx.handle().request_continue();
            Ok(json!({ "continue": true }))
        }
        ControlOp::StopWorkflow => {
            let reason = str_input(inputs, "reason").unwrap_or("stopped by workflow");
            let status = match str_input(inputs, "status") {
                Some(s) => s.parse::<RunStatus>().map_err(|e| FlowError::InvalidInput {
                    node: ctx.node_id.to_string(),
                    key: "status".into(),
                    message: e,
                })?,
                None => RunStatus::Completed,
            };
            info!(run_id = %ctx.run_id(), node_id = %ctx.node_id, reason, %status, "Workflow stop requested");
            ctx.handle().request_stop(reason, status);
            Ok(json!({ "stopped": true, "reason": reason, "status": status.to_string() }))
        }
        ControlOp::Delay => {
            let ms = u64_input(inputs, "ms").unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "delayed_ms": ms }))
        }
        ControlOp::SetVariable => {
            let name = required_str(ctx.node_id, inputs, "name")?.to_string();
            let value = inputs.get("value").cloned().unwrap_or(Value::Null);
            ctx.run.set_variable(name.clone(), value.clone());
            Ok(json!({ "name": name, "value": value }))
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => text_of(left) == text_of(right),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Evaluate a condition operator.
pub fn evaluate(node: &str, operator: &str, left: &Value, right: &Value) -> Result<bool> {
    let result = match operator {
        "eq" => values_equal(left, right),
        "ne" => !values_equal(left, right),
        "contains" => match left {
            Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
            other => text_of(other).contains(&text_of(right)),
        },
        "gt" | "lt" => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) if operator == "gt" => a > b,
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        "truthy" => is_truthy(left),
        "empty" => is_empty(left),
        other => {
            return Err(FlowError::InvalidInput {
                node: node.to_string(),
                key: "operator".into(),
                message: format!("unsupported operator '{}'", other),
            })
        }
    };
    Ok(result)
}

fn loop_items(node: &str, inputs: &Map<String, Value>) -> Result<Vec<Value>> {
    match inputs.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Number(n)) => {
            let count = n.as_u64().unwrap_or(0);
            Ok((1..=count).map(Value::from).collect())
        }
        Some(Value::String(text)) if text.trim_start().starts_with('[') => {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(items)) => Ok(items),
                _ => Err(FlowError::InvalidInput {
                    node: node.to_string(),
                    key: "items".into(),
                    message: "malformed JSON array".into(),
                }),
            }
        }
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Value::String(l.to_string()))
            .collect()),
        Some(Value::Null) | Some(Value::String(_)) | None => {
            let count = u64_input(inputs, "count").unwrap_or(0);
            Ok((1..=count).map(Value::from).collect())
        }
        Some(other) => Err(FlowError::InvalidInput {
            node: node.to_string(),
            key: "items".into(),
            message: format!("cannot iterate over {}", other),
        }),
    }
}
