use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use nodeflow_core::context::RunContext;
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::types::NodeInstance;
use nodeflow_nodes::{InputKind, NodeDefinition};

const MASK: &str = "***";

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").unwrap())
}

/// Look a possibly dotted name up in the run scopes.
fn lookup(ctx: &RunContext, name: &str) -> Option<Value> {
    if let Some(v) = ctx.lookup(name) {
        return Some(v);
    }
    let (head, rest) = name.split_once('.')?;
    let mut current = ctx.lookup(head)?;
    for segment in rest.split('.') {
        current = match &current {
            Value::Object(map) => map.get(segment)?.clone(),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

/// Replace every `{{name}}` in `text`.
///
/// Unresolved names become "" unless `strict`, in which case the first one is
/// reported as `UnresolvedVariable`.
pub fn render(text: &str, ctx: &RunContext, strict: bool) -> Result<String> {
    let mut missing: Option<String> = None;
    let rendered = placeholder().replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        match lookup(ctx, name) {
            Some(Value::String(s)) => s,
            Some(Value::Null) => String::new(),
            Some(other) => other.to_string(),
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });

    match missing {
        Some(name) if strict => Err(FlowError::UnresolvedVariable(name)),
        _ => Ok(rendered.into_owned()),
    }
}

/// Name inside `text` when the whole string is a single `{{name}}`.
fn whole_placeholder(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let caps = placeholder().captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// The named value itself, keeping its JSON type.
fn placeholder_value(name: &str, ctx: &RunContext, strict: bool) -> Result<Value> {
    match lookup(ctx, name) {
        Some(value) => Ok(value),
        None if strict => Err(FlowError::UnresolvedVariable(name.to_string())),
        None => Ok(Value::String(String::new())),
    }
}

fn render_value(value: &Value, ctx: &RunContext, strict: bool) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(render(s, ctx, strict)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, ctx, strict))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx, strict)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Build the concrete inputs for one node visit.
///
/// Declared keys take the node's data value, else the schema default, are
/// substituted, then coerced to the declared kind. A JSON input that is a
/// single `{{name}}` takes the variable as is instead of re-parsing its text.
/// Undeclared data keys are passed through substituted but uncoerced.
pub fn resolve_inputs(
    def: &NodeDefinition,
    node: &NodeInstance,
    ctx: &RunContext,
    strict: bool,
) -> Result<Map<String, Value>> {
    let invalid = |key: &str, message: String| FlowError::InvalidInput {
        node: node.id.clone(),
        key: key.to_string(),
        message,
    };

    let mut inputs = Map::new();
    for spec in &def.inputs {
        let raw = node
            .data
            .get(&spec.key)
            .filter(|v| !v.is_null())
            .or(spec.default.as_ref());
        let Some(raw) = raw else {
            if spec.required {
                return Err(invalid(&spec.key, "value is required".into()));
            }
            continue;
        };

        let value = match raw {
            Value::String(text) if spec.kind == InputKind::Json => match whole_placeholder(text) {
                Some(name) => placeholder_value(name, ctx, strict)?,
                None => spec.kind.coerce(render_value(raw, ctx, strict)?),
            },
            _ => spec.kind.coerce(render_value(raw, ctx, strict)?),
        };
        if spec.required && blank(&value) {
            return Err(invalid(&spec.key, "value is required".into()));
        }
        if spec.kind == InputKind::Select && !spec.options.is_empty() {
            if let Value::String(choice) = &value {
                if !choice.is_empty() && !spec.options.iter().any(|o| o == choice) {
                    return Err(invalid(
                        &spec.key,
                        format!("'{}' is not one of [{}]", choice, spec.options.join(", ")),
                    ));
                }
            }
        }
        inputs.insert(spec.key.clone(), value);
    }

    for (key, raw) in &node.data {
        if def.input(key).is_none() {
            inputs.insert(key.clone(), render_value(raw, ctx, strict)?);
        }
    }
    Ok(inputs)
}

/// Copy of `inputs` safe to record: sensitive values become "***".
pub fn masked(def: &NodeDefinition, inputs: &Map<String, Value>) -> Map<String, Value> {
    inputs
        .iter()
        .map(|(k, v)| {
            let sensitive = def.input(k).is_some_and(|s| s.sensitive);
            let value = if sensitive { Value::String(MASK.into()) } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}
