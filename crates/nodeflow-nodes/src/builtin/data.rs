use serde_json::{json, Map, Value};

use nodeflow_core::context::NodeContext;
use nodeflow_core::error::{FlowError, Result};

use super::{required_str, str_input, text_of};
use crate::definition::{InputSpec, NodeCategory, NodeDefinition, NodeKind};

/// Pure data transforms. None of these touch the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOp {
    JsonQuery,
    RegexReplace,
    Template,
    ParseJson,
}

pub fn definitions() -> Vec<NodeDefinition> {
    let def = |id: &str, name: &str, op: DataOp| {
        NodeDefinition::new(id, name, NodeCategory::Data, NodeKind::Data(op))
            .with_capability("data:transform")
            .with_outputs(&["result"])
    };

    vec![
        def("json_query", "JSON Query", DataOp::JsonQuery)
            .with_input(InputSpec::json("data").required())
            .with_input(InputSpec::string("path").required())
            .with_input(InputSpec::string("output_var")),
        def("regex_replace", "Regex Replace", DataOp::RegexReplace)
            .with_input(InputSpec::text("text"))
            .with_input(InputSpec::string("pattern").required())
            .with_input(InputSpec::string("replacement").default_value(json!("")))
            .with_input(InputSpec::string("output_var")),
        def("template", "Template", DataOp::Template)
            .with_input(InputSpec::text("template").required())
            .with_input(InputSpec::string("output_var")),
        def("parse_json", "Parse JSON", DataOp::ParseJson)
            .with_input(InputSpec::text("text").required())
            .with_input(InputSpec::string("output_var")),
    ]
}

pub(crate) fn run(op: DataOp, inputs: &Map<String, Value>, ctx: &NodeContext<'_>) -> Result<Value> {
    let node = ctx.node_id;
    match op {
        DataOp::JsonQuery => {
            let path = required_str(node, inputs, "path")?;
            let data = match inputs.get("data") {
                Some(Value::String(s)) => serde_json::from_str(s).map_err(|e| invalid(node, "data", e))?,
                Some(v) => v.clone(),
                None => Value::Null,
            };
            Ok(json!({ "result": json_path_query(&data, path) }))
        }
        DataOp::RegexReplace => {
            let text = inputs.get("text").map(text_of).unwrap_or_default();
            let pattern = required_str(node, inputs, "pattern")?;
            let replacement = str_input(inputs, "replacement").unwrap_or("");
            let re = regex::Regex::new(pattern).map_err(|e| invalid(node, "pattern", e))?;
            let result = re.replace_all(&text, replacement).to_string();
            Ok(json!({ "result": result }))
        }
        // Placeholders are already substituted during input resolution
        DataOp::Template => {
            let rendered = inputs.get("template").map(text_of).unwrap_or_default();
            Ok(json!({ "result": rendered }))
        }
        DataOp::ParseJson => {
            let result = match inputs.get("text") {
                Some(Value::String(s)) => serde_json::from_str(s).map_err(|e| invalid(node, "text", e))?,
                Some(v) => v.clone(),
                None => Value::Null,
            };
            Ok(json!({ "result": result }))
        }
    }
}

fn invalid(node: &str, key: &str, err: impl std::fmt::Display) -> FlowError {
    FlowError::InvalidInput {
        node: node.to_string(),
        key: key.to_string(),
        message: err.to_string(),
    }
}

/// Walk a dotted path with optional `[n]` indexes, e.g. `orders[0].id`.
pub fn json_path_query(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        if let Some(bracket_pos) = segment.find('[') {
            let key = &segment[..bracket_pos];
            if !key.is_empty() {
                current = current.get(key).cloned().unwrap_or(Value::Null);
            }
            for index in segment[bracket_pos..]
                .split(['[', ']'])
                .filter(|s| !s.is_empty())
            {
                current = match index.parse::<usize>() {
                    Ok(i) => current.get(i).cloned().unwrap_or(Value::Null),
                    Err(_) => Value::Null,
                };
            }
        } else {
            current = current.get(segment).cloned().unwrap_or(Value::Null);
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_test_utils::TestRun;

    fn exec(op: DataOp, inputs: Value) -> Result<Value> {
        let mut test = TestRun::new("staff");
        let ctx = test.node_context("d1");
        run(op, inputs.as_object().unwrap(), &ctx)
    }

    #[test]
    fn path_query() {
        let data = json!({"orders": [{"id": 7, "tags": [["a", "b"]]}], "name": "x"});
        assert_eq!(json_path_query(&data, "name"), json!("x"));
        assert_eq!(json_path_query(&data, "orders[0].id"), json!(7));
        assert_eq!(json_path_query(&data, "orders[0].tags[0][1]"), json!("b"));
        assert_eq!(json_path_query(&data, "orders[5].id"), Value::Null);
        assert_eq!(json_path_query(&data, ""), data);
    }

    #[test]
    fn json_query_parses_string_data() {
        let out = exec(
            DataOp::JsonQuery,
            json!({"data": "{\"a\": {\"b\": 2}}", "path": "a.b"}),
        )
        .unwrap();
        assert_eq!(out["result"], 2);
    }

    #[test]
    fn regex_replace_and_bad_pattern() {
        let out = exec(
            DataOp::RegexReplace,
            json!({"text": "a1b22c", "pattern": "\\d+", "replacement": "#"}),
        )
        .unwrap();
        assert_eq!(out["result"], "a#b#c");

        let err = exec(DataOp::RegexReplace, json!({"text": "x", "pattern": "("})).unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput { ref key, .. } if key == "pattern"));
    }

    #[test]
    fn parse_json_node() {
        let out = exec(DataOp::ParseJson, json!({"text": "[1, 2]"})).unwrap();
        assert_eq!(out["result"], json!([1, 2]));
        assert!(exec(DataOp::ParseJson, json!({"text": "{oops"})).is_err());
    }

    #[test]
    fn template_passes_rendered_text_through() {
        let out = exec(DataOp::Template, json!({"template": "Hello Ada"})).unwrap();
        assert_eq!(out["result"], "Hello Ada");
    }
}
