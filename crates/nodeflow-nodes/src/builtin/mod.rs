pub mod browser;
pub mod control;
pub mod data;
pub mod interaction;
pub mod network;

use serde_json::{Map, Value};

use nodeflow_core::error::{FlowError, Result};

use crate::definition::NodeDefinition;

pub use control::ControlOp;
pub use data::DataOp;
pub use interaction::InteractionOp;

/// Every built-in node definition, grouped by category.
pub fn definitions() -> Vec<NodeDefinition> {
    let mut defs = control::definitions();
    defs.extend(data::definitions());
    defs.extend(browser::definitions());
    defs.extend(network::definitions());
    defs.extend(interaction::definitions());
    defs
}

/// JS-style truthiness used for branch selection and conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Non-empty string input.
pub(crate) fn str_input<'a>(inputs: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    inputs
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

pub(crate) fn required_str<'a>(
    node: &str,
    inputs: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str> {
    str_input(inputs, key).ok_or_else(|| FlowError::InvalidInput {
        node: node.to_string(),
        key: key.to_string(),
        message: "value is required".to_string(),
    })
}

pub(crate) fn u64_input(inputs: &Map<String, Value>, key: &str) -> Option<u64> {
    match inputs.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn bool_input(inputs: &Map<String, Value>, key: &str) -> bool {
    inputs.get(key).is_some_and(is_truthy)
}

/// Text form of a value: strings verbatim, everything else as JSON.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!(-1)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn input_helpers() {
        let inputs: Map<String, Value> = json!({
            "name": "",
            "count": "12",
            "ratio": 2.9,
            "flag": "yes"
        })
        .as_object()
        .cloned()
        .unwrap();

        assert_eq!(str_input(&inputs, "name"), None);
        assert!(required_str("n1", &inputs, "name").is_err());
        assert_eq!(u64_input(&inputs, "count"), Some(12));
        assert_eq!(u64_input(&inputs, "ratio"), Some(2));
        assert!(bool_input(&inputs, "flag"));
        assert!(!bool_input(&inputs, "absent"));
    }

    #[test]
    fn builtin_ids_are_unique() {
        let defs = definitions();
        let mut ids: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }
}
