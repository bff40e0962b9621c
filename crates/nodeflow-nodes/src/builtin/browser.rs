use serde_json::{json, Map, Value};
use tracing::debug;

use nodeflow_core::context::NodeContext;
use nodeflow_core::error::Result;
use nodeflow_core::policy::RiskTier;

use crate::definition::{InputSpec, NodeCategory, NodeDefinition, NodeKind};

pub fn definitions() -> Vec<NodeDefinition> {
    let def = |id: &str, name: &str, action: &str| {
        NodeDefinition::new(id, name, NodeCategory::Browser, NodeKind::Action(action.into()))
    };

    vec![
        def("browser_open", "Open Page", "browser.open")
            .with_risk(RiskTier::Medium)
            .with_capability("browser:basic")
            .with_input(InputSpec::string("url").required())
            .with_input(InputSpec::number("timeout_ms").default_value(json!(30_000)))
            .with_outputs(&["url", "title"])
            .with_retry(2, 1000),
        def("browser_click", "Click Element", "browser.click")
            .with_risk(RiskTier::Medium)
            .with_capability("browser:basic")
            .with_input(InputSpec::string("selector").required())
            .with_input(InputSpec::number("wait_ms").default_value(json!(0)))
            .with_retry(1, 500),
        def("browser_type", "Type Text", "browser.type")
            .with_risk(RiskTier::Medium)
            .with_capability("browser:form")
            .with_input(InputSpec::string("selector").required())
            .with_input(InputSpec::text("text").sensitive())
            .with_input(InputSpec::boolean("clear").default_value(json!(true)))
            .with_retry(1, 500),
        def("browser_extract", "Extract Content", "browser.extract")
            .with_risk(RiskTier::Low)
            .with_capability("browser:basic")
            .with_input(InputSpec::string("selector").required())
            .with_input(InputSpec::string("attribute").default_value(json!("text")))
            .with_input(InputSpec::boolean("all").default_value(json!(false)))
            .with_input(InputSpec::string("output_var"))
            .with_outputs(&["result"]),
        def("browser_cookies", "Manage Cookies", "browser.cookies")
            .with_risk(RiskTier::High)
            .with_capability("browser:cookies")
            .with_input(InputSpec::select("operation", &["get", "set", "clear"]).default_value(json!("get")))
            .with_input(InputSpec::json("cookies").sensitive())
            .with_input(InputSpec::string("output_var"))
            .with_outputs(&["result"]),
        def("browser_js_eval", "Evaluate Script", "browser.js_eval")
            .with_risk(RiskTier::Critical)
            .with_capability("browser:js_eval")
            .with_input(InputSpec::text("script").required())
            .with_input(InputSpec::string("output_var"))
            .with_outputs(&["result"]),
    ]
}

/// Delegate an action to the run's driver session.
pub(crate) async fn perform(
    action: &str,
    inputs: &Map<String, Value>,
    ctx: &mut NodeContext<'_>,
) -> Result<Value> {
    debug!(run_id = %ctx.run_id(), node_id = %ctx.node_id, action, "Dispatching to driver");
    let value = ctx.perform(action, inputs.clone()).await?;
    Ok(match value {
        Value::Object(_) => value,
        other => json!({ "result": other }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::error::FlowError;
    use nodeflow_test_utils::{ScriptedDriver, TestRun};
    use std::sync::Arc;

    #[tokio::test]
    async fn wraps_scalar_driver_results() {
        let driver = Arc::new(ScriptedDriver::new().respond("browser.extract", json!("Welcome")));
        let mut test = TestRun::new("staff");
        let mut ctx = test.node_context("x1").with_driver(driver.clone());

        let inputs = json!({"selector": "h1"}).as_object().cloned().unwrap();
        let out = perform("browser.extract", &inputs, &mut ctx).await.unwrap();
        assert_eq!(out, json!({"result": "Welcome"}));

        let calls = driver.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, "browser.extract");
        assert_eq!(calls[0].node_id, "x1");
        assert_eq!(calls[0].inputs["selector"], "h1");
    }

    #[tokio::test]
    async fn no_session_fails_without_retry() {
        let mut test = TestRun::new("staff");
        let mut ctx = test.node_context("x1");
        let err = perform("browser.open", &Map::new(), &mut ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::NoDriverSession(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn risk_and_capabilities() {
        let defs = definitions();
        let js = defs.iter().find(|d| d.id == "browser_js_eval").unwrap();
        assert_eq!(js.risk, RiskTier::Critical);
        assert_eq!(js.capabilities, vec!["browser:js_eval".to_string()]);

        let typing = defs.iter().find(|d| d.id == "browser_type").unwrap();
        assert!(typing.input("text").unwrap().sensitive);
    }
}
