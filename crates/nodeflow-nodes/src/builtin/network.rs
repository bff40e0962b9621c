use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;

use nodeflow_core::context::NodeContext;
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::policy::RiskTier;

use super::{required_str, str_input, text_of, u64_input};
use crate::definition::{InputSpec, NodeCategory, NodeDefinition, NodeKind};

const MAX_BODY: usize = 100_000;

pub fn definitions() -> Vec<NodeDefinition> {
    vec![NodeDefinition::new(
        "http_request",
        "HTTP Request",
        NodeCategory::Network,
        NodeKind::Http,
    )
    .with_risk(RiskTier::Medium)
    .with_capability("http:request")
    .with_input(InputSpec::string("url").required())
    .with_input(
        InputSpec::select("method", &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"])
            .default_value(json!("GET")),
    )
    .with_input(InputSpec::json("headers"))
    .with_input(InputSpec::text("body"))
    .with_input(InputSpec::number("timeout_ms").default_value(json!(30_000)))
    .with_input(InputSpec::string("output_var"))
    .with_outputs(&["status", "ok", "headers", "body"])
    .with_retry(2, 1000)]
}

/// Perform the request. Transport failures are retryable; HTTP error
/// statuses are reported in the output with `ok: false`.
pub(crate) async fn http_request(inputs: &Map<String, Value>, ctx: &NodeContext<'_>) -> Result<Value> {
    let node = ctx.node_id;
    let url = required_str(node, inputs, "url")?;
    let timeout = Duration::from_millis(u64_input(inputs, "timeout_ms").unwrap_or(30_000));

    let method = str_input(inputs, "method")
        .unwrap_or("GET")
        .to_uppercase()
        .parse::<reqwest::Method>()
        .map_err(|e| FlowError::InvalidInput {
            node: node.to_string(),
            key: "method".into(),
            message: e.to_string(),
        })?;

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FlowError::action(node, e.to_string()))?;

    let mut req = client.request(method.clone(), url);
    for (k, v) in headers(inputs) {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(body) = inputs.get("body").filter(|b| !b.is_null()) {
        req = req.body(text_of(body));
    }

    debug!(run_id = %ctx.run_id(), node_id = %node, %method, url, "HTTP request");
    let resp = req
        .send()
        .await
        .map_err(|e| FlowError::action(node, e.to_string()))?;

    let status = resp.status();
    let response_headers: Map<String, Value> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or("?"))))
        .collect();
    let mut text = resp
        .text()
        .await
        .map_err(|e| FlowError::action(node, e.to_string()))?;
    if text.len() > MAX_BODY {
        let mut cut = MAX_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

    Ok(json!({
        "status": status.as_u16(),
        "ok": status.is_success(),
        "headers": response_headers,
        "body": body.clone(),
        "result": body,
    }))
}

fn headers(inputs: &Map<String, Value>) -> HashMap<String, String> {
    match inputs.get("headers") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), text_of(v))).collect(),
        Some(Value::String(s)) => serde_json::from_str::<HashMap<String, Value>>(s)
            .map(|m| m.into_iter().map(|(k, v)| (k, text_of(&v))).collect())
            .unwrap_or_default(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_test_utils::TestRun;

    #[test]
    fn headers_from_object_or_string() {
        let inputs = json!({"headers": {"X-Count": 3, "Accept": "json"}})
            .as_object()
            .cloned()
            .unwrap();
        let h = headers(&inputs);
        assert_eq!(h["X-Count"], "3");
        assert_eq!(h["Accept"], "json");

        let inputs = json!({"headers": "{\"A\": \"b\"}"}).as_object().cloned().unwrap();
        assert_eq!(headers(&inputs)["A"], "b");
        assert!(headers(&Map::new()).is_empty());
    }

    #[tokio::test]
    async fn missing_url_is_invalid_input() {
        let mut test = TestRun::new("staff");
        let ctx = test.node_context("h1");
        let err = http_request(&Map::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput { ref key, .. } if key == "url"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_host_is_retryable() {
        let mut test = TestRun::new("staff");
        let ctx = test.node_context("h1");
        let inputs = json!({"url": "http://127.0.0.1:1/", "timeout_ms": 500})
            .as_object()
            .cloned()
            .unwrap();
        let err = http_request(&inputs, &ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn default_retry_policy() {
        let def = &definitions()[0];
        assert_eq!(def.retry.retry_count, 2);
        assert_eq!(def.retry.retry_delay_ms, 1000);
    }
}
