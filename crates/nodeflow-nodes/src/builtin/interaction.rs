use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use nodeflow_core::context::NodeContext;
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::types::HumanActionRequest;

use super::{bool_input, required_str, str_input, u64_input};
use crate::definition::{InputSpec, NodeCategory, NodeDefinition, NodeKind};

/// Nodes that pause the run until something outside the engine happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionOp {
    WaitWebhook,
    HumanAction,
}

pub fn definitions() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new(
            "wait_webhook",
            "Wait for Webhook",
            NodeCategory::Interaction,
            NodeKind::Interaction(InteractionOp::WaitWebhook),
        )
        .with_capability("external:webhook")
        .with_input(InputSpec::string("webhook_id"))
        .with_input(InputSpec::number("timeout_ms").default_value(json!(300_000)))
        .with_input(InputSpec::string("url_var").default_value(json!("webhook_url")))
        .with_input(InputSpec::string("output_var"))
        .with_outputs(&["payload", "webhookUrl"]),
        NodeDefinition::new(
            "human_action",
            "Human Action",
            NodeCategory::Interaction,
            NodeKind::Interaction(InteractionOp::HumanAction),
        )
        .with_capability("external:human")
        .with_input(InputSpec::text("message").required())
        .with_input(InputSpec::boolean("show_browser").default_value(json!(false)))
        .with_input(InputSpec::number("timeout_ms").default_value(json!(600_000)))
        .with_input(InputSpec::string("output_var"))
        .with_outputs(&["completed", "response"]),
    ]
}

pub(crate) async fn run(
    op: InteractionOp,
    inputs: &Map<String, Value>,
    ctx: &mut NodeContext<'_>,
) -> Result<Value> {
    match op {
        InteractionOp::WaitWebhook => wait_webhook(inputs, ctx).await,
        InteractionOp::HumanAction => human_action(inputs, ctx).await,
    }
}

async fn wait_webhook(inputs: &Map<String, Value>, ctx: &mut NodeContext<'_>) -> Result<Value> {
    let run_id = ctx.run_id().to_string();
    let webhook_id = str_input(inputs, "webhook_id").unwrap_or(ctx.node_id).to_string();
    let timeout_ms = u64_input(inputs, "timeout_ms").unwrap_or(300_000);
    let hooks = ctx.services.webhooks.clone();

    let url = hooks.register(&run_id, &webhook_id).await;
    if let Some(var) = str_input(inputs, "url_var") {
        ctx.run.set_variable(var, json!(url));
    }

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Some(payload) = hooks.check(&run_id, &webhook_id).await {
            hooks.unregister(&run_id, &webhook_id).await;
            info!(run_id = %run_id, webhook_id = %webhook_id, "Webhook payload consumed");
            return Ok(json!({ "payload": payload.clone(), "webhookUrl": url, "result": payload }));
        }
        if ctx.handle().stop_requested() {
            hooks.unregister(&run_id, &webhook_id).await;
            return Ok(json!({ "payload": null, "webhookUrl": url, "interrupted": true }));
        }
        if Instant::now() >= deadline {
            hooks.unregister(&run_id, &webhook_id).await;
            warn!(run_id = %run_id, webhook_id = %webhook_id, timeout_ms, "Webhook wait timed out");
            return Err(FlowError::WaitTimeout {
                what: format!("webhook '{}'", webhook_id),
                timeout_ms,
            });
        }
        tokio::time::sleep(ctx.services.poll_interval).await;
    }
}

async fn human_action(inputs: &Map<String, Value>, ctx: &mut NodeContext<'_>) -> Result<Value> {
    let run_id = ctx.run_id().to_string();
    let message = required_str(ctx.node_id, inputs, "message")?.to_string();
    let timeout_ms = u64_input(inputs, "timeout_ms").unwrap_or(600_000);
    let gate = ctx.services.human.clone();

    gate.request(
        &run_id,
        HumanActionRequest {
            message,
            show_browser: bool_input(inputs, "show_browser"),
            timeout_ms: Some(timeout_ms),
        },
    )
    .await;

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if gate.is_completed(&run_id).await {
            let response = gate.response(&run_id).await.unwrap_or(Value::Null);
            gate.clear_run(&run_id).await;
            return Ok(json!({ "completed": true, "response": response.clone(), "result": response }));
        }
        if ctx.handle().stop_requested() {
            gate.clear_run(&run_id).await;
            return Ok(json!({ "completed": false, "interrupted": true }));
        }
        if Instant::now() >= deadline {
            gate.clear_run(&run_id).await;
            warn!(run_id = %run_id, timeout_ms, "Human action timed out");
            return Err(FlowError::WaitTimeout {
                what: "human action".into(),
                timeout_ms,
            });
        }
        tokio::time::sleep(ctx.services.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::types::RunStatus;
    use nodeflow_test_utils::TestRun;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn webhook_delivered_while_waiting() {
        let mut test = TestRun::new("staff");
        let hooks = test.services.webhooks.clone();
        let run_id = test.context.run_id.to_string();

        let sender = tokio::spawn(async move {
            while !hooks.is_pending(&run_id, "order-paid").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            hooks.receive(&run_id, "order-paid", json!({"amount": 10})).await
        });

        let mut ctx = test.node_context("w1");
        let out = run(
            InteractionOp::WaitWebhook,
            &map(json!({"webhook_id": "order-paid", "timeout_ms": 5_000})),
            &mut ctx,
        )
        .await
        .unwrap();

        assert_eq!(out["payload"], json!({"amount": 10}));
        assert!(out["webhookUrl"]
            .as_str()
            .unwrap()
            .ends_with("/order-paid"));
        assert!(ctx.run.variable("webhook_url").is_some());
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn webhook_queued_before_wait_is_adopted() {
        let mut test = TestRun::new("staff");
        let run_id = test.context.run_id.to_string();
        test.services.webhooks.receive(&run_id, "w1", json!("early")).await;

        let mut ctx = test.node_context("w1");
        let out = run(InteractionOp::WaitWebhook, &map(json!({"timeout_ms": 1_000})), &mut ctx)
            .await
            .unwrap();
        assert_eq!(out["payload"], "early");
    }

    #[tokio::test]
    async fn webhook_times_out() {
        let mut test = TestRun::new("staff");
        let mut ctx = test.node_context("w1");
        let err = run(InteractionOp::WaitWebhook, &map(json!({"timeout_ms": 30})), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::WaitTimeout { timeout_ms: 30, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn human_action_completes() {
        let mut test = TestRun::new("staff");
        let gate = test.services.human.clone();
        let run_id = test.context.run_id.to_string();

        let operator = tokio::spawn(async move {
            while gate.pending(&run_id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            gate.complete(&run_id, Some(json!("4521"))).await
        });

        let mut ctx = test.node_context("h1");
        let out = run(
            InteractionOp::HumanAction,
            &map(json!({"message": "enter the SMS code", "timeout_ms": 5_000})),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(out["completed"], true);
        assert_eq!(out["response"], "4521");
        assert!(operator.await.unwrap());
    }

    #[tokio::test]
    async fn stop_request_interrupts_wait() {
        let mut test = TestRun::new("staff");
        test.handle().request_stop("cancelled by request", RunStatus::Cancelled);
        let mut ctx = test.node_context("h1");
        let out = run(
            InteractionOp::HumanAction,
            &map(json!({"message": "hi", "timeout_ms": 5_000})),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(out["interrupted"], true);
    }
}
