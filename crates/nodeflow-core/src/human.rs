use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::event::EventBus;
use crate::types::{EngineEvent, HumanActionNotice, HumanActionRequest};

/// A run paused on a human operator.
#[derive(Debug, Clone)]
pub struct PendingHumanAction {
    pub request: HumanActionRequest,
    pub requested_at: DateTime<Utc>,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<String, PendingHumanAction>,
    completed: HashMap<String, Option<Value>>,
}

/// Tracks runs waiting for a human to acknowledge or supply input.
pub struct HumanGate {
    state: Mutex<GateState>,
    event_bus: Arc<EventBus>,
}

impl HumanGate {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            event_bus,
        }
    }

    /// Record a pending request and notify the hosting UI.
    pub async fn request(&self, run_id: &str, request: HumanActionRequest) {
        let notice = HumanActionNotice {
            run_id: run_id.to_string(),
            message: request.message.clone(),
            show_browser: request.show_browser,
            timeout: request.timeout_ms,
        };

        {
            let mut state = self.state.lock().await;
            state.completed.remove(run_id);
            state.pending.insert(
                run_id.to_string(),
                PendingHumanAction {
                    request,
                    requested_at: Utc::now(),
                },
            );
        }

        info!(run_id, message = %notice.message, "Human action requested");
        self.event_bus
            .publish(EngineEvent::HumanActionRequested(notice));
    }

    /// Mark the run's request as done. Returns false if nothing was pending.
    pub async fn complete(&self, run_id: &str, input: Option<Value>) -> bool {
        let mut state = self.state.lock().await;
        if state.pending.remove(run_id).is_none() {
            return false;
        }
        state.completed.insert(run_id.to_string(), input);
        drop(state);

        info!(run_id, "Human action completed");
        self.event_bus.publish(EngineEvent::HumanActionCompleted {
            run_id: run_id.to_string(),
        });
        true
    }

    pub async fn is_completed(&self, run_id: &str) -> bool {
        self.state.lock().await.completed.contains_key(run_id)
    }

    pub async fn pending(&self, run_id: &str) -> Option<PendingHumanAction> {
        self.state.lock().await.pending.get(run_id).cloned()
    }

    /// Ids of every run currently waiting on a human.
    pub async fn pending_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.state.lock().await.pending.keys().cloned().collect();
        runs.sort();
        runs
    }

    /// Input the operator supplied on completion, if any.
    pub async fn response(&self, run_id: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .completed
            .get(run_id)
            .cloned()
            .flatten()
    }

    pub async fn clear_run(&self, run_id: &str) {
        let mut state = self.state.lock().await;
        state.pending.remove(run_id);
        state.completed.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(message: &str) -> HumanActionRequest {
        HumanActionRequest {
            message: message.to_string(),
            show_browser: true,
            timeout_ms: Some(30_000),
        }
    }

    #[tokio::test]
    async fn request_then_complete() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let gate = HumanGate::new(bus);

        gate.request("run-1", request("solve the captcha")).await;
        assert_eq!(gate.pending_runs().await, vec!["run-1".to_string()]);
        assert!(!gate.is_completed("run-1").await);

        match rx.recv().await.unwrap() {
            EngineEvent::HumanActionRequested(notice) => {
                assert_eq!(notice.run_id, "run-1");
                assert_eq!(notice.message, "solve the captcha");
                assert!(notice.show_browser);
                assert_eq!(notice.timeout, Some(30_000));
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(gate.complete("run-1", Some(json!({"code": "1234"}))).await);
        assert!(gate.is_completed("run-1").await);
        assert!(gate.pending("run-1").await.is_none());
        assert_eq!(gate.response("run-1").await, Some(json!({"code": "1234"})));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::HumanActionCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn complete_without_request() {
        let gate = HumanGate::new(Arc::new(EventBus::default()));
        assert!(!gate.complete("ghost", None).await);
        assert!(!gate.is_completed("ghost").await);
    }

    #[tokio::test]
    async fn clear_run_resets_state() {
        let gate = HumanGate::new(Arc::new(EventBus::default()));
        gate.request("r", request("confirm")).await;
        gate.complete("r", None).await;
        assert!(gate.is_completed("r").await);
        assert_eq!(gate.response("r").await, None);

        gate.clear_run("r").await;
        assert!(!gate.is_completed("r").await);
        assert!(gate.pending_runs().await.is_empty());
    }
}
