use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};
use crate::event::EventBus;
use crate::human::HumanGate;
use crate::traits::ActionDriver;
use crate::types::*;
use crate::webhook::WebhookCorrelator;

/// A request to end the run early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub reason: String,
    pub status: RunStatus,
}

#[derive(Debug)]
struct Progress {
    status: RunStatus,
    current_node: Option<String>,
    executed_count: usize,
    errors: Vec<String>,
}

/// Shared, cross-task view of one live run.
///
/// The executing task owns the `RunContext`; everything else (status queries,
/// cancellation, node-issued control signals) goes through this handle.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    started: Instant,
    stop_workflow: AtomicBool,
    break_loop: AtomicBool,
    continue_loop: AtomicBool,
    stop: Mutex<Option<StopRequest>>,
    progress: Mutex<Progress>,
}

impl RunHandle {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            started: Instant::now(),
            stop_workflow: AtomicBool::new(false),
            break_loop: AtomicBool::new(false),
            continue_loop: AtomicBool::new(false),
            stop: Mutex::new(None),
            progress: Mutex::new(Progress {
                status: RunStatus::Running,
                current_node: None,
                executed_count: 0,
                errors: Vec::new(),
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Ask the run to unwind before its next node visit.
    pub fn request_stop(&self, reason: impl Into<String>, status: RunStatus) {
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(StopRequest {
            reason: reason.into(),
            status,
        });
        self.stop_workflow.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_workflow.load(Ordering::SeqCst)
    }

    pub fn stop_request(&self) -> Option<StopRequest> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_break(&self) {
        self.break_loop.store(true, Ordering::SeqCst);
    }

    pub fn break_pending(&self) -> bool {
        self.break_loop.load(Ordering::SeqCst)
    }

    /// Clear the break flag, returning whether it was set.
    pub fn take_break(&self) -> bool {
        self.break_loop.swap(false, Ordering::SeqCst)
    }

    pub fn request_continue(&self) {
        self.continue_loop.store(true, Ordering::SeqCst);
    }

    /// Clear the continue flag, returning whether it was set.
    pub fn take_continue(&self) -> bool {
        self.continue_loop.swap(false, Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        RunSnapshot {
            run_id: self.run_id.clone(),
            status: progress.status,
            current_node: progress.current_node.clone(),
            executed_count: progress.executed_count,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            errors: progress.errors.clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        f(&mut self.progress.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Mutable state of one in-flight run. Never shared between runs.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub workflow_id: String,
    pub caller: Caller,
    pub profile: Option<Profile>,
    pub variables: Map<String, Value>,
    pub global_variables: Map<String, Value>,
    pub current_node: Option<String>,
    pub executed: Vec<ExecutedNode>,
    pub errors: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    handle: Arc<RunHandle>,
}

impl RunContext {
    pub fn new(workflow_id: impl Into<String>, caller: Caller, handle: Arc<RunHandle>) -> Self {
        Self {
            run_id: handle.run_id().clone(),
            workflow_id: workflow_id.into(),
            caller,
            profile: None,
            variables: Map::new(),
            global_variables: Map::new(),
            current_node: None,
            executed: Vec::new(),
            errors: Vec::new(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            handle,
        }
    }

    pub fn with_profile(mut self, profile: Option<Profile>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_globals(mut self, globals: Map<String, Value>) -> Self {
        self.global_variables = globals;
        self
    }

    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Resolve a name against run variables, then profile, then globals.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.variables.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.profile.as_ref().and_then(|p| p.get(name)) {
            return Some(v);
        }
        self.global_variables.get(name).cloned()
    }

    pub fn enter_node(&mut self, node_id: &str) {
        self.current_node = Some(node_id.to_string());
        self.handle
            .update(|p| p.current_node = Some(node_id.to_string()));
    }

    pub fn record_execution(&mut self, record: ExecutedNode) {
        self.executed.push(record);
        let count = self.executed.len();
        self.handle.update(|p| p.executed_count = count);
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.errors.push(message.clone());
        self.handle.update(|p| p.errors.push(message));
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.handle.update(|p| p.status = status);
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Long-lived services every node invocation may use.
#[derive(Clone)]
pub struct RunServices {
    pub webhooks: Arc<WebhookCorrelator>,
    pub human: Arc<HumanGate>,
    pub events: Arc<EventBus>,
    pub poll_interval: Duration,
}

impl RunServices {
    pub fn new(events: Arc<EventBus>, webhook_base_url: impl Into<String>) -> Self {
        Self {
            webhooks: Arc::new(WebhookCorrelator::new(webhook_base_url).with_event_bus(events.clone())),
            human: Arc::new(HumanGate::new(events.clone())),
            events,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What a node behaviour sees while it runs.
pub struct NodeContext<'a> {
    pub run: &'a mut RunContext,
    pub node_id: &'a str,
    pub driver: Option<Arc<dyn ActionDriver>>,
    pub services: &'a RunServices,
}

impl<'a> NodeContext<'a> {
    pub fn new(run: &'a mut RunContext, node_id: &'a str, services: &'a RunServices) -> Self {
        Self {
            run,
            node_id,
            driver: None,
            services,
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn ActionDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.run_id
    }

    pub fn handle(&self) -> &Arc<RunHandle> {
        self.run.handle()
    }

    /// Hand an action to the run's driver session.
    pub async fn perform(&self, action: &str, inputs: Map<String, Value>) -> Result<Value> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| FlowError::NoDriverSession(action.to_string()))?;
        driver
            .perform(ActionRequest {
                run_id: self.run.run_id.clone(),
                node_id: self.node_id.to_string(),
                action: action.to_string(),
                inputs,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> RunContext {
        let handle = Arc::new(RunHandle::new(RunId::from_str("run-1")));
        RunContext::new("wf-1", Caller::new("u1", "staff"), handle)
    }

    #[test]
    fn lookup_scope_order() {
        let mut ctx = context()
            .with_profile(Some(Profile::new("p1").with_field("name", json!("profile"))))
            .with_globals(
                [("name".to_string(), json!("global")), ("only_global".to_string(), json!(1))]
                    .into_iter()
                    .collect(),
            );
        assert_eq!(ctx.lookup("name"), Some(json!("profile")));
        ctx.set_variable("name", json!("run"));
        assert_eq!(ctx.lookup("name"), Some(json!("run")));
        assert_eq!(ctx.lookup("only_global"), Some(json!(1)));
        assert_eq!(ctx.lookup("missing"), None);
    }

    #[test]
    fn progress_mirrors_context() {
        let mut ctx = context();
        ctx.enter_node("n1");
        ctx.record_execution(ExecutedNode {
            id: "n1".into(),
            node_type: "start".into(),
            inputs: Map::new(),
            outputs: json!({}),
            timestamp: Utc::now(),
        });
        ctx.push_error("soft failure");

        let snap = ctx.handle().snapshot();
        assert_eq!(snap.current_node.as_deref(), Some("n1"));
        assert_eq!(snap.executed_count, 1);
        assert_eq!(snap.errors, vec!["soft failure".to_string()]);
        assert_eq!(snap.status, RunStatus::Running);
    }

    #[test]
    fn signals_are_taken_once() {
        let handle = RunHandle::new(RunId::new());
        assert!(!handle.take_break());
        handle.request_break();
        assert!(handle.break_pending());
        assert!(handle.take_break());
        assert!(!handle.break_pending());

        handle.request_continue();
        assert!(handle.take_continue());
        assert!(!handle.take_continue());
    }

    #[test]
    fn stop_request_carries_status() {
        let handle = RunHandle::new(RunId::new());
        assert!(!handle.stop_requested());
        handle.request_stop("operator", RunStatus::Cancelled);
        assert!(handle.stop_requested());
        assert_eq!(
            handle.stop_request(),
            Some(StopRequest {
                reason: "operator".into(),
                status: RunStatus::Cancelled
            })
        );
    }

    #[tokio::test]
    async fn perform_without_driver_fails() {
        let mut run = context();
        let services = RunServices::new(Arc::new(EventBus::default()), "http://localhost");
        let ctx = NodeContext {
            run: &mut run,
            node_id: "n1",
            driver: None,
            services: &services,
        };
        let err = ctx.perform("browser.open", Map::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::NoDriverSession(ref a) if a == "browser.open"));
        assert!(!err.is_retryable());
    }
}
