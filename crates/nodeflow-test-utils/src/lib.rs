//! Mocks and fixtures shared by the nodeflow test suites.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use nodeflow_core::context::{NodeContext, RunContext, RunHandle, RunServices};
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::event::EventBus;
use nodeflow_core::traits::{ActionDriver, AuditSink, DriverFactory};
use nodeflow_core::types::*;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── ScriptedDriver ──────────────────────────────────────────────

/// Driver that answers from a script and records every request.
///
/// Unscripted actions echo `{"action": <name>, "ok": true}`.
#[derive(Default)]
pub struct ScriptedDriver {
    responses: Mutex<HashMap<String, VecDeque<Result<Value>>>>,
    defaults: Mutex<HashMap<String, Value>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<ActionRequest>>,
    closed: AtomicBool,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `action` with `value` once the queue is drained.
    pub fn respond(self, action: &str, value: Value) -> Self {
        lock(&self.defaults).insert(action.to_string(), value);
        self
    }

    /// Queue one response for the next call to `action`.
    pub fn then(self, action: &str, result: Result<Value>) -> Self {
        lock(&self.responses)
            .entry(action.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Fail the next `times` calls to `action` with a retryable error.
    pub fn fail_times(mut self, action: &str, times: usize) -> Self {
        for i in 0..times {
            self = self.then(action, Err(FlowError::Driver(format!("scripted failure {}", i + 1))));
        }
        self
    }

    /// Sleep before answering `action`.
    pub fn delay(self, action: &str, delay: Duration) -> Self {
        lock(&self.delays).insert(action.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<ActionRequest> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, action: &str) -> Vec<ActionRequest> {
        self.calls().into_iter().filter(|c| c.action == action).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ActionDriver for ScriptedDriver {
    fn perform(&self, request: ActionRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let action = request.action.clone();
            lock(&self.calls).push(request);

            let delay = lock(&self.delays).get(&action).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let queued = lock(&self.responses)
                .get_mut(&action)
                .and_then(|q| q.pop_front());
            if let Some(result) = queued {
                return result;
            }
            let default = lock(&self.defaults).get(&action).cloned();
            Ok(default.unwrap_or_else(|| json!({ "action": action, "ok": true })))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Factory handing out one shared `ScriptedDriver`.
pub struct ScriptedDriverFactory {
    driver: Arc<ScriptedDriver>,
    opened: Mutex<Vec<String>>,
    fail_open: bool,
}

impl ScriptedDriverFactory {
    pub fn new(driver: Arc<ScriptedDriver>) -> Self {
        Self {
            driver,
            opened: Mutex::new(Vec::new()),
            fail_open: false,
        }
    }

    /// Refuse to open sessions.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Arc::new(ScriptedDriver::new()))
        }
    }

    /// Profile ids sessions were opened for.
    pub fn opened_profiles(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl DriverFactory for ScriptedDriverFactory {
    fn open_session<'a>(
        &'a self,
        profile: &'a Profile,
        _caller: &'a Caller,
    ) -> BoxFuture<'a, Result<Arc<dyn ActionDriver>>> {
        Box::pin(async move {
            if self.fail_open {
                return Err(FlowError::Driver(format!(
                    "cannot open session for profile {}",
                    profile.id
                )));
            }
            lock(&self.opened).push(profile.id.clone());
            Ok(self.driver.clone() as Arc<dyn ActionDriver>)
        })
    }
}

// ── Audit sinks ─────────────────────────────────────────────────

/// Keeps every audit event in memory. Can be switched to fail.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(FlowError::Audit("audit sink unavailable".into()));
            }
            lock(&self.events).push(event);
            Ok(())
        })
    }
}

// ── Run scaffolding ─────────────────────────────────────────────

/// A run context plus services, for invoking node behaviours directly.
pub struct TestRun {
    pub context: RunContext,
    pub services: RunServices,
}

impl TestRun {
    pub fn new(role: &str) -> Self {
        let handle = Arc::new(RunHandle::new(RunId::new()));
        let context = RunContext::new("test-workflow", Caller::new("tester", role), handle);
        let services = RunServices::new(Arc::new(EventBus::default()), "http://127.0.0.1:18790")
            .with_poll_interval(Duration::from_millis(10));
        Self { context, services }
    }

    pub fn handle(&self) -> Arc<RunHandle> {
        self.context.handle().clone()
    }

    pub fn node_context<'a>(&'a mut self, node_id: &'a str) -> NodeContext<'a> {
        NodeContext::new(&mut self.context, node_id, &self.services)
    }
}

// ── Fixtures ────────────────────────────────────────────────────

pub mod fixtures {
    use super::*;

    pub fn workflow(graph: Value) -> Workflow {
        Workflow::new("wf-test", "Test workflow", graph)
    }

    /// `start -> <types...> -> end`, node ids `n1..`.
    pub fn linear_graph(types: &[&str]) -> Value {
        let mut nodes = vec![json!({"id": "start", "type": "start"})];
        let mut edges = Vec::new();
        let mut prev = "start".to_string();
        for (i, t) in types.iter().enumerate() {
            let id = format!("n{}", i + 1);
            nodes.push(json!({"id": id, "type": t}));
            edges.push(json!({"source": prev, "target": id}));
            prev = id;
        }
        nodes.push(json!({"id": "end", "type": "end"}));
        edges.push(json!({"source": prev, "target": "end"}));
        json!({ "nodes": nodes, "edges": edges })
    }

    /// Editor-exported keyed graph: start -> condition -> (a | b).
    pub fn keyed_graph() -> Value {
        json!({
            "drawflow": {
                "Home": {
                    "data": {
                        "1": {
                            "id": 1,
                            "name": "start",
                            "data": {},
                            "outputs": {
                                "output_1": { "connections": [{ "node": "2", "output": "input_1" }] }
                            }
                        },
                        "2": {
                            "id": 2,
                            "name": "condition",
                            "data": { "left": "{{flag}}", "operator": "truthy" },
                            "outputs": {
                                "output_1": { "connections": [{ "node": "3", "output": "input_1" }] },
                                "output_2": { "connections": [{ "node": "4", "output": "input_1" }] }
                            }
                        },
                        "3": {
                            "id": 3,
                            "name": "set_variable",
                            "data": { "name": "branch", "value": "yes" },
                            "outputs": {}
                        },
                        "4": {
                            "id": 4,
                            "name": "set_variable",
                            "data": { "name": "branch", "value": "no" },
                            "outputs": {}
                        }
                    }
                }
            }
        })
    }

    /// Write a config file into a fresh temp dir.
    pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("nodeflow.toml");
        std::fs::write(&path, contents).unwrap_or_else(|e| panic!("write config: {e}"));
        (dir, path)
    }
}
