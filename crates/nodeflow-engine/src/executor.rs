use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use nodeflow_core::config::{AppConfig, EngineConfig};
use nodeflow_core::context::{NodeContext, RunContext, RunHandle, RunServices};
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::event::EventBus;
use nodeflow_core::human::HumanGate;
use nodeflow_core::traits::{ActionDriver, AuditSink, CapabilityAuthority, DriverFactory};
use nodeflow_core::types::*;
use nodeflow_core::webhook::WebhookCorrelator;
use nodeflow_nodes::{is_truthy, NodeDefinition, NodeRegistry};

use crate::audit::audit_sink_from_config;
use crate::graph::{normalize_port, ParsedGraph};
use crate::template;

/// Per-invocation inputs to [`Executor::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub run_id: Option<RunId>,
    pub profile: Option<Profile>,
    pub caller: Caller,
    pub variables: Map<String, Value>,
}

impl ExecuteOptions {
    pub fn new(caller: Caller) -> Self {
        Self {
            run_id: None,
            profile: None,
            caller,
            variables: Map::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }
}

/// Immutable per-run traversal state.
struct Walk<'g> {
    graph: &'g ParsedGraph,
    driver: Option<Arc<dyn ActionDriver>>,
}

type LiveRuns = Arc<Mutex<HashMap<RunId, Arc<RunHandle>>>>;

/// Pending work of a walk.
///
/// Frames are popped last in first out, so the successors of a node run one
/// after another in edge order, each with its whole subtree before the next.
enum Frame<'g> {
    Visit { node_id: &'g str, depth: usize },
    Loop(LoopFrame<'g>),
}

/// What follows a visited node.
enum Next<'g> {
    Targets(Vec<&'g str>),
    Loop(LoopFrame<'g>),
}

/// A loop node walking its body once per item.
struct LoopFrame<'g> {
    node_id: &'g str,
    items: Vec<Value>,
    item_var: String,
    index_var: String,
    body: Vec<&'g str>,
    depth: usize,
    next_item: usize,
    /// Next body target of the current item; `None` between items.
    cursor: Option<usize>,
}

impl<'g> LoopFrame<'g> {
    fn new(graph: &'g ParsedGraph, node_id: &'g str, payload: &Value, depth: usize) -> Self {
        Self {
            node_id,
            items: payload
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            item_var: payload
                .get("itemVar")
                .and_then(Value::as_str)
                .unwrap_or("item")
                .to_string(),
            index_var: payload
                .get("indexVar")
                .and_then(Value::as_str)
                .unwrap_or("index")
                .to_string(),
            body: graph.outgoing(node_id).map(|e| e.target.as_str()).collect(),
            depth,
            next_item: 0,
            cursor: None,
        }
    }

    /// Next body node to visit, binding the next item once the current one
    /// is done. `None` when the loop is over.
    fn advance(&mut self, handle: &RunHandle, ctx: &mut RunContext) -> Option<&'g str> {
        loop {
            if let Some(cursor) = self.cursor {
                let skip_rest = handle.take_continue() || handle.break_pending();
                if cursor < self.body.len() && !skip_rest {
                    self.cursor = Some(cursor + 1);
                    return Some(self.body[cursor]);
                }
                self.cursor = None;
            }

            if handle.take_break() {
                debug!(run_id = %ctx.run_id, node_id = self.node_id, index = self.next_item, "Loop broken");
                return None;
            }
            if handle.stop_requested() || self.next_item >= self.items.len() {
                return None;
            }

            handle.take_continue();
            let index = self.next_item;
            self.next_item += 1;
            ctx.set_variable(&self.item_var, std::mem::take(&mut self.items[index]));
            ctx.set_variable(&self.index_var, json!(index));
            self.cursor = Some(0);
        }
    }
}

/// Keeps a run registered in the live table while its `execute` future lives.
///
/// Dropped without [`RunGuard::release`] (the caller dropped the future), it
/// still unregisters the run and clears its waits and driver session.
struct RunGuard {
    run_id: RunId,
    runs: LiveRuns,
    services: RunServices,
    driver: Option<Arc<dyn ActionDriver>>,
    released: bool,
}

impl RunGuard {
    async fn close_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                warn!(run_id = %self.run_id, error = %e, "Failed to close driver session");
            }
        }
    }

    async fn release(mut self) {
        self.close_driver().await;
        self.services.webhooks.clear_run(self.run_id.as_str()).await;
        self.services.human.clear_run(self.run_id.as_str()).await;
        self.released = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
        if self.released {
            return;
        }

        warn!(run_id = %self.run_id, "Run abandoned before finishing, cleaning up");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let run_id = self.run_id.clone();
        let services = self.services.clone();
        let driver = self.driver.take();
        runtime.spawn(async move {
            if let Some(driver) = driver {
                if let Err(e) = driver.close().await {
                    warn!(run_id = %run_id, error = %e, "Failed to close driver session");
                }
            }
            services.webhooks.clear_run(run_id.as_str()).await;
            services.human.clear_run(run_id.as_str()).await;
        });
    }
}

/// Drives workflow runs.
///
/// One executor is shared by every run; each `execute` call owns its own
/// `RunContext` and registers a `RunHandle` in the live-run table for the
/// duration of the call.
pub struct Executor {
    registry: Arc<NodeRegistry>,
    authority: Arc<dyn CapabilityAuthority>,
    audit: Arc<dyn AuditSink>,
    driver_factory: Option<Arc<dyn DriverFactory>>,
    services: RunServices,
    runs: LiveRuns,
    globals: RwLock<Map<String, Value>>,
    config: EngineConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        authority: Arc<dyn CapabilityAuthority>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let config = EngineConfig::default();
        let services = RunServices::new(Arc::new(EventBus::default()), config.webhook_base_url.clone())
            .with_poll_interval(Duration::from_millis(config.poll_interval_ms));
        Self {
            registry,
            authority,
            audit,
            driver_factory: None,
            services,
            runs: Arc::new(Mutex::new(HashMap::new())),
            globals: RwLock::new(Map::new()),
            config,
        }
    }

    /// Built-in registry, the configured policy as authority and the configured audit sink.
    pub fn from_config(config: &AppConfig) -> Self {
        let services = RunServices::new(Arc::new(EventBus::default()), config.engine.webhook_base_url.clone());
        Self::new(
            Arc::new(NodeRegistry::with_builtins()),
            Arc::new(config.policy.clone()),
            audit_sink_from_config(config),
        )
        .with_services(services)
        .with_config(config.engine.clone())
    }

    pub fn with_driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.driver_factory = Some(factory);
        self
    }

    pub fn with_services(mut self, services: RunServices) -> Self {
        self.services = services;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.services.poll_interval = Duration::from_millis(config.poll_interval_ms);
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn webhooks(&self) -> &Arc<WebhookCorrelator> {
        &self.services.webhooks
    }

    pub fn human_gate(&self) -> &Arc<HumanGate> {
        &self.services.human
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    /// Set an executor-wide variable visible to runs started afterwards.
    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        self.globals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value);
    }

    fn globals_snapshot(&self) -> Map<String, Value> {
        self.globals.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Arc<RunHandle>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Status of a live run; `None` once it has finished.
    pub async fn run_status(&self, run_id: &RunId) -> Option<RunSnapshot> {
        self.live().get(run_id).map(|h| h.snapshot())
    }

    /// Ask a live run to stop before its next node. Returns whether it was live.
    pub async fn cancel_run(&self, run_id: &RunId) -> bool {
        match self.live().get(run_id) {
            Some(handle) => {
                info!(run_id = %run_id, "Cancelling run");
                handle.request_stop("cancelled by request", RunStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    pub async fn live_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.live().keys().cloned().collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    }

    /// Run a workflow to completion.
    ///
    /// Graph parse errors, a missing start node and a run id that is already
    /// live are returned as `Err`; every failure after the run is registered
    /// is reported in the summary.
    pub async fn execute(&self, workflow: &Workflow, options: ExecuteOptions) -> Result<RunSummary> {
        let graph = ParsedGraph::parse(&workflow.graph)?;
        let start = graph.start_node()?.id.as_str();

        let run_id = options.run_id.unwrap_or_default();
        let handle = Arc::new(RunHandle::new(run_id.clone()));
        let mut guard = self.register(handle.clone())?;

        let mut ctx = RunContext::new(workflow.id.clone(), options.caller, handle)
            .with_profile(options.profile)
            .with_variables(options.variables)
            .with_globals(self.globals_snapshot());

        info!(
            run_id = %run_id,
            workflow_id = %workflow.id,
            caller = %ctx.caller.id,
            nodes = graph.nodes().len(),
            "Run started"
        );
        self.services.events.publish(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            workflow_id: workflow.id.clone(),
        });

        let result = match self.open_driver(&ctx).await {
            Ok(driver) => {
                guard.driver = driver.clone();
                let walk = Walk {
                    graph: &graph,
                    driver,
                };
                self.walk(&walk, &mut ctx, start).await
            }
            Err(e) => Err(e),
        };
        guard.close_driver().await;

        let summary = self.finish(&mut ctx, result);
        guard.release().await;
        self.services.events.publish(EngineEvent::RunFinished {
            run_id: run_id.clone(),
            status: summary.status,
        });

        Ok(summary)
    }

    fn register(&self, handle: Arc<RunHandle>) -> Result<RunGuard> {
        let run_id = handle.run_id().clone();
        let mut runs = self.live();
        if runs.contains_key(&run_id) {
            warn!(run_id = %run_id, "Refusing to start a run whose id is already live");
            return Err(FlowError::DuplicateRun(run_id.to_string()));
        }
        runs.insert(run_id.clone(), handle);
        Ok(RunGuard {
            run_id,
            runs: self.runs.clone(),
            services: self.services.clone(),
            driver: None,
            released: false,
        })
    }

    async fn open_driver(&self, ctx: &RunContext) -> Result<Option<Arc<dyn ActionDriver>>> {
        match (&ctx.profile, &self.driver_factory) {
            (Some(profile), Some(factory)) => {
                debug!(run_id = %ctx.run_id, profile = %profile.id, "Opening driver session");
                factory.open_session(profile, &ctx.caller).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    fn finish(&self, ctx: &mut RunContext, result: Result<()>) -> RunSummary {
        let mut error_message = None;
        let status = match result {
            Ok(()) => match ctx.handle().stop_request() {
                Some(stop) => {
                    info!(run_id = %ctx.run_id, reason = %stop.reason, status = %stop.status, "Run stopped");
                    if stop.status == RunStatus::Error {
                        ctx.push_error(stop.reason.clone());
                        error_message = Some(stop.reason);
                    }
                    stop.status
                }
                None => RunStatus::Completed,
            },
            Err(e) => {
                error!(run_id = %ctx.run_id, node_id = ?ctx.current_node, error = %e, "Run failed");
                let message = e.to_string();
                ctx.push_error(message.clone());
                error_message = Some(message);
                RunStatus::Error
            }
        };

        ctx.set_status(status);
        ctx.ended_at = Some(Utc::now());
        let duration_ms = ctx.elapsed_ms();
        info!(
            run_id = %ctx.run_id,
            %status,
            executed = ctx.executed.len(),
            duration_ms,
            "Run finished"
        );

        RunSummary {
            run_id: ctx.run_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            status,
            duration_ms,
            variables: ctx.variables.clone(),
            executed_nodes: std::mem::take(&mut ctx.executed),
            errors: ctx.errors.clone(),
            error: error_message,
        }
    }

    /// Walk the graph from `start` with an explicit frame stack.
    async fn walk<'g>(&self, walk: &Walk<'g>, ctx: &mut RunContext, start: &'g str) -> Result<()> {
        let handle = ctx.handle().clone();
        let mut stack = vec![Frame::Visit {
            node_id: start,
            depth: 0,
        }];

        while let Some(frame) = stack.pop() {
            if handle.stop_requested() {
                break;
            }
            match frame {
                Frame::Visit { node_id, depth } => {
                    if handle.break_pending() {
                        continue;
                    }
                    match self.visit(walk, ctx, node_id, depth).await? {
                        Next::Targets(targets) => stack.extend(
                            targets
                                .into_iter()
                                .rev()
                                .map(|node_id| Frame::Visit { node_id, depth: depth + 1 }),
                        ),
                        Next::Loop(frame) => {
                            debug!(run_id = %ctx.run_id, node_id, items = frame.items.len(), "Loop started");
                            stack.push(Frame::Loop(frame));
                        }
                    }
                }
                Frame::Loop(mut frame) => {
                    if let Some(target) = frame.advance(&handle, ctx) {
                        let depth = frame.depth + 1;
                        stack.push(Frame::Loop(frame));
                        stack.push(Frame::Visit { node_id: target, depth });
                    }
                }
            }
        }
        Ok(())
    }

    /// Check, audit and execute one node, returning what runs after it.
    async fn visit<'g>(
        &self,
        walk: &Walk<'g>,
        ctx: &mut RunContext,
        node_id: &'g str,
        depth: usize,
    ) -> Result<Next<'g>> {
        if depth > self.config.max_depth {
            return Err(FlowError::DepthExceeded(depth));
        }

        let graph = walk.graph;
        let node = graph
            .node(node_id)
            .ok_or_else(|| FlowError::NodeNotFound(node_id.to_string()))?;
        let def = self
            .registry
            .get(&node.node_type)
            .ok_or_else(|| FlowError::UnknownNodeType(node.node_type.clone()))?;

        self.authority.check(
            &ctx.caller,
            &NodeRequirements {
                node_type: &def.id,
                capabilities: &def.capabilities,
                risk: def.risk,
            },
        )?;

        if def.risk.requires_audit() {
            let event = AuditEvent::node_execution(&ctx.run_id, node_id, &def.id, def.risk, &ctx.caller);
            self.audit.record(event).await.map_err(|e| match e {
                FlowError::Audit(_) => e,
                other => FlowError::Audit(other.to_string()),
            })?;
        }

        ctx.enter_node(node_id);
        debug!(run_id = %ctx.run_id, node_id, node_type = %def.id, depth, "Visiting node");
        self.services.events.publish(EngineEvent::NodeStarted {
            run_id: ctx.run_id.clone(),
            node_id: node_id.to_string(),
            node_type: def.id.clone(),
        });

        let inputs = template::resolve_inputs(&def, node, ctx, self.config.strict_templates)?;
        let started = Instant::now();
        let output = self.invoke(walk, ctx, &def, node_id, &inputs).await?;

        ctx.record_execution(ExecutedNode {
            id: node_id.to_string(),
            node_type: def.id.clone(),
            inputs: template::masked(&def, &inputs),
            outputs: output.clone(),
            timestamp: Utc::now(),
        });
        self.services.events.publish(EngineEvent::NodeCompleted {
            run_id: ctx.run_id.clone(),
            node_id: node_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        if def.is_loop_start {
            if let Some(payload) = output.get("loop") {
                return Ok(Next::Loop(LoopFrame::new(graph, node_id, payload, depth)));
            }
        }

        let targets = if def.output_ports >= 2 {
            let port = select_port(&output);
            debug!(run_id = %ctx.run_id, node_id, port, "Branch selected");
            graph.outgoing_on(node_id, port).map(|e| e.target.as_str()).collect()
        } else {
            graph.outgoing(node_id).map(|e| e.target.as_str()).collect()
        };
        Ok(Next::Targets(targets))
    }

    /// Invoke a node's behaviour, retrying retryable failures with linear backoff.
    async fn invoke(
        &self,
        walk: &Walk<'_>,
        ctx: &mut RunContext,
        def: &NodeDefinition,
        node_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<Value> {
        let attempts = def.retry.attempts();
        let mut attempt = 1;
        loop {
            let result = {
                let mut node_ctx = NodeContext {
                    run: &mut *ctx,
                    node_id,
                    driver: walk.driver.clone(),
                    services: &self.services,
                };
                def.execute(inputs, &mut node_ctx).await
            };
            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = Duration::from_millis(def.retry.retry_delay_ms * attempt as u64);
                    warn!(
                        run_id = %ctx.run_id,
                        node_id,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Node failed, retrying"
                    );
                    self.services.events.publish(EngineEvent::NodeRetry {
                        run_id: ctx.run_id.clone(),
                        node_id: node_id.to_string(),
                        attempt,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Output port of a two-port node: explicit `outputPort`, else 1 when
/// `result` is truthy, else 2.
fn select_port(output: &Value) -> u32 {
    match output.get("outputPort") {
        Some(port) if !port.is_null() => normalize_port(Some(port)),
        _ => {
            if output.get("result").is_some_and(is_truthy) {
                1
            } else {
                2
            }
        }
    }
}
