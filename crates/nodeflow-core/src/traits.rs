use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::*;

/// Performs a node's real-world effect for one run.
pub trait ActionDriver: Send + Sync + 'static {
    /// Perform an action with already-resolved inputs.
    fn perform(&self, request: ActionRequest) -> BoxFuture<'_, Result<Value>>;

    /// Release the session. Called once when the run ends.
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Opens driver sessions bound to a profile.
pub trait DriverFactory: Send + Sync + 'static {
    fn open_session<'a>(
        &'a self,
        profile: &'a Profile,
        caller: &'a Caller,
    ) -> BoxFuture<'a, Result<Arc<dyn ActionDriver>>>;
}

/// Decides whether a caller may run a node.
pub trait CapabilityAuthority: Send + Sync + 'static {
    /// `Ok(())` when permitted, `FlowError::PermissionDenied` otherwise.
    fn check(&self, caller: &Caller, requirements: &NodeRequirements<'_>) -> Result<()>;
}

/// Receives structured audit events.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>>;
}

/// Persistence backend for definitions and run history.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Load a workflow definition by id.
    fn load_workflow<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Workflow>>>;

    /// Insert or replace a workflow definition.
    fn save_workflow<'a>(&'a self, workflow: &'a Workflow) -> BoxFuture<'a, Result<()>>;

    /// Append a finished run to the history.
    fn record_run<'a>(&'a self, summary: &'a RunSummary) -> BoxFuture<'a, Result<()>>;

    /// Most recent runs of a workflow, newest first.
    fn list_runs<'a>(
        &'a self,
        workflow_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<RunSummary>>>;
}
