use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use nodeflow_core::config::{AppConfig, AuditSinkKind};
use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::traits::AuditSink;
use nodeflow_core::types::AuditEvent;

/// Emits audit events as structured `tracing` records under `nodeflow::audit`.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(
                target: "nodeflow::audit",
                event = %event.event,
                run_id = %event.run_id,
                node_id = %event.node_id,
                node_type = %event.node_type,
                risk = %event.risk_level,
                caller = %event.caller,
                "Audit"
            );
            Ok(())
        })
    }
}

/// Appends audit events to a JSONL file, one object per line.
///
/// Append-only and flushed per event, so earlier lines survive a crash.
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let line = format!("{}\n", serde_json::to_string(&event)?);
            let _guard = self.write_lock.lock().await;

            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| FlowError::Audit(format!("{}: {}", parent.display(), e)))?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| FlowError::Audit(format!("{}: {}", self.path.display(), e)))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| FlowError::Audit(e.to_string()))?;
            file.flush().await.map_err(|e| FlowError::Audit(e.to_string()))?;

            debug!(path = %self.path.display(), run_id = %event.run_id, "Audit event appended");
            Ok(())
        })
    }
}

/// Discards audit events.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Build the sink selected by `[audit]`.
pub fn audit_sink_from_config(config: &AppConfig) -> Arc<dyn AuditSink> {
    match config.audit.sink {
        AuditSinkKind::Tracing => Arc::new(TracingAuditSink),
        AuditSinkKind::Jsonl => Arc::new(JsonlAuditSink::new(config.audit_path())),
        AuditSinkKind::None => Arc::new(NullAuditSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::policy::RiskTier;
    use nodeflow_core::types::{Caller, RunId};

    fn event(node: &str) -> AuditEvent {
        AuditEvent::node_execution(
            &RunId::from_str("run-9"),
            node,
            "browser_open",
            RiskTier::Medium,
            &Caller::new("u-1", "staff"),
        )
    }

    #[tokio::test]
    async fn jsonl_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path);

        sink.record(event("n1")).await.unwrap();
        sink.record(event("n2")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["nodeId"], "n1");
        assert_eq!(lines[1]["nodeId"], "n2");
        assert_eq!(lines[1]["riskLevel"], "medium");
        assert_eq!(lines[1]["runId"], "run-9");
    }

    #[tokio::test]
    async fn jsonl_unwritable_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending
        let sink = JsonlAuditSink::new(dir.path());
        let err = sink.record(event("n1")).await.unwrap_err();
        assert!(matches!(err, FlowError::Audit(_)));
    }

    #[tokio::test]
    async fn tracing_and_null_sinks_accept() {
        assert!(TracingAuditSink.record(event("n1")).await.is_ok());
        assert!(NullAuditSink.record(event("n1")).await.is_ok());
    }

    #[test]
    fn sink_selection() {
        let mut config = AppConfig::default();
        config.audit.sink = AuditSinkKind::Jsonl;
        config.audit.path = Some("/tmp/nodeflow-audit-test.jsonl".into());
        // Only checks construction; nothing is written
        let _sink = audit_sink_from_config(&config);
    }
}
