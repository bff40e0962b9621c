pub mod audit;
pub mod driver;
pub mod executor;
pub mod graph;
pub mod template;

pub use audit::{audit_sink_from_config, JsonlAuditSink, NullAuditSink, TracingAuditSink};
pub use driver::{DryRunDriver, DryRunDriverFactory};
pub use executor::{ExecuteOptions, Executor};
pub use graph::ParsedGraph;
