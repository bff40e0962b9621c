pub mod builtin;
pub mod definition;
pub mod registry;

pub use builtin::is_truthy;
pub use definition::{InputKind, InputSpec, NodeCategory, NodeDefinition, NodeKind, RetryPolicy};
pub use registry::{CatalogEntry, NodeRegistry};
