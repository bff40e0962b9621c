pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod human;
pub mod policy;
pub mod traits;
pub mod types;
pub mod webhook;

pub use config::AppConfig;
pub use context::{NodeContext, RunContext, RunHandle, RunServices, StopRequest};
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use human::HumanGate;
pub use policy::{CapabilityPolicy, RiskTier};
pub use types::*;
pub use webhook::{Delivery, WebhookCorrelator};
