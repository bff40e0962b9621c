use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::event::EventBus;
use crate::types::EngineEvent;

type Key = (String, String);

#[derive(Debug)]
struct PendingHook {
    registered_at: Instant,
    received: bool,
    payload: Option<Value>,
}

#[derive(Debug)]
struct ReceivedHook {
    received_at: Instant,
    payload: Value,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<Key, PendingHook>,
    received: HashMap<Key, ReceivedHook>,
}

/// Outcome of an inbound webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A node was already waiting on this hook.
    Delivered,
    /// Nobody registered yet; kept for a later `register` or `check`.
    Queued,
}

/// Correlates inbound webhook payloads with the run/node waiting on them.
pub struct WebhookCorrelator {
    base_url: String,
    tables: Mutex<Tables>,
    event_bus: Option<Arc<EventBus>>,
}

impl WebhookCorrelator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tables: Mutex::new(Tables::default()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn callback_url(&self, run_id: &str, webhook_id: &str) -> String {
        format!(
            "{}/api/workflow-webhook/{}/{}",
            self.base_url, run_id, webhook_id
        )
    }

    /// Start waiting on a hook and return its callback URL.
    pub async fn register(&self, run_id: &str, webhook_id: &str) -> String {
        let key = (run_id.to_string(), webhook_id.to_string());
        let url = self.callback_url(run_id, webhook_id);

        let mut tables = self.tables.lock().await;
        // Adopt a payload that beat us here
        let early = tables.received.get(&key).map(|r| r.payload.clone());
        tables.pending.insert(
            key,
            PendingHook {
                registered_at: Instant::now(),
                received: early.is_some(),
                payload: early,
            },
        );
        drop(tables);

        info!(run_id, webhook_id, url = %url, "Webhook registered");
        if let Some(bus) = &self.event_bus {
            bus.publish(EngineEvent::WebhookRegistered {
                run_id: run_id.to_string(),
                webhook_id: webhook_id.to_string(),
                callback_url: url.clone(),
            });
        }
        url
    }

    /// Accept an inbound payload.
    pub async fn receive(&self, run_id: &str, webhook_id: &str, payload: Value) -> Delivery {
        let key = (run_id.to_string(), webhook_id.to_string());
        let mut tables = self.tables.lock().await;

        let delivery = match tables.pending.get_mut(&key) {
            Some(pending) => {
                pending.received = true;
                pending.payload = Some(payload.clone());
                Delivery::Delivered
            }
            None => Delivery::Queued,
        };
        tables.received.insert(
            key,
            ReceivedHook {
                received_at: Instant::now(),
                payload,
            },
        );
        drop(tables);

        debug!(run_id, webhook_id, ?delivery, "Webhook payload received");
        if let Some(bus) = &self.event_bus {
            bus.publish(EngineEvent::WebhookReceived {
                run_id: run_id.to_string(),
                webhook_id: webhook_id.to_string(),
                queued: delivery == Delivery::Queued,
            });
        }
        delivery
    }

    /// Payload for a hook, if one has arrived.
    pub async fn check(&self, run_id: &str, webhook_id: &str) -> Option<Value> {
        let key = (run_id.to_string(), webhook_id.to_string());
        let tables = self.tables.lock().await;
        if let Some(pending) = tables.pending.get(&key) {
            if pending.received {
                return pending.payload.clone();
            }
        }
        tables.received.get(&key).map(|r| r.payload.clone())
    }

    pub async fn is_pending(&self, run_id: &str, webhook_id: &str) -> bool {
        let key = (run_id.to_string(), webhook_id.to_string());
        self.tables
            .lock()
            .await
            .pending
            .get(&key)
            .is_some_and(|p| !p.received)
    }

    pub async fn unregister(&self, run_id: &str, webhook_id: &str) {
        let key = (run_id.to_string(), webhook_id.to_string());
        let mut tables = self.tables.lock().await;
        tables.pending.remove(&key);
        tables.received.remove(&key);
    }

    /// Drop every entry belonging to a run.
    pub async fn clear_run(&self, run_id: &str) {
        let mut tables = self.tables.lock().await;
        tables.pending.retain(|(run, _), _| run != run_id);
        tables.received.retain(|(run, _), _| run != run_id);
    }

    /// Evict entries older than `max_age`. Returns how many were removed.
    pub async fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut tables = self.tables.lock().await;
        let before = tables.pending.len() + tables.received.len();
        tables
            .pending
            .retain(|_, p| p.registered_at.elapsed() < max_age);
        tables
            .received
            .retain(|_, r| r.received_at.elapsed() < max_age);
        before - (tables.pending.len() + tables.received.len())
    }
}
