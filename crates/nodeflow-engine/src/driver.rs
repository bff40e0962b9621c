use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use nodeflow_core::error::Result;
use nodeflow_core::traits::{ActionDriver, DriverFactory};
use nodeflow_core::types::{ActionRequest, Caller, Profile};

/// Driver that performs nothing and echoes each request back.
///
/// Lets a workflow be walked end to end without touching a browser.
pub struct DryRunDriver {
    profile_id: String,
}

impl ActionDriver for DryRunDriver {
    fn perform(&self, request: ActionRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            info!(
                run_id = %request.run_id,
                node_id = %request.node_id,
                action = %request.action,
                profile = %self.profile_id,
                "Dry-run action"
            );
            Ok(json!({
                "dryRun": true,
                "action": request.action,
                "inputs": request.inputs,
            }))
        })
    }
}

pub struct DryRunDriverFactory;

impl DriverFactory for DryRunDriverFactory {
    fn open_session<'a>(
        &'a self,
        profile: &'a Profile,
        _caller: &'a Caller,
    ) -> BoxFuture<'a, Result<Arc<dyn ActionDriver>>> {
        Box::pin(async move {
            Ok(Arc::new(DryRunDriver {
                profile_id: profile.id.clone(),
            }) as Arc<dyn ActionDriver>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::types::RunId;
    use serde_json::Map;

    #[tokio::test]
    async fn echoes_request() {
        let driver = DryRunDriverFactory
            .open_session(&Profile::new("p1"), &Caller::new("u", "staff"))
            .await
            .unwrap();
        let mut inputs = Map::new();
        inputs.insert("url".into(), json!("https://example.com"));
        let out = driver
            .perform(ActionRequest {
                run_id: RunId::new(),
                node_id: "n1".into(),
                action: "browser.open".into(),
                inputs,
            })
            .await
            .unwrap();
        assert_eq!(out["dryRun"], true);
        assert_eq!(out["action"], "browser.open");
        assert_eq!(out["inputs"]["url"], "https://example.com");
        assert!(driver.close().await.is_ok());
    }
}
