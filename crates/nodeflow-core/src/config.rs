use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::policy::CapabilityPolicy;

/// Top-level nodeflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub policy: CapabilityPolicy,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Base URL external systems use to reach the webhook route.
    #[serde(default = "default_webhook_base_url")]
    pub webhook_base_url: String,
    /// Deepest chain of ordinary edges a run may follow.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Fail on unresolved `{{name}}` placeholders instead of substituting "".
    #[serde(default)]
    pub strict_templates: bool,
    /// Poll interval for nodes waiting on webhooks or humans.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            webhook_base_url: default_webhook_base_url(),
            max_depth: default_max_depth(),
            strict_templates: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_workspace() -> String { "~/.nodeflow".to_string() }
fn default_webhook_base_url() -> String { "http://127.0.0.1:18790".to_string() }
fn default_max_depth() -> usize { 256 }
fn default_poll_interval_ms() -> u64 { 500 }

/// Where audit events go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    #[default]
    Tracing,
    Jsonl,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub sink: AuditSinkKind,
    /// JSONL file path. Default: <workspace>/audit.jsonl
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Default: <workspace>/nodeflow.db
    #[serde(default)]
    pub path: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn store_path(&self) -> PathBuf {
        match self.store.path {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("nodeflow.db"),
        }
    }

    pub fn audit_path(&self) -> PathBuf {
        match self.audit.path {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("audit.jsonl"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
