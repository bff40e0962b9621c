use nodeflow_core::config::{AppConfig, AuditSinkKind};
use nodeflow_core::error::FlowError;
use nodeflow_test_utils::fixtures::temp_config;

#[test]
fn test_load_full_config_from_file() {
    let (_dir, path) = temp_config(
        r#"
[engine]
workspace = "/tmp/nodeflow-it"
webhook_base_url = "https://flows.example.com/"
max_depth = 64
strict_templates = true
poll_interval_ms = 50

[policy]
admin_roles = ["super_admin", "owner"]

[policy.capabilities]
"control:*" = ["staff"]
"browser:basic" = ["staff", "owner"]

[audit]
sink = "jsonl"
path = "/var/log/nodeflow/audit.jsonl"

[store]
path = "/var/lib/nodeflow/flows.db"
"#,
    );

    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.engine.workspace, "/tmp/nodeflow-it");
    assert_eq!(config.engine.webhook_base_url, "https://flows.example.com/");
    assert_eq!(config.engine.max_depth, 64);
    assert!(config.engine.strict_templates);
    assert_eq!(config.engine.poll_interval_ms, 50);

    assert!(config.policy.is_admin("owner"));
    assert!(config.policy.has_capability("staff", "control:flow"));
    assert!(config.policy.has_capability("owner", "browser:basic"));
    assert!(!config.policy.has_capability("staff", "http:request"));

    assert_eq!(config.audit.sink, AuditSinkKind::Jsonl);
    assert_eq!(
        config.audit_path().to_str(),
        Some("/var/log/nodeflow/audit.jsonl")
    );
    assert_eq!(config.store_path().to_str(), Some("/var/lib/nodeflow/flows.db"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("NODEFLOW_IT_HOOK_BASE", "https://hooks.internal:8443");

    let (_dir, path) = temp_config(
        r#"
[engine]
webhook_base_url = "${NODEFLOW_IT_HOOK_BASE}"
"#,
    );

    let config = AppConfig::load(&path).expect("load config");
    assert_eq!(config.engine.webhook_base_url, "https://hooks.internal:8443");

    std::env::remove_var("NODEFLOW_IT_HOOK_BASE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let (_dir, path) = temp_config("[engine]\nmax_depth = 10\n");

    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.engine.max_depth, 10);
    assert_eq!(config.engine.workspace, "~/.nodeflow");
    assert_eq!(config.engine.webhook_base_url, "http://127.0.0.1:18790");
    assert_eq!(config.audit.sink, AuditSinkKind::Tracing);
    assert!(config.store.path.is_none());
    assert!(config.policy.has_capability("staff", "browser:basic"));
    assert!(!config.policy.has_capability("staff", "browser:js_eval"));
}

#[test]
fn test_missing_and_malformed_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        AppConfig::load(&missing),
        Err(FlowError::ConfigNotFound(_))
    ));

    let (_dir, path) = temp_config("[engine\nmax_depth = ");
    assert!(matches!(AppConfig::load(&path), Err(FlowError::Config(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::default();
    let text = toml::to_string_pretty(&config).expect("serialize");
    let back: AppConfig = toml::from_str(&text).expect("parse");
    assert_eq!(back.engine.max_depth, config.engine.max_depth);
    assert_eq!(back.policy.admin_roles, config.policy.admin_roles);
}
