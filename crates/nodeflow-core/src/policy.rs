use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::traits::CapabilityAuthority;
use crate::types::{Caller, NodeRequirements};

/// Risk tier for node classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk tier: {}", other)),
        }
    }
}

/// What a risk tier demands before a node may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskRequirements {
    pub audit_log: bool,
    pub confirmation: bool,
    pub admin_only: bool,
}

impl RiskTier {
    pub fn requirements(self) -> RiskRequirements {
        match self {
            Self::Low => RiskRequirements {
                audit_log: false,
                confirmation: false,
                admin_only: false,
            },
            Self::Medium => RiskRequirements {
                audit_log: true,
                confirmation: false,
                admin_only: false,
            },
            Self::High => RiskRequirements {
                audit_log: true,
                confirmation: true,
                admin_only: false,
            },
            Self::Critical => RiskRequirements {
                audit_log: true,
                confirmation: true,
                admin_only: true,
            },
        }
    }

    pub fn requires_audit(self) -> bool {
        self.requirements().audit_log
    }
}

/// Capability grants: capability string (or `category:*`) to permitted roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    #[serde(default = "CapabilityPolicy::default_grants")]
    pub capabilities: HashMap<String, Vec<String>>,

    /// Roles allowed through the admin-only gate of critical nodes.
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
}

fn default_admin_roles() -> Vec<String> {
    vec!["super_admin".to_string()]
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            capabilities: Self::default_grants(),
            admin_roles: default_admin_roles(),
        }
    }
}

impl CapabilityPolicy {
    /// Built-in role grants.
    pub fn default_grants() -> HashMap<String, Vec<String>> {
        let roles = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let operators = ["super_admin", "admin", "staff"];

        let mut grants = HashMap::new();
        grants.insert("control:*".to_string(), roles(&operators));
        grants.insert("data:*".to_string(), roles(&operators));
        grants.insert("browser:*".to_string(), roles(&["super_admin"]));
        grants.insert("browser:basic".to_string(), roles(&operators));
        grants.insert("browser:form".to_string(), roles(&operators));
        grants.insert("browser:cookies".to_string(), roles(&["super_admin", "admin"]));
        grants.insert("browser:js_eval".to_string(), roles(&["super_admin"]));
        grants.insert("http:*".to_string(), roles(&["super_admin", "admin"]));
        grants.insert("http:request".to_string(), roles(&operators));
        grants.insert("external:*".to_string(), roles(&operators));
        grants
    }

    fn granted(&self, capability: &str, role: &str) -> bool {
        self.capabilities
            .get(capability)
            .is_some_and(|roles| roles.iter().any(|r| r == role))
    }

    /// Whether `role` holds `capability` directly or through `category:*`.
    pub fn has_capability(&self, role: &str, capability: &str) -> bool {
        if let Some((category, _action)) = capability.split_once(':') {
            if self.granted(&format!("{}:*", category), role) {
                return true;
            }
        }
        self.granted(capability, role)
    }

    /// First capability in `capabilities` the role lacks, if any.
    pub fn missing_capability<'a>(&self, role: &str, capabilities: &'a [String]) -> Option<&'a str> {
        capabilities
            .iter()
            .find(|c| !self.has_capability(role, c))
            .map(|c| c.as_str())
    }

    /// All declared capabilities must pass; an empty list passes.
    pub fn can_execute(&self, role: &str, capabilities: &[String]) -> bool {
        self.missing_capability(role, capabilities).is_none()
    }

    pub fn is_admin(&self, role: &str) -> bool {
        self.admin_roles.iter().any(|r| r == role)
    }
}

impl CapabilityAuthority for CapabilityPolicy {
    fn check(&self, caller: &Caller, requirements: &NodeRequirements<'_>) -> Result<()> {
        if let Some(missing) = self.missing_capability(&caller.role, requirements.capabilities) {
            return Err(FlowError::PermissionDenied {
                node_type: requirements.node_type.to_string(),
                role: caller.role.clone(),
                capability: missing.to_string(),
            });
        }

        if requirements.risk.requirements().admin_only && !self.is_admin(&caller.role) {
            return Err(FlowError::PermissionDenied {
                node_type: requirements.node_type.to_string(),
                role: caller.role.clone(),
                capability: format!("admin clearance ({} risk)", requirements.risk),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tier_ordering() {
        assert!(RiskTier::Low < RiskTier::Medium);
        assert!(RiskTier::Medium < RiskTier::High);
        assert!(RiskTier::High < RiskTier::Critical);
    }

    #[test]
    fn tier_parse_and_display() {
        assert_eq!("HIGH".parse::<RiskTier>().unwrap(), RiskTier::High);
        assert!("extreme".parse::<RiskTier>().is_err());
        assert_eq!(RiskTier::Critical.to_string(), "critical");
    }

    #[test]
    fn tier_requirements_table() {
        assert!(!RiskTier::Low.requires_audit());
        assert!(RiskTier::Medium.requires_audit());
        assert!(!RiskTier::Medium.requirements().confirmation);
        assert!(RiskTier::High.requirements().confirmation);
        assert!(!RiskTier::High.requirements().admin_only);
        assert!(RiskTier::Critical.requirements().admin_only);
    }

    #[test]
    fn staff_cannot_eval_js() {
        let policy = CapabilityPolicy::default();
        assert!(!policy.has_capability("staff", "browser:js_eval"));
        assert!(policy.has_capability("super_admin", "browser:js_eval"));
    }

    #[test]
    fn wildcard_covers_specific_action() {
        let policy = CapabilityPolicy::default();
        assert!(policy.has_capability("super_admin", "browser:basic"));
        assert!(policy.has_capability("super_admin", "browser:anything_new"));
        assert!(policy.has_capability("staff", "data:transform"));
        assert!(!policy.has_capability("staff", "browser:anything_new"));
    }

    #[test]
    fn unknown_role_has_nothing() {
        let policy = CapabilityPolicy::default();
        assert!(!policy.has_capability("guest", "control:flow"));
        assert!(!policy.has_capability("guest", "nocategory"));
    }

    #[test]
    fn can_execute_requires_all() {
        let policy = CapabilityPolicy::default();
        assert!(policy.can_execute("staff", &caps(&["browser:basic", "data:read"])));
        assert!(!policy.can_execute("staff", &caps(&["browser:basic", "browser:cookies"])));
        assert!(policy.can_execute("guest", &[]));
    }

    #[test]
    fn authority_denies_missing_capability() {
        let policy = CapabilityPolicy::default();
        let caller = Caller::new("u1", "staff");
        let capabilities = caps(&["browser:js_eval"]);
        let req = NodeRequirements {
            node_type: "browser_js_eval",
            capabilities: &capabilities,
            risk: RiskTier::Low,
        };
        match policy.check(&caller, &req) {
            Err(FlowError::PermissionDenied { capability, .. }) => {
                assert_eq!(capability, "browser:js_eval")
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn authority_enforces_admin_gate() {
        let mut policy = CapabilityPolicy::default();
        policy
            .capabilities
            .insert("system:wipe".into(), caps(&["admin", "super_admin"]));
        let capabilities = caps(&["system:wipe"]);
        let req = NodeRequirements {
            node_type: "wipe",
            capabilities: &capabilities,
            risk: RiskTier::Critical,
        };
        assert!(policy.check(&Caller::new("a", "admin"), &req).is_err());
        assert!(policy.check(&Caller::new("s", "super_admin"), &req).is_ok());
    }

    #[test]
    fn policy_from_toml_keeps_defaults() {
        let policy: CapabilityPolicy = toml::from_str(r#"admin_roles = ["root"]"#).unwrap();
        assert!(policy.is_admin("root"));
        assert!(policy.has_capability("staff", "browser:basic"));
    }

    #[test]
    fn tier_serde_roundtrip() {
        let json = serde_json::to_string(&RiskTier::High).unwrap();
        assert_eq!(json, "\"high\"");
        let parsed: RiskTier = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, RiskTier::High);
    }
}
