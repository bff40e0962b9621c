use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use nodeflow_core::policy::{CapabilityPolicy, RiskTier};

use crate::definition::{InputSpec, NodeCategory, NodeDefinition};

/// UI-facing projection of a node definition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub category: NodeCategory,
    pub risk: RiskTier,
    pub requires_confirmation: bool,
    pub capabilities: Vec<String>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<String>,
    pub output_ports: u8,
}

impl From<&NodeDefinition> for CatalogEntry {
    fn from(def: &NodeDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            category: def.category,
            risk: def.risk,
            requires_confirmation: def.risk.requirements().confirmation,
            capabilities: def.capabilities.clone(),
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
            output_ports: def.output_ports,
        }
    }
}

/// Registry of node definitions, keyed by type id.
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<NodeDefinition>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a definition, replacing any previous one with the same id.
    pub fn register(&mut self, def: NodeDefinition) {
        self.nodes.insert(def.id.clone(), Arc::new(def));
    }

    pub fn get(&self, id: &str) -> Option<Arc<NodeDefinition>> {
        self.nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All definitions, sorted by category then id.
    pub fn list(&self) -> Vec<Arc<NodeDefinition>> {
        let mut defs: Vec<_> = self.nodes.values().cloned().collect();
        defs.sort_by(|a, b| {
            a.category
                .to_string()
                .cmp(&b.category.to_string())
                .then_with(|| a.id.cmp(&b.id))
        });
        defs
    }

    pub fn by_category(&self, category: NodeCategory) -> Vec<Arc<NodeDefinition>> {
        self.list()
            .into_iter()
            .filter(|d| d.category == category)
            .collect()
    }

    /// Definitions whose every capability the role holds.
    pub fn permitted_for(&self, policy: &CapabilityPolicy, role: &str) -> Vec<Arc<NodeDefinition>> {
        self.list()
            .into_iter()
            .filter(|d| policy.can_execute(role, &d.capabilities))
            .filter(|d| !d.risk.requirements().admin_only || policy.is_admin(role))
            .collect()
    }

    /// Catalog for the editor palette, optionally filtered to what a role may run.
    pub fn catalog(&self, filter: Option<(&CapabilityPolicy, &str)>) -> Vec<CatalogEntry> {
        let defs = match filter {
            Some((policy, role)) => self.permitted_for(policy, role),
            None => self.list(),
        };
        defs.iter().map(|d| CatalogEntry::from(d.as_ref())).collect()
    }

    /// Create a registry with all built-in nodes registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for def in crate::builtin::definitions() {
            registry.register(def);
        }
        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
