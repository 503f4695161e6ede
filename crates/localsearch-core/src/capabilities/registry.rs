use super::capability::{Capability, CapabilityDescriptor};
use super::search::SearchCapability;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only after startup; shared across request tasks without locking.
#[derive(Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// The registry this bridge ships with: a single `search` capability.
    pub fn builtin(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let mut registry = Self::new();
        registry.register(Arc::new(SearchCapability::new(
            config.search.clone(),
            config.limits(),
        )))?;
        Ok(registry)
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), BridgeError> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(BridgeError::DuplicateCapability(name));
        }
        self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        let mut defs: Vec<CapabilityDescriptor> =
            self.capabilities.values().map(|c| c.descriptor()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
