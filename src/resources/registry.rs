//! Registry of subscribable resource types.

use super::Resource;
use crate::error::{LiveError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps resource type labels to their collaborators.
///
/// Built once at startup and shared read-only by every connection.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Each resource type may be registered once.
    pub fn register(&mut self, resource: Arc<dyn Resource>) -> Result<()> {
        let label = resource.resource_type().to_string();
        if self.resources.contains_key(&label) {
            return Err(LiveError::DuplicateResource(label));
        }
        tracing::debug!(resource_type = %label, "registered live resource");
        self.resources.insert(label, resource);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(mut self, resource: Arc<dyn Resource>) -> Result<Self> {
        self.register(resource)?;
        Ok(self)
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn Resource>> {
        self.resources.get(resource_type).cloned()
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.resources.contains_key(resource_type)
    }

    /// Registered labels, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.resources.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
