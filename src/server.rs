//! Server façade wiring resources, the group router and connections together.

use crate::connection::Connection;
use crate::protocol::ServerMessage;
use crate::resources::ResourceRegistry;
use crate::source::ChangeEventSource;
use crate::subscriptions::{GroupRouter, RouterStats, VisibilityDiffEngine};
use crate::types::{ConnectionId, Principal};
use crossbeam_channel::Sender;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Server configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Max queued inbound messages per connection before it is dropped as a
    /// slow consumer.
    /// Default: 1000
    pub inbox_capacity: usize,

    /// camelCase the keys of rendered payloads.
    /// Default: true
    pub camelize: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1000,
            camelize: true,
        }
    }
}

/// Entry point for an application serving live subscriptions.
///
/// Create one at startup, hand [`change_source`](Self::change_source) to the
/// storage layer, and call [`connect`](Self::connect) for every accepted
/// client connection.
pub struct LiveServer {
    config: LiveConfig,
    resources: Arc<ResourceRegistry>,
    router: Arc<GroupRouter>,
    next_connection: AtomicU64,
}

impl LiveServer {
    pub fn new(config: LiveConfig, resources: ResourceRegistry) -> Self {
        tracing::info!(
            resources = ?resources.resource_types(),
            inbox_capacity = config.inbox_capacity,
            "live server ready"
        );
        Self {
            config,
            resources: Arc::new(resources),
            router: Arc::new(GroupRouter::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn router(&self) -> Arc<GroupRouter> {
        Arc::clone(&self.router)
    }

    /// Handle for reporting writes.
    pub fn change_source(&self) -> ChangeEventSource {
        ChangeEventSource::new(Arc::clone(&self.router))
    }

    /// Create the worker for a newly accepted connection. Frames for the
    /// client are sent to `outbox`.
    pub fn connect(&self, principal: Principal, outbox: Sender<ServerMessage>) -> Connection {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        tracing::info!(connection = %id, user = ?principal.user, "connection opened");
        Connection::new(
            id,
            principal,
            VisibilityDiffEngine::new(Arc::clone(&self.resources)),
            Arc::clone(&self.router),
            outbox,
            self.config.inbox_capacity,
            self.config.camelize,
        )
    }

    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::MemoryResource;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_config_defaults_and_partial_override() {
        let config = LiveConfig::default();
        assert_eq!(config.inbox_capacity, 1000);
        assert!(config.camelize);

        let config: LiveConfig = serde_json::from_str(r#"{"camelize": false}"#).unwrap();
        assert_eq!(config.inbox_capacity, 1000);
        assert!(!config.camelize);
    }

    #[test]
    fn test_connections_get_distinct_ids() {
        let resources = ResourceRegistry::new()
            .with(Arc::new(MemoryResource::new("test_app.Todo")))
            .unwrap();
        let server = LiveServer::new(LiveConfig::default(), resources);
        let (tx, _rx) = unbounded();

        let a = server.connect(Principal::anonymous(), tx.clone());
        let b = server.connect(Principal::user("alice"), tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(b.principal().user.as_deref(), Some("alice"));
        assert_eq!(server.stats(), RouterStats::default());
    }
}
