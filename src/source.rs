//! Entry point the storage layer uses to report writes.

use crate::subscriptions::GroupRouter;
use crate::types::{ChangeEvent, RecordId};
use std::sync::Arc;

/// Cloneable handle that turns storage writes into broadcast change events.
///
/// Call it after the write is visible to readers: subscribers re-read the
/// record as soon as they see the event.
#[derive(Clone)]
pub struct ChangeEventSource {
    router: Arc<GroupRouter>,
}

impl ChangeEventSource {
    pub fn new(router: Arc<GroupRouter>) -> Self {
        Self { router }
    }

    /// A record was created or updated.
    pub fn record_saved(&self, resource_type: &str, id: impl Into<RecordId>) {
        self.emit(ChangeEvent::new(resource_type, id));
    }

    /// A record was removed.
    pub fn record_deleted(&self, resource_type: &str, id: impl Into<RecordId>) {
        self.emit(ChangeEvent::new(resource_type, id));
    }

    /// Publish an event to every connection listening on its resource type.
    /// Returns the number of connections it was delivered to.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let group = event.group();
        let delivered = self.router.publish(&group, event);
        tracing::trace!(group = %group, delivered, "change event published");
        delivered
    }
}
