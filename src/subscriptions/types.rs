//! Subscription state and the messages a connection's inbox carries.

use crate::resources::Record;
use crate::types::{
    values_match, Action, ChangeEvent, ChangeKind, FilterParams, GroupName, RecordId, RequestId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Record id → lookup key of every record a subscription currently sees.
pub type VisibleSet = HashMap<RecordId, Value>;

/// One active subscription on a connection.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub request_id: RequestId,
    pub resource_type: String,
    pub action: Action,
    /// Lookup value of the retrieve target; `None` for lists.
    pub lookup_value: Option<Value>,
    pub filter: FilterParams,
    visible: VisibleSet,
    /// Number of notifications produced for this subscription.
    delivered: u64,
}

impl Subscription {
    /// A subscription to a filtered collection.
    pub fn list(request_id: RequestId, resource_type: impl Into<String>, filter: FilterParams) -> Self {
        Self {
            request_id,
            resource_type: resource_type.into(),
            action: Action::List,
            lookup_value: None,
            filter,
            visible: VisibleSet::new(),
            delivered: 0,
        }
    }

    /// A subscription to the single record whose lookup field is `lookup_value`.
    pub fn retrieve(
        request_id: RequestId,
        resource_type: impl Into<String>,
        lookup_value: Value,
        filter: FilterParams,
    ) -> Self {
        Self {
            request_id,
            resource_type: resource_type.into(),
            action: Action::Retrieve,
            lookup_value: Some(lookup_value),
            filter,
            visible: VisibleSet::new(),
            delivered: 0,
        }
    }

    /// Seed the visible set from an initial snapshot.
    pub fn with_visible(mut self, visible: VisibleSet) -> Self {
        self.visible = visible;
        self
    }

    /// Replace the visible set, e.g. with the initial snapshot once the
    /// subscription is already registered.
    pub fn set_visible(&mut self, visible: VisibleSet) {
        self.visible = visible;
    }

    pub fn group(&self) -> GroupName {
        GroupName::for_resource(&self.resource_type)
    }

    /// Whether `record` is the record this subscription is about.
    ///
    /// Lists accept any record; a retrieve only accepts its lookup target.
    pub fn targets(&self, record: &Record) -> bool {
        match (self.action, &self.lookup_value) {
            (Action::Retrieve, Some(lookup)) => values_match(&record.lookup_key, lookup),
            _ => true,
        }
    }

    /// Whether an event for `id` can concern this subscription at all.
    ///
    /// A retrieve already tracking a record ignores every other id.
    pub fn accepts(&self, id: &RecordId) -> bool {
        match self.action {
            Action::List => true,
            Action::Retrieve => self.visible.is_empty() || self.visible.contains_key(id),
        }
    }

    pub fn is_visible(&self, id: &RecordId) -> bool {
        self.visible.contains_key(id)
    }

    pub fn visible_ids(&self) -> &VisibleSet {
        &self.visible
    }

    pub fn visible_len(&self) -> usize {
        self.visible.len()
    }

    /// Record `id` as visible. Returns true if it was not visible before.
    pub fn mark_visible(&mut self, id: RecordId, lookup_key: Value) -> bool {
        self.visible.insert(id, lookup_key).is_none()
    }

    /// Drop `id` from the visible set, returning its lookup key.
    pub fn forget(&mut self, id: &RecordId) -> Option<Value> {
        self.visible.remove(id)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub(crate) fn count_delivery(&mut self) {
        self.delivered += 1;
    }
}

/// A classified change ready to be framed for one subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub request_id: RequestId,
    pub resource_type: String,
    pub kind: ChangeKind,
    pub instance: Value,
}

/// Messages drained by a connection worker, in arrival order.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// A raw JSON frame from the client.
    Request(Value),
    /// A change event delivered through a group.
    Change(ChangeEvent),
    /// The transport closed.
    Disconnect,
}

/// Why a connection worker stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Inbox overflowed (slow consumer).
    BufferOverflow,
    /// Client went away or the outbox closed.
    Disconnected,
}
