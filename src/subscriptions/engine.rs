//! Visibility diffing: turns a raw change event into a per-subscriber
//! CREATED / UPDATED / DELETED notification.
//!
//! Each subscription remembers which records it could see. When an event
//! arrives the record is re-read under the subscription's own filter and
//! principal, and the answer is compared with that memory:
//!
//! | was visible | visible now | outcome                         |
//! |-------------|-------------|---------------------------------|
//! | no          | yes         | `CREATED` with rendered record  |
//! | yes         | yes         | `UPDATED` with rendered record  |
//! | yes         | no          | `DELETED` with id + lookup key  |
//! | no          | no          | nothing                         |
//!
//! The last row covers missing records and denied records alike, so a
//! subscriber cannot tell them apart.

use super::registry::SubscriptionRegistry;
use super::types::{Notification, Subscription, VisibleSet};
use crate::error::{LiveError, Result};
use crate::resources::{AccessContext, Record, Resource, ResourceRegistry};
use crate::types::{ChangeEvent, ChangeKind, Principal, RecordId};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Runs the visibility diff for the subscriptions of one connection.
#[derive(Clone)]
pub struct VisibilityDiffEngine {
    resources: Arc<ResourceRegistry>,
}

impl VisibilityDiffEngine {
    pub fn new(resources: Arc<ResourceRegistry>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Visible set of a list subscription right now.
    ///
    /// Uses one provider query, then the per-row access check, so the result
    /// agrees with what [`classify`](Self::classify) would decide row by row.
    pub fn snapshot(
        &self,
        resource: &dyn Resource,
        principal: &Principal,
        subscription: &Subscription,
    ) -> Result<VisibleSet> {
        let mut visible = VisibleSet::new();
        for record in resource.query(principal, &subscription.filter)? {
            if !subscription.targets(&record) {
                continue;
            }
            let ctx = AccessContext::object(subscription.action, &subscription.filter, &record);
            if resource.check_access(principal, &ctx)? {
                visible.insert(record.id, record.lookup_key);
            }
        }
        Ok(visible)
    }

    /// The record with `id` if `subscription` may currently see it.
    ///
    /// Existence, filter match, retrieve targeting and row-level permission
    /// all collapse into a single `None`.
    pub fn fetch_visible(
        &self,
        resource: &dyn Resource,
        principal: &Principal,
        subscription: &Subscription,
        id: &RecordId,
    ) -> Result<Option<Record>> {
        let Some(record) = resource.fetch(principal, &subscription.filter, id)? else {
            return Ok(None);
        };
        if !subscription.targets(&record) {
            return Ok(None);
        }
        let ctx = AccessContext::object(subscription.action, &subscription.filter, &record);
        if resource.check_access(principal, &ctx)? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Classify a change to `id` for one subscription and update its visible
    /// set. The visible set is only touched once the payload is ready, so a
    /// failure leaves the subscription as it was.
    pub fn classify(
        &self,
        resource: &dyn Resource,
        principal: &Principal,
        subscription: &mut Subscription,
        id: &RecordId,
    ) -> Result<Option<Notification>> {
        if !subscription.accepts(id) {
            return Ok(None);
        }

        let was_visible = subscription.is_visible(id);
        let current = self.fetch_visible(resource, principal, subscription, id)?;

        let (kind, instance) = match current {
            Some(record) => {
                let instance = resource.render(principal, &subscription.filter, &record)?;
                let kind = if was_visible {
                    ChangeKind::Updated
                } else {
                    ChangeKind::Created
                };
                subscription.mark_visible(record.id, record.lookup_key);
                (kind, instance)
            }
            None if was_visible => {
                let lookup_key = subscription.forget(id).unwrap_or(Value::Null);
                let instance = deleted_instance(resource.lookup_field(), id, lookup_key);
                (ChangeKind::Deleted, instance)
            }
            None => return Ok(None),
        };

        subscription.count_delivery();
        Ok(Some(Notification {
            request_id: subscription.request_id,
            resource_type: subscription.resource_type.clone(),
            kind,
            instance,
        }))
    }

    /// Run `event` against every subscription of the connection in the
    /// event's group.
    ///
    /// A failing collaborator skips only the affected subscription.
    pub fn dispatch(
        &self,
        registry: &mut SubscriptionRegistry,
        principal: &Principal,
        event: &ChangeEvent,
    ) -> Vec<Notification> {
        let Some(resource) = self.resources.get(&event.resource_type) else {
            tracing::debug!(
                resource_type = %event.resource_type,
                "change event for unregistered resource ignored"
            );
            return Vec::new();
        };

        let connection = registry.connection();
        let mut notifications = Vec::new();
        for request_id in registry.ids_for(&event.group()) {
            let Some(subscription) = registry.get_mut(request_id) else {
                continue;
            };
            match self.classify(resource.as_ref(), principal, subscription, &event.id) {
                Ok(Some(notification)) => {
                    tracing::debug!(
                        %connection,
                        %request_id,
                        record = %event.id,
                        action = notification.kind.as_str(),
                        "classified change"
                    );
                    notifications.push(notification);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        %connection,
                        %request_id,
                        resource_type = %event.resource_type,
                        record = %event.id,
                        error = %e,
                        "skipping change for subscription"
                    );
                }
            }
        }
        notifications
    }

    /// Resource registered under `resource_type`, or a not-found error.
    pub fn resource(&self, resource_type: &str) -> Result<Arc<dyn Resource>> {
        self.resources
            .get(resource_type)
            .ok_or_else(|| LiveError::NotFound(format!("unknown model {}", resource_type)))
    }
}

/// Payload of a deletion: the identifier and the remembered lookup key, never
/// the record itself.
pub fn deleted_instance(lookup_field: &str, id: &RecordId, lookup_key: Value) -> Value {
    let mut instance = Map::new();
    instance.insert(lookup_field.to_string(), lookup_key);
    instance.insert("id".to_string(), id.to_value());
    Value::Object(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::MemoryResource;
    use crate::subscriptions::router::{GroupRouter, Mailbox};
    use crate::types::{ConnectionId, FilterParams, RequestId};
    use serde_json::json;

    fn setup(table: MemoryResource) -> (Arc<MemoryResource>, VisibilityDiffEngine) {
        let table = Arc::new(table);
        let mut resources = ResourceRegistry::new();
        resources.register(table.clone()).unwrap();
        (table, VisibilityDiffEngine::new(Arc::new(resources)))
    }

    fn list_seven(request_id: i64) -> Subscription {
        let mut kwargs = Map::new();
        kwargs.insert("list_id".into(), json!(7));
        Subscription::list(RequestId(request_id), "test_app.Todo", FilterParams::kwargs(kwargs))
    }

    fn todos() -> MemoryResource {
        MemoryResource::new("test_app.Todo").filter_on(&["list_id"])
    }

    #[test]
    fn test_created_then_updated_then_deleted() {
        let (table, engine) = setup(todos());
        let principal = Principal::anonymous();
        let mut sub = list_seven(1);

        let id = table.insert(json!({"text": "a", "list_id": 7})).unwrap();
        let n = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(n.kind, ChangeKind::Created);
        assert_eq!(n.instance["text"], "a");

        table.update(&id, json!({"text": "b"})).unwrap();
        let n = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(n.kind, ChangeKind::Updated);

        table.delete(&id);
        let n = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(n.kind, ChangeKind::Deleted);
        assert_eq!(n.instance, json!({"pk": id.to_value(), "id": id.to_value()}));
        assert_eq!(sub.visible_len(), 0);
        assert_eq!(sub.delivered(), 3);
    }

    #[test]
    fn test_filtered_out_is_deleted_and_back_is_created() {
        let (table, engine) = setup(todos());
        let principal = Principal::anonymous();
        let mut sub = list_seven(1);

        let id = table.insert(json!({"text": "a", "list_id": 7})).unwrap();
        engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap();

        table.update(&id, json!({"list_id": 8})).unwrap();
        let n = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(n.kind, ChangeKind::Deleted);
        assert!(n.instance.get("text").is_none());

        table.update(&id, json!({"list_id": 7})).unwrap();
        let n = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(n.kind, ChangeKind::Created);
    }

    #[test]
    fn test_never_visible_produces_nothing() {
        let (table, engine) = setup(todos().with_object_permission(|_, _| false));
        let principal = Principal::anonymous();
        let mut sub = list_seven(1);

        // Denied record.
        let id = table.insert(json!({"text": "a", "list_id": 7})).unwrap();
        assert!(engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().is_none());

        // Record that never existed.
        let missing = RecordId::Int(999);
        assert!(engine.classify(table.as_ref(), &principal, &mut sub, &missing).unwrap().is_none());
        assert_eq!(sub.visible_len(), 0);
    }

    #[test]
    fn test_replay_never_duplicates_created() {
        let (table, engine) = setup(todos());
        let principal = Principal::anonymous();
        let mut sub = list_seven(1);

        let id = table.insert(json!({"text": "a", "list_id": 7})).unwrap();
        let first = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        let second = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::Created);
        assert_eq!(second.kind, ChangeKind::Updated);

        table.delete(&id);
        engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap();
        assert!(engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().is_none());
    }

    #[test]
    fn test_collaborator_failure_leaves_state_untouched() {
        let (table, engine) = setup(todos());
        let principal = Principal::anonymous();
        let mut sub = list_seven(1);

        let id = table.insert(json!({"text": "a", "list_id": 7})).unwrap();
        table.set_failing(true);
        assert!(engine.classify(table.as_ref(), &principal, &mut sub, &id).is_err());
        assert!(!sub.is_visible(&id));

        table.set_failing(false);
        let n = engine.classify(table.as_ref(), &principal, &mut sub, &id).unwrap().unwrap();
        assert_eq!(n.kind, ChangeKind::Created);
    }

    #[test]
    fn test_snapshot_applies_row_permission() {
        let (table, engine) = setup(todos().with_object_permission(|principal, record| {
            record.fields.get("owner").and_then(Value::as_str) == principal.user.as_deref()
        }));
        table.insert(json!({"list_id": 7, "owner": "alice"})).unwrap();
        table.insert(json!({"list_id": 7, "owner": "bob"})).unwrap();
        table.insert(json!({"list_id": 8, "owner": "alice"})).unwrap();

        let visible = engine
            .snapshot(table.as_ref(), &Principal::user("alice"), &list_seven(1))
            .unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn test_dispatch_runs_every_subscription_independently() {
        let (table, engine) = setup(todos());
        let router = Arc::new(GroupRouter::new());
        let (mailbox, _inbox) = Mailbox::new(ConnectionId(1), 16);
        let mut registry = SubscriptionRegistry::new(router, mailbox);

        let id = table.insert(json!({"text": "a", "list_id": 7})).unwrap();
        let mut seen = VisibleSet::new();
        seen.insert(id.clone(), id.to_value());
        registry.add(list_seven(1).with_visible(seen)).unwrap();
        registry.add(list_seven(2)).unwrap();

        let event = ChangeEvent::new("test_app.Todo", id.clone());
        let notifications = engine.dispatch(&mut registry, &Principal::anonymous(), &event);

        let kinds: Vec<(RequestId, ChangeKind)> =
            notifications.iter().map(|n| (n.request_id, n.kind)).collect();
        assert_eq!(
            kinds,
            vec![(RequestId(1), ChangeKind::Updated), (RequestId(2), ChangeKind::Created)]
        );
    }

    #[test]
    fn test_deleted_instance_uses_lookup_field() {
        let instance = deleted_instance("text", &RecordId::Int(3), json!("groceries"));
        assert_eq!(instance, json!({"text": "groceries", "id": 3}));
    }
}
