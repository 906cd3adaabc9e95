//! Per-connection bookkeeping of active subscriptions.

use super::router::{GroupRouter, Mailbox};
use super::types::Subscription;
use crate::error::{LiveError, Result};
use crate::types::{ConnectionId, GroupName, RequestId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Active subscriptions of one connection, indexed by request id and group.
///
/// Owned by the connection worker, so nothing here is locked. Group
/// membership in the shared router is reference counted: the connection
/// joins on the first subscription in a group and leaves after the last one
/// is removed.
pub struct SubscriptionRegistry {
    router: Arc<GroupRouter>,
    mailbox: Mailbox,
    subscriptions: HashMap<RequestId, Subscription>,
    /// Request ids per group, ordered so dispatch is deterministic.
    groups: HashMap<GroupName, BTreeSet<RequestId>>,
}

impl SubscriptionRegistry {
    pub fn new(router: Arc<GroupRouter>, mailbox: Mailbox) -> Self {
        Self {
            router,
            mailbox,
            subscriptions: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.mailbox.connection()
    }

    /// Register a subscription, joining its group if it is the first one.
    pub fn add(&mut self, subscription: Subscription) -> Result<()> {
        let request_id = subscription.request_id;
        if self.subscriptions.contains_key(&request_id) {
            return Err(LiveError::BadRequest(format!(
                "request id {} is already subscribed",
                request_id
            )));
        }

        let group = subscription.group();
        let members = self.groups.entry(group.clone()).or_default();
        if members.is_empty() {
            self.router.join(&group, &self.mailbox);
        }
        members.insert(request_id);
        self.subscriptions.insert(request_id, subscription);
        Ok(())
    }

    /// Remove a subscription, leaving its group if no other subscription on
    /// this connection still needs it.
    pub fn remove(&mut self, request_id: RequestId) -> Result<Subscription> {
        let subscription = self.subscriptions.remove(&request_id).ok_or_else(|| {
            LiveError::NotFound(format!(
                "unsubscribe before subscribe: no subscription with id {}",
                request_id
            ))
        })?;

        let group = subscription.group();
        if let Some(members) = self.groups.get_mut(&group) {
            members.remove(&request_id);
            if members.is_empty() {
                self.groups.remove(&group);
                self.router.leave(&group, self.connection());
            }
        }
        Ok(subscription)
    }

    /// Remove every subscription and release every group. Returns how many
    /// subscriptions were dropped.
    pub fn clear(&mut self) -> usize {
        let connection = self.connection();
        for group in self.groups.keys() {
            self.router.leave(group, connection);
        }
        self.groups.clear();
        let dropped = self.subscriptions.len();
        self.subscriptions.clear();
        dropped
    }

    /// Request ids subscribed in `group`, in ascending order.
    pub fn ids_for(&self, group: &GroupName) -> Vec<RequestId> {
        self.groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Live view of the subscriptions in `group`.
    pub fn subscriptions_for<'a>(
        &'a self,
        group: &GroupName,
    ) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.groups
            .get(group)
            .into_iter()
            .flat_map(|members| members.iter())
            .filter_map(move |id| self.subscriptions.get(id))
    }

    pub fn get(&self, request_id: RequestId) -> Option<&Subscription> {
        self.subscriptions.get(&request_id)
    }

    pub fn get_mut(&mut self, request_id: RequestId) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(&request_id)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.subscriptions.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Groups this connection is a member of.
    pub fn groups(&self) -> Vec<GroupName> {
        let mut groups: Vec<GroupName> = self.groups.keys().cloned().collect();
        groups.sort();
        groups
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
