//! Broadcast groups shared by all connections.

use super::types::Inbound;
use crate::error::{LiveError, Result};
use crate::types::{ChangeEvent, ConnectionId, GroupName};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Address of a connection's inbox.
///
/// Cheap to clone. The router holds one per group membership; the transport
/// side uses one to push client frames.
#[derive(Clone, Debug)]
pub struct Mailbox {
    connection: ConnectionId,
    sender: Sender<Inbound>,
    evicted: Arc<AtomicBool>,
}

impl Mailbox {
    /// Create an inbox with room for `capacity` pending messages.
    pub fn new(connection: ConnectionId, capacity: usize) -> (Self, Receiver<Inbound>) {
        let (sender, receiver) = bounded(capacity);
        let mailbox = Self {
            connection,
            sender,
            evicted: Arc::new(AtomicBool::new(false)),
        };
        (mailbox, receiver)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queue a message, waiting for room if the inbox is full.
    pub fn send(&self, message: Inbound) -> Result<()> {
        self.sender.send(message).map_err(|_| LiveError::Disconnected)
    }

    /// True once the router dropped this connection for falling behind.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    fn try_deliver(&self, event: ChangeEvent) -> Delivery {
        match self.sender.try_send(Inbound::Change(event)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Disconnected(_)) => Delivery::Dead,
        }
    }
}

enum Delivery {
    Delivered,
    Full,
    Dead,
}

/// Snapshot of router occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Groups with at least one member.
    pub groups: usize,
    /// Total (group, connection) memberships.
    pub memberships: usize,
}

/// Tracks which connections listen on which group and fans events out.
#[derive(Default)]
pub struct GroupRouter {
    groups: RwLock<HashMap<GroupName, HashMap<ConnectionId, Mailbox>>>,
}

impl GroupRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to `group`. Joining twice is a no-op.
    pub fn join(&self, group: &GroupName, mailbox: &Mailbox) {
        let mut groups = self.groups.write();
        groups
            .entry(group.clone())
            .or_default()
            .entry(mailbox.connection)
            .or_insert_with(|| mailbox.clone());
    }

    /// Remove a connection from `group`. Unknown memberships are ignored.
    pub fn leave(&self, group: &GroupName, connection: ConnectionId) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(group) {
            members.remove(&connection);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Remove a connection from every group.
    pub fn leave_all(&self, connection: ConnectionId) {
        let mut groups = self.groups.write();
        groups.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    /// Deliver `event` to every member of `group`. Returns how many inboxes
    /// accepted it.
    ///
    /// Dead inboxes are pruned. A full inbox gets its connection evicted from
    /// every group; the worker notices on its next turn and shuts down.
    pub fn publish(&self, group: &GroupName, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        let mut overflowed = Vec::new();

        {
            let groups = self.groups.read();
            let Some(members) = groups.get(group) else {
                return 0;
            };
            for (connection, mailbox) in members.iter() {
                match mailbox.try_deliver(event.clone()) {
                    Delivery::Delivered => delivered += 1,
                    Delivery::Full => overflowed.push(mailbox.clone()),
                    Delivery::Dead => dead.push(*connection),
                }
            }
        }

        for connection in dead {
            tracing::debug!(%group, %connection, "pruning closed connection from group");
            self.leave(group, connection);
        }

        for mailbox in overflowed {
            tracing::warn!(
                %group,
                connection = %mailbox.connection,
                "connection inbox full, evicting slow subscriber"
            );
            mailbox.evicted.store(true, Ordering::SeqCst);
            self.leave_all(mailbox.connection);
        }

        delivered
    }

    pub fn is_member(&self, group: &GroupName, connection: ConnectionId) -> bool {
        self.groups
            .read()
            .get(group)
            .map(|members| members.contains_key(&connection))
            .unwrap_or(false)
    }

    /// Connections currently in `group`, sorted.
    pub fn members(&self, group: &GroupName) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .groups
            .read()
            .get(group)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn stats(&self) -> RouterStats {
        let groups = self.groups.read();
        RouterStats {
            groups: groups.len(),
            memberships: groups.values().map(HashMap::len).sum(),
        }
    }
}
