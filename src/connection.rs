//! Per-connection worker.
//!
//! A connection drains one ordered inbox holding both client frames and
//! change events, so its subscriptions are only ever touched by one thread and
//! every event sees the effect of every request that arrived before it.

use crate::error::{LiveError, Result};
use crate::protocol::{self, ClientRequest, ServerMessage, SubscribeRequest};
use crate::resources::{AccessContext, Resource};
use crate::subscriptions::{
    DropReason, GroupRouter, Inbound, Mailbox, Subscription, SubscriptionRegistry,
    VisibilityDiffEngine, VisibleSet,
};
use crate::types::{Action, ChangeEvent, ConnectionId, Principal, RequestId};
use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Whether the worker keeps going after a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(DropReason),
}

/// Handle the transport side uses to feed a connection.
///
/// Dropping handles does not close the connection; call
/// [`disconnect`](Self::disconnect) when the transport goes away.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    mailbox: Mailbox,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.mailbox.connection()
    }

    /// Queue a raw client frame.
    pub fn send_json(&self, frame: Value) -> Result<()> {
        self.mailbox.send(Inbound::Request(frame))
    }

    /// Queue a client frame given as text.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let frame: Value = serde_json::from_str(text)?;
        self.send_json(frame)
    }

    /// Tell the worker the transport closed.
    pub fn disconnect(&self) -> Result<()> {
        self.mailbox.send(Inbound::Disconnect)
    }
}

/// State of one client connection.
pub struct Connection {
    principal: Principal,
    engine: VisibilityDiffEngine,
    registry: SubscriptionRegistry,
    mailbox: Mailbox,
    inbox: Receiver<Inbound>,
    outbox: Sender<ServerMessage>,
    camelize: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        principal: Principal,
        engine: VisibilityDiffEngine,
        router: Arc<GroupRouter>,
        outbox: Sender<ServerMessage>,
        inbox_capacity: usize,
        camelize: bool,
    ) -> Self {
        let (mailbox, inbox) = Mailbox::new(id, inbox_capacity);
        let registry = SubscriptionRegistry::new(router, mailbox.clone());
        Self {
            principal,
            engine,
            registry,
            mailbox,
            inbox,
            outbox,
            camelize,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.mailbox.connection()
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            mailbox: self.mailbox.clone(),
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Run the worker on its own thread until the connection closes.
    pub fn spawn(self) -> std::io::Result<JoinHandle<DropReason>> {
        thread::Builder::new()
            .name(format!("live-conn-{}", self.id()))
            .spawn(move || self.run())
    }

    /// Drain the inbox until the connection closes. Blocks.
    pub fn run(mut self) -> DropReason {
        loop {
            let message = match self.inbox.recv() {
                Ok(message) => message,
                Err(_) => Inbound::Disconnect,
            };
            if let Flow::Close(reason) = self.handle_inbound(message) {
                return reason;
            }
        }
    }

    /// Handle everything already queued without blocking.
    ///
    /// Returns the drop reason if the connection closed while draining.
    pub fn process_pending(&mut self) -> Option<DropReason> {
        while let Ok(message) = self.inbox.try_recv() {
            if let Flow::Close(reason) = self.handle_inbound(message) {
                return Some(reason);
            }
        }
        if self.mailbox.is_evicted() {
            return Some(self.close(DropReason::BufferOverflow));
        }
        None
    }

    /// Process exactly one inbound message.
    pub fn handle_inbound(&mut self, message: Inbound) -> Flow {
        if self.mailbox.is_evicted() {
            return Flow::Close(self.close(DropReason::BufferOverflow));
        }

        let outcome = match message {
            Inbound::Request(frame) => self.handle_request(&frame),
            Inbound::Change(event) => self.handle_change(&event),
            Inbound::Disconnect => return Flow::Close(self.close(DropReason::Disconnected)),
        };

        match outcome {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close(self.close(DropReason::Disconnected)),
        }
    }

    /// Answer one client frame. Client mistakes become error frames; only a
    /// closed outbox is returned as an error.
    fn handle_request(&mut self, frame: &Value) -> Result<()> {
        let request = match protocol::parse_request(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(connection = %self.id(), error = %e, "rejected client frame");
                return self.send(ServerMessage::error(protocol::request_id(frame), &e));
            }
        };

        let id = request.id();
        let result = match request {
            ClientRequest::Subscribe(request) => self.subscribe(request),
            ClientRequest::Unsubscribe { id } => self.unsubscribe(id),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_client_error() {
                    tracing::debug!(connection = %self.id(), request_id = %id, error = %e, "request refused");
                } else {
                    tracing::error!(connection = %self.id(), request_id = %id, error = %e, "request failed");
                }
                self.send(ServerMessage::error(Some(id), &e))
            }
        }
    }

    /// Register the subscription, then authorize it and take its initial
    /// visible set. A failure after registration takes it back out.
    fn subscribe(&mut self, request: SubscribeRequest) -> Result<()> {
        let resource = self.engine.resource(&request.model)?;
        let request_id = request.id;
        let subscription = match request.action {
            Action::List => Subscription::list(request_id, request.model.as_str(), request.filter),
            Action::Retrieve => Subscription::retrieve(
                request_id,
                request.model.as_str(),
                request.lookup_by.unwrap_or(Value::Null),
                request.filter,
            ),
        };

        // Joins the group before the first read, so a write racing the
        // snapshot is queued behind this request instead of lost. Also the
        // only check for a reused request id, made before any read.
        self.registry.add(subscription)?;

        let populated = match self.registry.get(request_id) {
            Some(subscription) => self.initial_visible(resource.as_ref(), subscription),
            None => Ok(VisibleSet::new()),
        };
        let visible = match populated {
            Ok(visible) => visible,
            Err(e) => {
                let _ = self.registry.remove(request_id);
                return Err(e);
            }
        };

        let connection = self.id();
        if let Some(subscription) = self.registry.get_mut(request_id) {
            subscription.set_visible(visible);
            tracing::info!(
                %connection,
                request_id = %subscription.request_id,
                resource_type = %subscription.resource_type,
                action = subscription.action.as_str(),
                visible = subscription.visible_len(),
                "subscribed"
            );
        }
        Ok(())
    }

    /// What `subscription` may see right now.
    ///
    /// Lists need collection access and then take a snapshot. A retrieve
    /// needs its target to exist (404) and both access checks to pass (403).
    fn initial_visible(
        &self,
        resource: &dyn Resource,
        subscription: &Subscription,
    ) -> Result<VisibleSet> {
        let principal = &self.principal;
        let filter = &subscription.filter;

        match subscription.action {
            Action::List => {
                let ctx = AccessContext::collection(Action::List, filter);
                if !resource.check_access(principal, &ctx)? {
                    return Err(LiveError::Forbidden(format!(
                        "not allowed to list {}",
                        subscription.resource_type
                    )));
                }
                self.engine.snapshot(resource, principal, subscription)
            }
            Action::Retrieve => {
                let lookup = subscription.lookup_value.clone().unwrap_or(Value::Null);
                let record = resource
                    .find_by_lookup(principal, filter, &lookup)?
                    .ok_or_else(|| {
                        LiveError::NotFound(format!(
                            "{} {} not found",
                            subscription.resource_type, lookup
                        ))
                    })?;

                let allowed = resource.check_access(
                    principal,
                    &AccessContext::collection(Action::Retrieve, filter),
                )? && resource.check_access(
                    principal,
                    &AccessContext::object(Action::Retrieve, filter, &record),
                )?;
                if !allowed {
                    return Err(LiveError::Forbidden(format!(
                        "not allowed to retrieve {} {}",
                        subscription.resource_type, lookup
                    )));
                }

                let mut visible = VisibleSet::new();
                visible.insert(record.id, record.lookup_key);
                Ok(visible)
            }
        }
    }

    fn unsubscribe(&mut self, id: RequestId) -> Result<()> {
        let subscription = self.registry.remove(id)?;
        tracing::info!(
            connection = %self.id(),
            request_id = %id,
            resource_type = %subscription.resource_type,
            delivered = subscription.delivered(),
            "unsubscribed"
        );
        Ok(())
    }

    fn handle_change(&mut self, event: &ChangeEvent) -> Result<()> {
        for notification in self.engine.dispatch(&mut self.registry, &self.principal, event) {
            self.send(ServerMessage::broadcast(notification, self.camelize))?;
        }
        Ok(())
    }

    fn send(&self, message: ServerMessage) -> Result<()> {
        self.outbox.send(message).map_err(|_| LiveError::Disconnected)
    }

    /// Drop every subscription and release every group membership.
    fn close(&mut self, reason: DropReason) -> DropReason {
        let dropped = self.registry.clear();
        tracing::info!(connection = %self.id(), ?reason, subscriptions = dropped, "connection closed");
        reason
    }
}
