//! # Live Subscriptions
//!
//! Clients subscribe over a persistent connection to a filtered collection or
//! a single record and are told when records they can see are created,
//! updated or deleted, without polling.
//!
//! ## Core Concepts
//!
//! - **Resources**: per-type query, permission and rendering collaborators
//! - **Groups**: broadcast channels fanning change events out per resource type
//! - **Visible sets**: what each subscription could see after the last event
//! - **Visibility diff**: CREATED / UPDATED / DELETED decided per subscriber
//!
//! ## Example
//!
//! ```ignore
//! use rest_live::{LiveConfig, LiveServer, MemoryResource, Principal, ResourceRegistry};
//!
//! let todos = Arc::new(MemoryResource::new("test_app.Todo").filter_on(&["list_id"]));
//! let server = LiveServer::new(
//!     LiveConfig::default(),
//!     ResourceRegistry::new().with(todos.clone())?,
//! );
//! todos.attach(server.change_source());
//!
//! let (outbox, frames) = crossbeam_channel::unbounded();
//! let connection = server.connect(Principal::anonymous(), outbox);
//! let handle = connection.handle();
//! connection.spawn()?;
//!
//! handle.send_json(json!({
//!     "id": 1, "type": "subscribe", "model": "test_app.Todo",
//!     "action": "list", "view_kwargs": {"list_id": 7},
//! }))?;
//!
//! todos.insert(json!({"text": "milk", "list_id": 7}))?;
//! // frames.recv() => {"type": "broadcast", "id": 1, "action": "CREATED", ...}
//! ```

pub mod connection;
pub mod error;
pub mod protocol;
pub mod resources;
pub mod server;
pub mod source;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use connection::{Connection, ConnectionHandle, Flow};
pub use error::{LiveError, Result};
pub use protocol::{ClientRequest, ServerMessage, SubscribeRequest};
pub use resources::{AccessContext, MemoryResource, Record, Resource, ResourceRegistry};
pub use server::{LiveConfig, LiveServer};
pub use source::ChangeEventSource;
pub use subscriptions::{
    DropReason, GroupRouter, Inbound, Mailbox, Notification, RouterStats, Subscription,
    SubscriptionRegistry, VisibilityDiffEngine, VisibleSet,
};
pub use types::*;
