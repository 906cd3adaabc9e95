//! Live subscriptions with per-subscriber visibility diffing.
//!
//! - [`GroupRouter`]: shared table of which connections listen on which
//!   resource group; fans raw change events out to their inboxes.
//! - [`SubscriptionRegistry`]: one per connection, owns that connection's
//!   [`Subscription`]s and reference-counts its group memberships.
//! - [`VisibilityDiffEngine`]: classifies each event as CREATED, UPDATED or
//!   DELETED relative to each subscription's visible set.
//!
//! # Example
//!
//! ```ignore
//! let router = Arc::new(GroupRouter::new());
//! let (mailbox, inbox) = Mailbox::new(ConnectionId(1), 1000);
//! let mut registry = SubscriptionRegistry::new(Arc::clone(&router), mailbox);
//!
//! registry.add(Subscription::list(RequestId(1), "test_app.Todo", filter))?;
//! router.publish(&GroupName::for_resource("test_app.Todo"), event);
//!
//! if let Ok(Inbound::Change(event)) = inbox.recv() {
//!     for notification in engine.dispatch(&mut registry, &principal, &event) {
//!         println!("{:?}", notification.kind);
//!     }
//! }
//! ```

mod engine;
mod registry;
mod router;
mod types;

pub use engine::{deleted_instance, VisibilityDiffEngine};
pub use registry::SubscriptionRegistry;
pub use router::{GroupRouter, Mailbox, RouterStats};
pub use types::{DropReason, Inbound, Notification, Subscription, VisibleSet};
