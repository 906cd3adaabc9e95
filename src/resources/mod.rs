//! Resource collaborators.
//!
//! The engine never touches storage directly. Each resource type plugs in a
//! [`Resource`] implementation that answers three questions for a principal:
//! which records are visible, may this record be seen, and what does it look
//! like on the wire.

pub mod memory;
mod registry;
mod resource;

pub use memory::MemoryResource;
pub use registry::ResourceRegistry;
pub use resource::{AccessContext, Record, Resource, DEFAULT_LOOKUP_FIELD};
