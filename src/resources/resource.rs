//! Capability interface implemented once per resource type.

use crate::error::Result;
use crate::types::{Action, FilterParams, Principal, RecordId};
use serde_json::Value;

/// Lookup field used when a resource does not name one.
pub const DEFAULT_LOOKUP_FIELD: &str = "pk";

/// A record as seen by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Primary identifier.
    pub id: RecordId,

    /// Value of the resource's lookup field. Kept per visible record so a
    /// deletion can be reported after the row is gone.
    pub lookup_key: Value,

    /// Full field set, handed to the renderer.
    pub fields: Value,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, lookup_key: Value, fields: Value) -> Self {
        Self {
            id: id.into(),
            lookup_key,
            fields,
        }
    }
}

/// What an access check is being asked about.
#[derive(Clone, Copy, Debug)]
pub struct AccessContext<'a> {
    pub action: Action,
    pub filter: &'a FilterParams,
    /// The row under consideration; `None` for collection-level checks.
    pub record: Option<&'a Record>,
}

impl<'a> AccessContext<'a> {
    pub fn collection(action: Action, filter: &'a FilterParams) -> Self {
        Self {
            action,
            filter,
            record: None,
        }
    }

    pub fn object(action: Action, filter: &'a FilterParams, record: &'a Record) -> Self {
        Self {
            action,
            filter,
            record: Some(record),
        }
    }
}

/// Query, permission and rendering behaviour for one resource type.
///
/// All methods are called from a connection's worker thread and may block on
/// I/O; a slow call only delays that connection.
pub trait Resource: Send + Sync {
    /// Label clients subscribe with (e.g. `test_app.Todo`).
    fn resource_type(&self) -> &str;

    /// Name of the secondary key field reported in deletions.
    fn lookup_field(&self) -> &str {
        DEFAULT_LOOKUP_FIELD
    }

    /// Whether `principal` may perform `ctx.action`, on `ctx.record` if given.
    fn check_access(&self, principal: &Principal, ctx: &AccessContext<'_>) -> Result<bool>;

    /// Every record currently matching `filter`.
    fn query(&self, principal: &Principal, filter: &FilterParams) -> Result<Vec<Record>>;

    /// The record with `id`, if it exists and currently matches `filter`.
    fn fetch(
        &self,
        principal: &Principal,
        filter: &FilterParams,
        id: &RecordId,
    ) -> Result<Option<Record>>;

    /// The record whose lookup field equals `lookup`, if it matches `filter`.
    fn find_by_lookup(
        &self,
        principal: &Principal,
        filter: &FilterParams,
        lookup: &Value,
    ) -> Result<Option<Record>>;

    /// Wire payload for `record` as `principal` should see it.
    fn render(&self, principal: &Principal, filter: &FilterParams, record: &Record)
        -> Result<Value>;
}
