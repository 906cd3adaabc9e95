//! In-memory resource table.
//!
//! A thread-safe table of JSON rows implementing [`Resource`]. It doubles as
//! the storage layer in tests and benchmarks: every mutation is reported to an
//! attached [`ChangeEventSource`] after the write is applied.

use super::{AccessContext, Record, Resource, DEFAULT_LOOKUP_FIELD};
use crate::error::{LiveError, Result};
use crate::source::ChangeEventSource;
use crate::types::{values_match, FilterParams, Principal, RecordId};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Query parameter consulted by `search_on` fields.
const SEARCH_PARAM: &str = "search";

type Row = Map<String, Value>;
type RowPredicate = dyn Fn(&Row) -> bool + Send + Sync;
type CollectionCheck = dyn Fn(&Principal, &AccessContext<'_>) -> bool + Send + Sync;
type ObjectCheck = dyn Fn(&Principal, &Record) -> bool + Send + Sync;
type Renderer = dyn Fn(&Principal, &FilterParams, &Record) -> Value + Send + Sync;

/// A [`Resource`] backed by an in-memory row map.
pub struct MemoryResource {
    resource_type: String,
    lookup_field: String,
    rows: RwLock<BTreeMap<RecordId, Row>>,
    next_id: AtomicI64,
    /// View kwargs that filter rows by exact match.
    filter_fields: Vec<String>,
    /// Fields matched case-insensitively against the `search` query param.
    search_fields: Vec<String>,
    /// Fields included by the default renderer (`None` = all).
    render_fields: Option<Vec<String>>,
    base_filter: Option<Box<RowPredicate>>,
    collection_check: Option<Box<CollectionCheck>>,
    object_check: Option<Box<ObjectCheck>>,
    renderer: Option<Box<Renderer>>,
    source: RwLock<Option<ChangeEventSource>>,
    failing: AtomicBool,
}

impl MemoryResource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            lookup_field: DEFAULT_LOOKUP_FIELD.to_string(),
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            filter_fields: Vec::new(),
            search_fields: Vec::new(),
            render_fields: None,
            base_filter: None,
            collection_check: None,
            object_check: None,
            renderer: None,
            source: RwLock::new(None),
            failing: AtomicBool::new(false),
        }
    }

    // --- Configuration ---

    pub fn with_lookup_field(mut self, field: impl Into<String>) -> Self {
        self.lookup_field = field.into();
        self
    }

    /// View kwargs named here restrict rows to those with an equal field.
    pub fn filter_on(mut self, fields: &[&str]) -> Self {
        self.filter_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn search_on(mut self, fields: &[&str]) -> Self {
        self.search_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.render_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Restrict the table to rows matching `predicate` for every subscriber.
    pub fn with_base_filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.base_filter = Some(Box::new(predicate));
        self
    }

    pub fn with_permission<F>(mut self, check: F) -> Self
    where
        F: Fn(&Principal, &AccessContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.collection_check = Some(Box::new(check));
        self
    }

    pub fn with_object_permission<F>(mut self, check: F) -> Self
    where
        F: Fn(&Principal, &Record) -> bool + Send + Sync + 'static,
    {
        self.object_check = Some(Box::new(check));
        self
    }

    pub fn with_renderer<F>(mut self, render: F) -> Self
    where
        F: Fn(&Principal, &FilterParams, &Record) -> Value + Send + Sync + 'static,
    {
        self.renderer = Some(Box::new(render));
        self
    }

    /// Report future mutations to `source`.
    pub fn attach(&self, source: ChangeEventSource) {
        *self.source.write() = Some(source);
    }

    /// Make every read fail, simulating a broken backing store.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    // --- Mutations ---

    /// Insert a row with a fresh integer id. Returns the id.
    pub fn insert(&self, fields: Value) -> Result<RecordId> {
        let id = RecordId::Int(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert_with_id(id.clone(), fields)?;
        Ok(id)
    }

    /// Insert or replace the row with `id`.
    pub fn insert_with_id(&self, id: RecordId, fields: Value) -> Result<()> {
        let mut row = into_row(fields)?;
        row.insert("id".to_string(), id.to_value());
        self.rows.write().insert(id.clone(), row);
        self.notify_saved(&id);
        Ok(())
    }

    /// Merge `patch` into the row with `id`.
    pub fn update(&self, id: &RecordId, patch: Value) -> Result<()> {
        let patch = into_row(patch)?;
        {
            let mut rows = self.rows.write();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| LiveError::NotFound(format!("{} {}", self.resource_type, id)))?;
            for (key, value) in patch {
                if key != "id" {
                    row.insert(key, value);
                }
            }
        }
        self.notify_saved(id);
        Ok(())
    }

    /// Remove the row with `id`. Returns whether it existed.
    pub fn delete(&self, id: &RecordId) -> bool {
        let existed = self.rows.write().remove(id).is_some();
        if existed {
            if let Some(source) = self.source.read().as_ref() {
                source.record_deleted(&self.resource_type, id.clone());
            }
        }
        existed
    }

    pub fn get(&self, id: &RecordId) -> Option<Value> {
        self.rows.read().get(id).cloned().map(Value::Object)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn notify_saved(&self, id: &RecordId) {
        if let Some(source) = self.source.read().as_ref() {
            source.record_saved(&self.resource_type, id.clone());
        }
    }

    // --- Reads ---

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LiveError::Collaborator(format!(
                "{} table unavailable",
                self.resource_type
            )));
        }
        Ok(())
    }

    fn matches(&self, row: &Row, filter: &FilterParams) -> bool {
        if let Some(ref base) = self.base_filter {
            if !base(row) {
                return false;
            }
        }

        for field in &self.filter_fields {
            if let Some(expected) = filter.kwarg(field) {
                match row.get(field) {
                    Some(actual) if values_match(actual, expected) => {}
                    _ => return false,
                }
            }
        }

        if let Some(term) = filter.param(SEARCH_PARAM).and_then(Value::as_str) {
            let term = term.to_lowercase();
            let hit = self.search_fields.iter().any(|field| {
                row.get(field)
                    .and_then(Value::as_str)
                    .map(|text| text.to_lowercase().contains(&term))
                    .unwrap_or(false)
            });
            if !hit {
                return false;
            }
        }

        true
    }

    fn to_record(&self, id: &RecordId, row: &Row) -> Record {
        let lookup_key = if self.lookup_field == DEFAULT_LOOKUP_FIELD {
            id.to_value()
        } else {
            row.get(&self.lookup_field).cloned().unwrap_or(Value::Null)
        };
        Record {
            id: id.clone(),
            lookup_key,
            fields: Value::Object(row.clone()),
        }
    }
}

impl Resource for MemoryResource {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn lookup_field(&self) -> &str {
        &self.lookup_field
    }

    fn check_access(&self, principal: &Principal, ctx: &AccessContext<'_>) -> Result<bool> {
        if let Some(ref check) = self.collection_check {
            if !check(principal, ctx) {
                return Ok(false);
            }
        }
        if let (Some(record), Some(check)) = (ctx.record, self.object_check.as_ref()) {
            return Ok(check(principal, record));
        }
        Ok(true)
    }

    fn query(&self, _principal: &Principal, filter: &FilterParams) -> Result<Vec<Record>> {
        self.check_available()?;
        let rows = self.rows.read();
        Ok(rows
            .iter()
            .filter(|(_, row)| self.matches(row, filter))
            .map(|(id, row)| self.to_record(id, row))
            .collect())
    }

    fn fetch(
        &self,
        _principal: &Principal,
        filter: &FilterParams,
        id: &RecordId,
    ) -> Result<Option<Record>> {
        self.check_available()?;
        let rows = self.rows.read();
        Ok(rows
            .get(id)
            .filter(|row| self.matches(row, filter))
            .map(|row| self.to_record(id, row)))
    }

    fn find_by_lookup(
        &self,
        _principal: &Principal,
        filter: &FilterParams,
        lookup: &Value,
    ) -> Result<Option<Record>> {
        self.check_available()?;
        let rows = self.rows.read();
        // Lookup fields need not be unique; the first row passing the filter
        // wins.
        Ok(rows
            .iter()
            .filter(|(_, row)| self.matches(row, filter))
            .map(|(id, row)| self.to_record(id, row))
            .find(|record| values_match(&record.lookup_key, lookup)))
    }

    fn render(
        &self,
        principal: &Principal,
        filter: &FilterParams,
        record: &Record,
    ) -> Result<Value> {
        if let Some(ref render) = self.renderer {
            return Ok(render(principal, filter, record));
        }
        match (&self.render_fields, &record.fields) {
            (Some(fields), Value::Object(row)) => {
                let projected: Row = fields
                    .iter()
                    .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
                    .collect();
                Ok(Value::Object(projected))
            }
            _ => Ok(record.fields.clone()),
        }
    }
}

fn into_row(fields: Value) -> Result<Row> {
    match fields {
        Value::Object(row) => Ok(row),
        other => Err(LiveError::BadRequest(format!(
            "row must be a JSON object, got {}",
            other
        ))),
    }
}
