//! JSON wire format between clients and the server.
//!
//! Inbound frames are validated field by field rather than through a derived
//! `Deserialize`, so a malformed request can still be answered with an error
//! that carries its `id`.

use crate::error::{LiveError, Result};
use crate::subscriptions::Notification;
use crate::types::{Action, ChangeKind, FilterParams, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A validated client request.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientRequest {
    Subscribe(SubscribeRequest),
    Unsubscribe { id: RequestId },
}

impl ClientRequest {
    pub fn id(&self) -> RequestId {
        match self {
            ClientRequest::Subscribe(request) => request.id,
            ClientRequest::Unsubscribe { id } => *id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeRequest {
    pub id: RequestId,
    pub model: String,
    pub action: Action,
    /// Lookup value of the retrieve target.
    pub lookup_by: Option<Value>,
    pub filter: FilterParams,
}

/// Frames sent from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A classified change for one subscription.
    Broadcast {
        id: RequestId,
        model: String,
        action: ChangeKind,
        instance: Value,
    },

    /// A request failed. `id` is null when the request had no usable id.
    Error {
        id: Option<RequestId>,
        code: u16,
        message: String,
    },
}

impl ServerMessage {
    /// Frame a notification. CREATED/UPDATED payload keys are camelCased when
    /// `camelize` is set; deletion payloads are sent as-is.
    pub fn broadcast(notification: Notification, camelize: bool) -> Self {
        let instance = if camelize && notification.kind != ChangeKind::Deleted {
            camelize_keys(notification.instance)
        } else {
            notification.instance
        };
        ServerMessage::Broadcast {
            id: notification.request_id,
            model: notification.resource_type,
            action: notification.kind,
            instance,
        }
    }

    pub fn error(id: Option<RequestId>, error: &LiveError) -> Self {
        ServerMessage::Error {
            id,
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Best-effort extraction of the request id, used to address error replies.
pub fn request_id(frame: &Value) -> Option<RequestId> {
    frame.get("id").and_then(Value::as_i64).map(RequestId)
}

/// Validate a raw client frame.
pub fn parse_request(frame: &Value) -> Result<ClientRequest> {
    let object = frame
        .as_object()
        .ok_or_else(|| bad_request("request must be a JSON object"))?;

    let id = match object.get("id") {
        None | Some(Value::Null) => return Err(bad_request("missing request id")),
        Some(value) => value
            .as_i64()
            .map(RequestId)
            .ok_or_else(|| bad_request("request id must be an integer"))?,
    };

    match object.get("type").and_then(Value::as_str) {
        Some("subscribe") => parse_subscribe(id, object).map(ClientRequest::Subscribe),
        Some("unsubscribe") => Ok(ClientRequest::Unsubscribe { id }),
        Some(other) => Err(bad_request(&format!("unknown request type {}", other))),
        None => Err(bad_request("missing request type")),
    }
}

fn parse_subscribe(id: RequestId, object: &Map<String, Value>) -> Result<SubscribeRequest> {
    let model = match object.get("model") {
        Some(Value::String(model)) if !model.is_empty() => model.clone(),
        _ => return Err(bad_request("no model specified")),
    };

    let action = match object.get("action") {
        Some(Value::String(action)) => Action::parse(action).ok_or_else(|| {
            bad_request(&format!(
                "action {} not supported, expected list or retrieve",
                action
            ))
        })?,
        _ => return Err(bad_request("no action specified")),
    };

    let lookup_by = match object.get("lookup_by") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.clone()),
    };
    if action == Action::Retrieve && lookup_by.is_none() {
        return Err(bad_request("retrieve requires a lookup_by value"));
    }

    let filter = FilterParams {
        view_kwargs: object_field(object, "view_kwargs")?,
        query_params: object_field(object, "query_params")?,
    };

    Ok(SubscribeRequest {
        id,
        model,
        action,
        lookup_by,
        filter,
    })
}

fn object_field(object: &Map<String, Value>, key: &str) -> Result<Map<String, Value>> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(bad_request(&format!("{} must be an object", key))),
    }
}

fn bad_request(message: &str) -> LiveError {
    LiveError::BadRequest(message.to_string())
}

/// Convert `snake_case` object keys to `camelCase`, recursively.
pub fn camelize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (camelize(&key), camelize_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(camelize_keys).collect()),
        other => other,
    }
}

fn camelize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, c) in key.chars().enumerate() {
        if c == '_' && i > 0 {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
