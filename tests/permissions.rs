//! Permission and per-principal rendering tests.

use crossbeam_channel::{unbounded, Receiver};
use rest_live::{
    Action, Connection, ConnectionHandle, LiveConfig, LiveServer, MemoryResource, Principal,
    ResourceRegistry, ServerMessage,
};
use serde_json::{json, Value};
use std::sync::Arc;

const TODO: &str = "test_app.Todo";

fn serve(table: MemoryResource) -> (Arc<MemoryResource>, LiveServer) {
    let table = Arc::new(table);
    let resources = ResourceRegistry::new().with(table.clone()).unwrap();
    let server = LiveServer::new(LiveConfig::default(), resources);
    table.attach(server.change_source());
    (table, server)
}

struct Client {
    connection: Connection,
    handle: ConnectionHandle,
    frames: Receiver<ServerMessage>,
}

impl Client {
    fn connect(server: &LiveServer, principal: Principal) -> Self {
        let (outbox, frames) = unbounded();
        let connection = server.connect(principal, outbox);
        let handle = connection.handle();
        Self {
            connection,
            handle,
            frames,
        }
    }

    /// Send a frame and return the reply, if one was produced.
    fn send(&mut self, frame: Value) -> Option<Value> {
        self.handle.send_json(frame).unwrap();
        self.next()
    }

    fn next(&mut self) -> Option<Value> {
        assert_eq!(self.connection.process_pending(), None);
        self.frames.try_recv().ok().map(|m| m.to_json().unwrap())
    }
}

fn owned_todos() -> MemoryResource {
    MemoryResource::new(TODO)
        .with_fields(&["id", "text", "owner"])
        .with_object_permission(|principal, record| {
            principal.user.is_some()
                && record.fields.get("owner").and_then(Value::as_str) == principal.user.as_deref()
        })
}

// --- Collection Permissions ---

#[test]
fn test_list_requires_authentication() {
    let table = MemoryResource::new(TODO)
        .with_permission(|principal, _| principal.is_authenticated());
    let (todos, server) = serve(table);

    let mut anonymous = Client::connect(&server, Principal::anonymous());
    let reply = anonymous
        .send(json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"}))
        .unwrap();
    assert_eq!(reply["code"], 403);
    assert!(anonymous.connection.subscriptions().is_empty());

    let mut alice = Client::connect(&server, Principal::user("alice"));
    assert!(alice
        .send(json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"}))
        .is_none());

    todos.insert(json!({"text": "test"})).unwrap();
    assert_eq!(alice.next().unwrap()["action"], "CREATED");
    assert!(anonymous.next().is_none());
}

#[test]
fn test_kwargs_and_query_param_permission() {
    let table = MemoryResource::new(TODO).with_permission(|_, ctx| {
        ctx.filter.kwarg("password") == Some(&json!("opensesame"))
            || ctx.filter.param("password") == Some(&json!("opensesame-param"))
    });
    let (todos, server) = serve(table);
    let mut client = Client::connect(&server, Principal::anonymous());

    let denied = client
        .send(json!({
            "id": 1, "type": "subscribe", "model": TODO, "action": "list",
            "view_kwargs": {"password": "wrong"},
        }))
        .unwrap();
    assert_eq!(denied["code"], 403);

    assert!(client
        .send(json!({
            "id": 2, "type": "subscribe", "model": TODO, "action": "list",
            "view_kwargs": {"password": "opensesame"},
        }))
        .is_none());
    assert!(client
        .send(json!({
            "id": 3, "type": "subscribe", "model": TODO, "action": "list",
            "query_params": {"password": "opensesame-param"},
        }))
        .is_none());

    todos.insert(json!({"text": "test"})).unwrap();
    let first = client.next().unwrap();
    let second = client.next().unwrap();
    assert_eq!((first["id"].clone(), second["id"].clone()), (json!(2), json!(3)));
}

#[test]
fn test_permission_sees_action() {
    let table = MemoryResource::new(TODO).with_permission(|_, ctx| ctx.action == Action::Retrieve);
    let (todos, server) = serve(table);
    let id = todos.insert(json!({"text": "test"})).unwrap();
    let mut client = Client::connect(&server, Principal::anonymous());

    let reply = client
        .send(json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"}))
        .unwrap();
    assert_eq!(reply["code"], 403);

    assert!(client
        .send(json!({
            "id": 2, "type": "subscribe", "model": TODO, "action": "retrieve",
            "lookup_by": id.to_value(),
        }))
        .is_none());
}

// --- Row-Level Permissions ---

#[test]
fn test_list_only_sees_own_rows() {
    let (todos, server) = serve(owned_todos());
    let mut alice = Client::connect(&server, Principal::user("alice"));
    assert!(alice
        .send(json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"}))
        .is_none());

    todos.insert(json!({"text": "bob's", "owner": "bob"})).unwrap();
    assert!(alice.next().is_none());

    let id = todos.insert(json!({"text": "alice's", "owner": "alice"})).unwrap();
    let frame = alice.next().unwrap();
    assert_eq!(frame["action"], "CREATED");
    assert_eq!(frame["instance"]["id"], id.to_value());
}

#[test]
fn test_denied_and_missing_are_indistinguishable() {
    let (todos, server) = serve(owned_todos());
    let mut alice = Client::connect(&server, Principal::user("alice"));
    assert!(alice
        .send(json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"}))
        .is_none());

    let hidden = todos.insert(json!({"text": "secret", "owner": "bob"})).unwrap();
    todos.update(&hidden, json!({"text": "still secret"})).unwrap();
    todos.delete(&hidden);
    assert!(alice.next().is_none());

    // Same observable outcome as an event for a row that never existed.
    server.change_source().record_deleted(TODO, 4242);
    assert!(alice.next().is_none());
}

#[test]
fn test_ownership_change_is_reported_as_deletion() {
    let (todos, server) = serve(owned_todos());
    let id = todos.insert(json!({"text": "shared", "owner": "alice"})).unwrap();
    let mut alice = Client::connect(&server, Principal::user("alice"));
    assert!(alice
        .send(json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"}))
        .is_none());

    todos.update(&id, json!({"owner": "bob"})).unwrap();
    let frame = alice.next().unwrap();
    assert_eq!(frame["action"], "DELETED");
    assert_eq!(frame["instance"], json!({"pk": id.to_value(), "id": id.to_value()}));

    todos.update(&id, json!({"owner": "alice"})).unwrap();
    assert_eq!(alice.next().unwrap()["action"], "CREATED");
}

#[test]
fn test_retrieve_forbidden_vs_missing() {
    let (todos, server) = serve(owned_todos());
    let id = todos.insert(json!({"text": "bob's", "owner": "bob"})).unwrap();
    let mut alice = Client::connect(&server, Principal::user("alice"));

    let forbidden = alice
        .send(json!({
            "id": 1, "type": "subscribe", "model": TODO, "action": "retrieve",
            "lookup_by": id.to_value(),
        }))
        .unwrap();
    assert_eq!(forbidden["code"], 403);

    let missing = alice
        .send(json!({
            "id": 2, "type": "subscribe", "model": TODO, "action": "retrieve",
            "lookup_by": 42,
        }))
        .unwrap();
    assert_eq!(missing["code"], 404);
    assert!(alice.connection.subscriptions().is_empty());
}

// --- Rendering ---

#[test]
fn test_rendering_depends_on_principal() {
    let table = MemoryResource::new(TODO).with_renderer(|principal, _, record| {
        let mut instance = json!({"id": record.id.to_value(), "text": record.fields["text"]});
        if principal.claim("is_staff") == Some(&json!(true)) {
            instance["auth"] = json!("ADMIN");
        }
        instance
    });
    let (todos, server) = serve(table);

    let mut staff = Client::connect(&server, Principal::user("root").with_claim("is_staff", true));
    let mut visitor = Client::connect(&server, Principal::anonymous());
    let subscribe = json!({"id": 1, "type": "subscribe", "model": TODO, "action": "list"});
    assert!(staff.send(subscribe.clone()).is_none());
    assert!(visitor.send(subscribe).is_none());

    let id = todos.insert(json!({"text": "test"})).unwrap();
    assert_eq!(
        staff.next().unwrap()["instance"],
        json!({"id": id.to_value(), "text": "test", "auth": "ADMIN"})
    );
    assert_eq!(
        visitor.next().unwrap()["instance"],
        json!({"id": id.to_value(), "text": "test"})
    );
}
