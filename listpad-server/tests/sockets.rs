//! Visibility and error handling over the WebSocket interface.

use std::sync::Arc;

use anyhow::Result;
use common::*;
use listpad_server::{ServerState, server};
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_public_list_visible_to_everyone() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect(Some("alice")).await?;
    alice.handshake("user-alice").await?;
    let mut bob = client.connect(Some("bob")).await?;
    bob.handshake("user-bob").await?;

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {"type": "create_list", "name": "Groceries", "visibility": "public"}
        }))
        .await;

    for socket in [&mut alice, &mut bob] {
        let state = socket.recv_snapshot(&json!("registry")).await?;
        let lists = state.as_array().unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0]["name"], "Groceries");
        assert_eq!(lists[0]["ownerId"], "user-alice");
        assert_eq!(lists[0]["visibility"], "public");
        assert_eq!(lists[0]["archived"], false);
    }
    Ok(())
}

#[tokio::test]
async fn test_private_list_is_invisible_and_unsubscribable() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect(Some("alice")).await?;
    alice.handshake("user-alice").await?;
    let mut bob = client.connect(Some("bob")).await?;
    bob.handshake("user-bob").await?;

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {"type": "create_list", "name": "Diary", "visibility": "private"}
        }))
        .await;

    let state = alice.recv_snapshot(&json!("registry")).await?;
    assert_eq!(state.as_array().unwrap().len(), 1);
    let list_id = state[0]["id"].as_str().unwrap().to_string();

    // Bob receives the broadcast too, filtered down to nothing.
    let state = bob.recv_snapshot(&json!("registry")).await?;
    assert_eq!(state, json!([]));

    bob.send(&json!({"type": "subscribe", "doc": {"listId": list_id}}))
        .await;
    let err = bob.recv_type("error").await?;
    assert_eq!(err["code"], "FORBIDDEN");
    Ok(())
}

#[tokio::test]
async fn test_collaborator_gains_access() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect(Some("alice")).await?;
    alice.handshake("user-alice").await?;
    let mut bob = client.connect(Some("bob")).await?;
    bob.handshake("user-bob").await?;

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {"type": "create_list", "name": "Shared", "visibility": "private"}
        }))
        .await;
    let state = alice.recv_snapshot(&json!("registry")).await?;
    let list_id = state[0]["id"].as_str().unwrap().to_string();

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {
                "type": "set_collaborators",
                "listId": list_id,
                "collaborators": ["user-bob"]
            }
        }))
        .await;

    // First the create broadcast (nothing visible), then the
    // collaborator change.
    let state = bob.recv_snapshot(&json!("registry")).await?;
    assert_eq!(state, json!([]));
    let state = bob.recv_snapshot(&json!("registry")).await?;
    assert_eq!(state.as_array().unwrap().len(), 1);
    assert_eq!(state[0]["collaborators"], json!(["user-bob"]));

    bob.send(&json!({"type": "subscribe", "doc": {"listId": list_id}}))
        .await;
    let snapshot = bob.recv_snapshot(&json!({"listId": list_id})).await?;
    assert_eq!(snapshot["items"], json!([]));
    Ok(())
}

#[tokio::test]
async fn test_revoked_collaborator_loses_the_subscription() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect(Some("alice")).await?;
    alice.handshake("user-alice").await?;
    let mut bob = client.connect(Some("bob")).await?;
    bob.handshake("user-bob").await?;

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {"type": "create_list", "name": "Shared", "visibility": "private"}
        }))
        .await;
    let state = alice.recv_snapshot(&json!("registry")).await?;
    let list_id = state[0]["id"].as_str().unwrap().to_string();

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {"type": "set_collaborators", "listId": list_id, "collaborators": ["user-bob"]}
        }))
        .await;
    // Wait until the grant reached Bob before subscribing.
    bob.recv_snapshot(&json!("registry")).await?;
    let state = bob.recv_snapshot(&json!("registry")).await?;
    assert_eq!(state.as_array().unwrap().len(), 1);
    bob.send(&json!({"type": "subscribe", "doc": {"listId": list_id}}))
        .await;
    bob.recv_snapshot(&json!({"listId": list_id})).await?;

    alice
        .send(&json!({
            "type": "registry_action",
            "action": {"type": "set_collaborators", "listId": list_id, "collaborators": []}
        }))
        .await;

    // The registry broadcast no longer shows the list to Bob, and his
    // list subscription is gone: a full-state request for it errors.
    let state = bob.recv_snapshot(&json!("registry")).await?;
    assert_eq!(state, json!([]));
    bob.send(&json!({"type": "request_full_state", "doc": {"listId": list_id}}))
        .await;
    let err = bob.recv_type("error").await?;
    assert_eq!(err["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn test_malformed_frames_get_bad_request() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect(None).await?;
    let welcome = socket.recv().await?;
    assert_eq!(welcome["type"], "welcome");
    assert!(
        welcome["userId"]
            .as_str()
            .unwrap()
            .starts_with("anon-")
    );
    socket.recv_snapshot(&json!("registry")).await?;
    socket.recv_snapshot(&json!("bulletins")).await?;

    socket.send(&json!("not an object")).await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "BAD_REQUEST");

    socket
        .send(&json!({"type": "subscribe", "doc": "wat"}))
        .await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "BAD_REQUEST");

    socket
        .send(&json!({"type": "subscribe", "doc": {"listId": "no-such-list"}}))
        .await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "NOT_FOUND");

    // The connection survives all of it.
    socket.send(&json!({"type": "hello", "clientVersion": "test"}))
        .await;
    socket
        .send(&json!({"type": "request_full_state", "doc": "registry"}))
        .await;
    socket.recv_snapshot(&json!("registry")).await?;
    Ok(())
}

#[tokio::test]
async fn test_health_and_debug_endpoints() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let health = client.get("healthz").await?;
    assert_eq!(health, r#"{"ok":true}"#);

    let stats: serde_json::Value = serde_json::from_str(&client.get("stats").await?)?;
    assert_eq!(stats["num_documents"], 2);

    let debug: serde_json::Value = serde_json::from_str(&client.get("debug/state").await?)?;
    assert_eq!(debug["registry"], json!([]));
    assert_eq!(debug["bulletins"], json!([]));
    Ok(())
}
