//! Per-connection rate limiting.

use std::sync::Arc;

use anyhow::Result;
use common::*;
use listpad_server::{ServerState, server};
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_action_burst_trips_the_limit() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect(Some("alice")).await?;
    socket.handshake("user-alice").await?;

    for i in 0..41 {
        socket
            .send(&json!({
                "type": "bulletin_action",
                "action": {"type": "add_bulletin", "text": format!("post {i}")}
            }))
            .await;
    }

    // Each accepted action answers with a bulletins snapshot; the
    // rejected one answers with an error. Count until all 41 frames
    // have an outcome.
    let mut accepted = 0;
    let mut rejected = 0;
    let mut last_snapshot = json!([]);
    while accepted + rejected < 41 {
        let msg = socket.recv().await?;
        match msg["type"].as_str() {
            Some("snapshot") if msg["doc"] == json!("bulletins") => {
                accepted += 1;
                last_snapshot = msg["state"].clone();
            }
            Some("error") => {
                assert_eq!(msg["code"], "RATE_LIMITED", "{msg}");
                rejected += 1;
            }
            _ => {}
        }
    }
    assert_eq!(accepted, 40);
    assert_eq!(rejected, 1);
    assert_eq!(last_snapshot.as_array().unwrap().len(), 40);

    // Zero-cost frames still go through while the bucket is empty.
    socket
        .send(&json!({"type": "request_full_state", "doc": "bulletins"}))
        .await;
    let state = socket.recv_snapshot(&json!("bulletins")).await?;
    assert_eq!(state.as_array().unwrap().len(), 40);
    Ok(())
}

#[tokio::test]
async fn test_rejected_actions_leave_no_trace() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect(Some("alice")).await?;
    alice.handshake("user-alice").await?;
    let mut bob = client.connect(Some("bob")).await?;
    bob.handshake("user-bob").await?;

    for i in 0..45 {
        alice
            .send(&json!({
                "type": "bulletin_action",
                "action": {"type": "add_bulletin", "text": format!("post {i}")}
            }))
            .await;
    }
    let err = alice.recv_type("error").await?;
    assert_eq!(err["code"], "RATE_LIMITED");

    // Bob's bucket is untouched by Alice's burst.
    bob.send(&json!({
        "type": "bulletin_action",
        "action": {"type": "add_bulletin", "text": "still fine"}
    }))
    .await;
    let mut found = false;
    for _ in 0..50 {
        let state = bob.recv_snapshot(&json!("bulletins")).await?;
        if state
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["text"] == "still fine")
        {
            found = true;
            break;
        }
    }
    assert!(found);
    Ok(())
}
