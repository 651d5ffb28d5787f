#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use automerge::AutoCommit;
use automerge::sync::{Message, State as SyncState, SyncDoc};
use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A test WebSocket client that sends and receives JSON messages.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = timeout(RECV_TIMEOUT, self.0.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for a frame"))?
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Skip frames until one of type `ty` arrives.
    pub async fn recv_type(&mut self, ty: &str) -> Result<Value> {
        loop {
            let msg = self.recv().await?;
            if msg["type"] == ty {
                return Ok(msg);
            }
        }
    }

    /// Skip frames until a snapshot of `doc` arrives; returns its state.
    pub async fn recv_snapshot(&mut self, doc: &Value) -> Result<Value> {
        loop {
            let msg = self.recv().await?;
            if msg["type"] == "snapshot" && msg["doc"] == *doc {
                return Ok(msg["state"].clone());
            }
        }
    }

    /// Consume the welcome frame and the two auto-subscription
    /// snapshots every fresh connection receives.
    pub async fn handshake(&mut self, user_id: &str) -> Result<()> {
        let msg = self.recv().await?;
        assert_eq!(msg["type"], "welcome", "{msg}");
        assert_eq!(msg["userId"], user_id, "{msg}");
        self.recv_snapshot(&json!("registry")).await?;
        self.recv_snapshot(&json!("bulletins")).await?;
        Ok(())
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(resp.text().await?)
    }

    pub async fn connect(&self, username: Option<&str>) -> Result<JsonSocket> {
        let url = match username {
            Some(name) => format!("ws://{}/ws?username={name}", self.addr),
            None => format!("ws://{}/ws", self.addr),
        };
        let (socket, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
        Ok(JsonSocket(socket))
    }
}

/// A client-side CRDT replica speaking the base64 sync protocol.
pub struct Replica {
    pub doc: AutoCommit,
    state: SyncState,
}

impl Replica {
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
            state: SyncState::new(),
        }
    }

    pub fn apply(&mut self, data: &str) {
        let bytes = BASE64.decode(data).unwrap();
        let message = Message::decode(&bytes).unwrap();
        self.doc
            .sync()
            .receive_sync_message(&mut self.state, message)
            .unwrap();
    }

    pub fn frames(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(message) = self.doc.sync().generate_sync_message(&mut self.state) {
            out.push(BASE64.encode(message.encode()));
        }
        out
    }
}

/// Drive the sync protocol between `socket` (subscribed to `doc`) and
/// `replica` until `done(&replica.doc)` holds.
pub async fn sync_until(
    socket: &mut JsonSocket,
    replica: &mut Replica,
    doc: &Value,
    done: impl Fn(&AutoCommit) -> bool,
) -> Result<()> {
    for data in replica.frames() {
        socket
            .send(&json!({"type": "sync", "doc": doc, "data": data}))
            .await;
    }
    for _ in 0..50 {
        if done(&replica.doc) {
            return Ok(());
        }
        let msg = socket.recv().await?;
        if msg["type"] == "sync" && msg["doc"] == *doc {
            replica.apply(msg["data"].as_str().unwrap());
            for data in replica.frames() {
                socket
                    .send(&json!({"type": "sync", "doc": doc, "data": data}))
                    .await;
            }
        }
    }
    Err(anyhow!("documents did not converge"))
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
