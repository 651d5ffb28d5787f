//! Server backend for the listpad collaborative list service.
//!
//! One server instance holds the authoritative CRDT replicas of three
//! document families (the list registry, per-list item documents, and
//! a bulletin board), persists them, enforces access control, and
//! relays sync messages between subscribed WebSocket clients.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use automerge::AutoCommit;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{error, info};

mod access;
mod actions;
mod doc;
mod ids;
mod model;
mod project;
mod session;
mod store;
mod sync;

use crate::doc::DocKey;
use crate::ids::ListId;
use crate::session::Conn;
use crate::store::Store;

/// How often dirty documents are written back to storage.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// One cached document plus its dirty tracking.
///
/// `seq` advances on every mutation and `flushed` records the last
/// sequence whose bytes reached storage, so a failed write leaves the
/// document dirty and a mutation racing a flush is not lost.
pub(crate) struct DocState {
    pub(crate) doc: AutoCommit,
    seq: u64,
    flushed: u64,
}

impl DocState {
    fn clean(doc: AutoCommit) -> Self {
        Self {
            doc,
            seq: 0,
            flushed: 0,
        }
    }

    /// A document that must be persisted even if never touched again.
    pub(crate) fn fresh(doc: AutoCommit) -> Self {
        Self {
            doc,
            seq: 1,
            flushed: 0,
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.seq += 1;
    }

    fn dirty(&self) -> bool {
        self.seq > self.flushed
    }
}

/// Everything guarded by the server's single critical section:
/// the document cache, its dirty tracking, and the connection
/// registry. One inbound frame is handled entirely under this lock.
pub(crate) struct Shared {
    pub(crate) docs: HashMap<DocKey, DocState>,
    pub(crate) conns: HashMap<u64, Conn>,
}

/// The shared state of the server.
pub struct ServerState {
    pub(crate) shared: Mutex<Shared>,
    pub(crate) store: Store,
    /// Serializes whole-store flushes (timer vs shutdown).
    flush_lock: Mutex<()>,
    start_time: u64,
    production: bool,
    next_conn: AtomicU64,
}

impl ServerState {
    /// Initialize server state backed by storage at `storage`.
    ///
    /// The registry and bulletin documents are loaded eagerly,
    /// creating empty ones if no blob exists yet. List documents load
    /// lazily on first access.
    pub async fn new(storage: PathBuf, production: bool) -> Result<Self> {
        let store = Store::new(storage).await?;
        let mut docs = HashMap::new();
        for key in [DocKey::Registry, DocKey::Bulletins] {
            let doc = match store.read(&key).await? {
                Some(bytes) => doc::load(&key, &bytes)?,
                None => doc::empty(&key)?,
            };
            docs.insert(key, DocState::clean(doc));
        }
        let start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Ok(Self {
            shared: Mutex::new(Shared {
                docs,
                conns: HashMap::new(),
            }),
            store,
            flush_lock: Mutex::new(()),
            start_time,
            production,
            next_conn: AtomicU64::new(0),
        })
    }

    /// Initialize server state in a temporary directory for testing.
    pub async fn temporary() -> Result<Self> {
        let storage = std::env::temp_dir().join(format!("listpad_{:x}", rand::random::<u64>()));
        Self::new(storage, false).await
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure the list document for `id` is cached, loading or
    /// initializing it as needed. Returns `false` if the registry has
    /// no entry for it (the document of a deleted list must not come
    /// back to life).
    pub(crate) async fn ensure_list_doc(&self, id: &ListId) -> Result<bool> {
        let key = DocKey::List(id.clone());
        {
            let shared = self.shared.lock().await;
            if shared.docs.contains_key(&key) {
                return Ok(true);
            }
        }
        // Storage I/O happens outside the critical section; the cache
        // is re-checked afterwards.
        let bytes = self.store.read(&key).await?;
        let mut shared = self.shared.lock().await;
        if shared.docs.contains_key(&key) {
            return Ok(true);
        }
        let registry = shared
            .docs
            .get(&DocKey::Registry)
            .context("registry not loaded")?;
        if model::entry_by_id(&registry.doc, id)?.is_none() {
            return Ok(false);
        }
        let doc = match bytes {
            Some(bytes) => doc::load(&key, &bytes)?,
            None => doc::empty(&key)?,
        };
        shared.docs.insert(key, DocState::clean(doc));
        Ok(true)
    }

    /// Serialize every dirty document and atomically replace its blob.
    ///
    /// Write failures are logged; the document stays dirty and is
    /// retried on the next flush.
    pub async fn flush_all(&self) {
        let _guard = self.flush_lock.lock().await;
        let pending: Vec<(DocKey, Vec<u8>, u64)> = {
            let mut shared = self.shared.lock().await;
            shared
                .docs
                .iter_mut()
                .filter(|(_, d)| d.dirty())
                .map(|(k, d)| (k.clone(), d.doc.save(), d.seq))
                .collect()
        };
        for (key, bytes, seq) in pending {
            match self.store.write(&key, &bytes).await {
                Ok(()) => {
                    let mut shared = self.shared.lock().await;
                    if let Some(d) = shared.docs.get_mut(&key)
                        && d.flushed < seq
                    {
                        d.flushed = seq;
                    }
                }
                Err(e) => error!("failed to persist {key}: {e:#}"),
            }
        }
    }

    /// Final flush, called once on shutdown.
    pub async fn persist(&self) {
        info!("flushing documents before shutdown");
        self.flush_all().await;
    }
}

/// Build the router handling all server routes and start the periodic
/// flush task.
pub fn server(state: Arc<ServerState>) -> Router {
    tokio::spawn(flusher(state.clone()));
    let mut router = Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats));
    if !state.production {
        router = router.route("/debug/state", get(debug_state));
    }
    router.with_state(state)
}

/// Writes dirty documents back on a fixed interval.
async fn flusher(state: Arc<ServerState>) {
    loop {
        time::sleep(FLUSH_INTERVAL).await;
        state.flush_all().await;
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of documents currently cached by the server.
    num_documents: usize,
    /// Number of open WebSocket connections.
    num_connections: usize,
}

async fn stats(State(state): State<Arc<ServerState>>) -> Json<Stats> {
    let shared = state.shared.lock().await;
    Json(Stats {
        start_time: state.start_time,
        num_documents: shared.docs.len(),
        num_connections: shared.conns.len(),
    })
}

/// Unfiltered dump of every cached document, for development only.
async fn debug_state(State(state): State<Arc<ServerState>>) -> Result<Json<Value>, AppError> {
    let shared = state.shared.lock().await;
    let mut dump = serde_json::Map::new();
    for (key, doc_state) in &shared.docs {
        let value = match key {
            DocKey::Registry => serde_json::to_value(model::read_entries(&doc_state.doc)?)?,
            DocKey::Bulletins => serde_json::to_value(model::read_bulletins(&doc_state.doc)?)?,
            DocKey::List(_) => json!({
                "listId": model::read_list_id(&doc_state.doc),
                "items": model::read_items(&doc_state.doc)?,
            }),
        };
        dump.insert(key.to_string(), value);
    }
    Ok(Json(Value::Object(dump)))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("application error: {:#}", self.0);
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Something went wrong",
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
