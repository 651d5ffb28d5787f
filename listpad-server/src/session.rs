//! Per-connection session loop.
//!
//! Each WebSocket connection is identified once at upgrade, carries
//! its own subscription map and rate-limit bucket, and is served by a
//! reader loop plus a writer task draining an unbounded outbound
//! queue. All document mutations and subscription changes happen under
//! the server's single shared lock, one inbound frame at a time;
//! socket and storage I/O stay outside it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::access;
use crate::actions::{
    self, ActionError, BulletinAction, ErrorCode, ListAction, RegistryAction, RegistryEffect,
};
use crate::doc::DocKey;
use crate::ids::{ListId, UserId};
use crate::model;
use crate::project::{self, Snapshot};
use crate::sync;
use crate::{DocState, ServerState, Shared};

/// A message received from a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    Hello {
        client_version: String,
    },
    Subscribe {
        doc: DocKey,
    },
    Unsubscribe {
        doc: DocKey,
    },
    RegistryAction {
        action: RegistryAction,
    },
    ListAction {
        list_id: ListId,
        action: ListAction,
    },
    BulletinAction {
        action: BulletinAction,
    },
    Sync {
        doc: DocKey,
        data: String,
    },
    RequestFullState {
        #[serde(default)]
        doc: Option<DocKey>,
    },
}

impl ClientMsg {
    /// Rate-limit cost of handling this frame.
    fn cost(&self) -> f64 {
        match self {
            ClientMsg::RegistryAction { .. }
            | ClientMsg::ListAction { .. }
            | ClientMsg::BulletinAction { .. } => 1.0,
            ClientMsg::Sync { .. } => 0.25,
            _ => 0.0,
        }
    }
}

/// A message sent to a client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    Welcome { user_id: UserId },
    Snapshot { doc: DocKey, state: Snapshot },
    Sync { doc: DocKey, data: String },
    Error { code: ErrorCode, message: String },
}

/// Token bucket limiting how fast one connection may submit work.
struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    const CAPACITY: f64 = 40.0;
    const REFILL_PER_SEC: f64 = 20.0;

    fn new() -> Self {
        Self {
            tokens: Self::CAPACITY,
            last: Instant::now(),
        }
    }

    fn take(&mut self, cost: f64) -> bool {
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * Self::REFILL_PER_SEC;
        self.tokens = (self.tokens + refill).min(Self::CAPACITY);
        self.last = now;
        if cost <= 0.0 {
            return true;
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// One subscription of a connection to a document.
pub(crate) struct Subscription {
    /// Sync bookkeeping for this peer. The registry is action-only and
    /// carries no sync state.
    sync: Option<automerge::sync::State>,
}

impl Subscription {
    fn for_key(key: &DocKey) -> Self {
        let sync = match key {
            DocKey::Registry => None,
            _ => Some(automerge::sync::State::new()),
        };
        Self { sync }
    }
}

/// Connection state held in the shared connection registry.
pub(crate) struct Conn {
    pub(crate) user: UserId,
    pub(crate) tx: mpsc::UnboundedSender<ServerMsg>,
    pub(crate) subs: HashMap<DocKey, Subscription>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    username: Option<String>,
}

/// Handler for the `/ws` endpoint.
pub(crate) async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    let user = identify(
        query.username.as_deref(),
        bearer
            .as_ref()
            .map(|TypedHeader(Authorization(b))| b.token()),
    );
    ws.on_upgrade(move |socket| handle_socket(state, socket, user))
}

/// Reduce the upgrade request to a user identity.
///
/// This is deliberately a stub: a valid `username` query parameter
/// wins, a bearer token is reduced to a hash, anyone else is
/// anonymous.
fn identify(username: Option<&str>, bearer: Option<&str>) -> UserId {
    if let Some(name) = username
        && let Some(user) = UserId::from_username(name)
    {
        return user;
    }
    if let Some(token) = bearer {
        return UserId::from_token(token);
    }
    UserId::anonymous()
}

async fn handle_socket(state: Arc<ServerState>, socket: WebSocket, user: UserId) {
    let conn_id = state.next_conn_id();
    info!("connection {conn_id} open for {user}");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMsg>();

    // Register with the auto-subscriptions and queue the greeting under
    // the lock, so the first snapshots reflect one consistent state.
    {
        let mut guard = state.shared.lock().await;
        let shared = &mut *guard;
        let mut conn = Conn {
            user: user.clone(),
            tx: tx.clone(),
            subs: HashMap::new(),
        };
        let _ = conn.tx.send(ServerMsg::Welcome {
            user_id: user.clone(),
        });
        for key in [DocKey::Registry, DocKey::Bulletins] {
            conn.subs.insert(key.clone(), Subscription::for_key(&key));
            if let Err(e) = send_doc_to_conn(&mut shared.docs, &mut conn, &key) {
                error!("initial snapshot for {key} failed: {e:#}");
            }
        }
        shared.conns.insert(conn_id, conn);
    }

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to serialize frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut bucket = TokenBucket::new();
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("socket error on connection {conn_id}: {e}");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                handle_frame(&state, conn_id, &user, &mut bucket, text.as_str(), &tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Dropping the connection releases all its subscriptions.
    state.shared.lock().await.conns.remove(&conn_id);
    drop(tx);
    let _ = writer.await;
    info!("connection {conn_id} closed");
}

async fn handle_frame(
    state: &Arc<ServerState>,
    conn_id: u64,
    user: &UserId,
    bucket: &mut TokenBucket,
    text: &str,
    tx: &mpsc::UnboundedSender<ServerMsg>,
) {
    let msg: ClientMsg = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = tx.send(ServerMsg::Error {
                code: ErrorCode::BadRequest,
                message: format!("invalid frame: {e}"),
            });
            return;
        }
    };
    // Rejected frames are dropped without counting against the bucket.
    if !bucket.take(msg.cost()) {
        let _ = tx.send(ServerMsg::Error {
            code: ErrorCode::RateLimited,
            message: "rate limit exceeded".into(),
        });
        return;
    }
    if let Err(e) = dispatch(state, conn_id, user, msg).await {
        if let ActionError::Internal(inner) = &e {
            error!("internal error handling frame: {inner:#}");
        }
        let _ = tx.send(ServerMsg::Error {
            code: e.code(),
            message: e.to_string(),
        });
    }
}

async fn dispatch(
    state: &Arc<ServerState>,
    conn_id: u64,
    user: &UserId,
    msg: ClientMsg,
) -> Result<(), ActionError> {
    match msg {
        ClientMsg::Hello { client_version } => {
            info!("hello from {user} (client {client_version})");
            Ok(())
        }
        ClientMsg::Subscribe { doc } => subscribe(state, conn_id, user, doc).await,
        ClientMsg::Unsubscribe { doc } => {
            let mut shared = state.shared.lock().await;
            if let Some(conn) = shared.conns.get_mut(&conn_id) {
                conn.subs.remove(&doc);
            }
            Ok(())
        }
        ClientMsg::RegistryAction { action } => handle_registry_action(state, user, action).await,
        ClientMsg::ListAction { list_id, action } => {
            handle_list_action(state, user, list_id, action).await
        }
        ClientMsg::BulletinAction { action } => handle_bulletin_action(state, user, action).await,
        ClientMsg::Sync { doc, data } => handle_sync(state, conn_id, doc, data).await,
        ClientMsg::RequestFullState { doc } => {
            handle_request_full_state(state, conn_id, doc).await
        }
    }
}

async fn subscribe(
    state: &Arc<ServerState>,
    conn_id: u64,
    user: &UserId,
    key: DocKey,
) -> Result<(), ActionError> {
    if let DocKey::List(list_id) = &key {
        // Authorize against the registry before touching storage.
        {
            let shared = state.shared.lock().await;
            check_list_visible(&shared, list_id, user)?;
        }
        if !state.ensure_list_doc(list_id).await? {
            return Err(ActionError::NotFound("list not found".into()));
        }
    }

    let mut guard = state.shared.lock().await;
    // The entry may have changed while the document was loading.
    if let DocKey::List(list_id) = &key {
        check_list_visible(&guard, list_id, user)?;
    }
    let Shared { docs, conns } = &mut *guard;
    let Some(conn) = conns.get_mut(&conn_id) else {
        return Ok(());
    };
    conn.subs.insert(key.clone(), Subscription::for_key(&key));
    send_doc_to_conn(docs, conn, &key)?;
    Ok(())
}

fn check_list_visible(
    shared: &Shared,
    list_id: &ListId,
    user: &UserId,
) -> Result<(), ActionError> {
    let registry = shared
        .docs
        .get(&DocKey::Registry)
        .ok_or_else(|| ActionError::Internal(anyhow!("registry not loaded")))?;
    let entry = model::entry_by_id(&registry.doc, list_id)?
        .ok_or_else(|| ActionError::NotFound("list not found".into()))?;
    if !access::visible_to(&entry, user) {
        return Err(ActionError::Forbidden(
            "not allowed to view this list".into(),
        ));
    }
    Ok(())
}

async fn handle_registry_action(
    state: &Arc<ServerState>,
    user: &UserId,
    action: RegistryAction,
) -> Result<(), ActionError> {
    let now = model::now_iso();
    let mut deleted_blob = None;
    {
        let mut guard = state.shared.lock().await;
        let shared = &mut *guard;
        let registry = shared
            .docs
            .get_mut(&DocKey::Registry)
            .ok_or_else(|| ActionError::Internal(anyhow!("registry not loaded")))?;
        let effect = actions::apply_registry_action(&mut registry.doc, user, &action, &now)?;
        registry.mark_dirty();

        match &effect {
            RegistryEffect::Created(id) => {
                let key = DocKey::List(id.clone());
                let doc = crate::doc::empty(&key)?;
                shared.docs.insert(key, DocState::fresh(doc));
            }
            RegistryEffect::Deleted(id) => {
                let key = DocKey::List(id.clone());
                shared.docs.remove(&key);
                for conn in shared.conns.values_mut() {
                    conn.subs.remove(&key);
                }
                deleted_blob = Some(key);
            }
            RegistryEffect::AccessChanged(id) => {
                let key = DocKey::List(id.clone());
                let entry = match shared.docs.get(&DocKey::Registry) {
                    Some(registry) => model::entry_by_id(&registry.doc, id)?,
                    None => None,
                };
                if let Some(entry) = entry {
                    // Revoked users must not keep receiving this list.
                    for conn in shared.conns.values_mut() {
                        if conn.subs.contains_key(&key) && !access::visible_to(&entry, &conn.user)
                        {
                            conn.subs.remove(&key);
                        }
                    }
                }
            }
            RegistryEffect::Updated(_) => {}
        }
        broadcast(shared, &DocKey::Registry);
    }
    if let Some(key) = deleted_blob
        && let Err(e) = state.store.delete(&key).await
    {
        error!("failed to delete blob for {key}: {e:#}");
    }
    Ok(())
}

async fn handle_list_action(
    state: &Arc<ServerState>,
    user: &UserId,
    list_id: ListId,
    action: ListAction,
) -> Result<(), ActionError> {
    let now = model::now_iso();
    let key = DocKey::List(list_id.clone());

    // Existence check gates the lazy load; authorization is re-checked
    // by the action against the entry read under the final lock.
    {
        let shared = state.shared.lock().await;
        let registry = shared
            .docs
            .get(&DocKey::Registry)
            .ok_or_else(|| ActionError::Internal(anyhow!("registry not loaded")))?;
        if model::entry_by_id(&registry.doc, &list_id)?.is_none() {
            return Err(ActionError::NotFound("list not found".into()));
        }
    }
    if !state.ensure_list_doc(&list_id).await? {
        return Err(ActionError::NotFound("list not found".into()));
    }

    let mut guard = state.shared.lock().await;
    let shared = &mut *guard;
    let registry = shared
        .docs
        .get(&DocKey::Registry)
        .ok_or_else(|| ActionError::Internal(anyhow!("registry not loaded")))?;
    let entry = model::entry_by_id(&registry.doc, &list_id)?
        .ok_or_else(|| ActionError::NotFound("list not found".into()))?;
    let doc_state = shared
        .docs
        .get_mut(&key)
        .ok_or_else(|| ActionError::Internal(anyhow!("list document not loaded")))?;
    actions::apply_list_action(&mut doc_state.doc, &entry, user, &action, &now)?;
    doc_state.mark_dirty();

    let registry = shared
        .docs
        .get_mut(&DocKey::Registry)
        .ok_or_else(|| ActionError::Internal(anyhow!("registry not loaded")))?;
    actions::touch_entry(&mut registry.doc, &list_id, &now)?;
    registry.mark_dirty();

    broadcast(shared, &key);
    broadcast(shared, &DocKey::Registry);
    Ok(())
}

async fn handle_bulletin_action(
    state: &Arc<ServerState>,
    user: &UserId,
    action: BulletinAction,
) -> Result<(), ActionError> {
    let now = model::now_iso();
    let mut guard = state.shared.lock().await;
    let shared = &mut *guard;
    let doc_state = shared
        .docs
        .get_mut(&DocKey::Bulletins)
        .ok_or_else(|| ActionError::Internal(anyhow!("bulletins not loaded")))?;
    actions::apply_bulletin_action(&mut doc_state.doc, user, &action, &now)?;
    doc_state.mark_dirty();
    broadcast(shared, &DocKey::Bulletins);
    Ok(())
}

async fn handle_sync(
    state: &Arc<ServerState>,
    conn_id: u64,
    key: DocKey,
    data: String,
) -> Result<(), ActionError> {
    if key == DocKey::Registry {
        return Err(ActionError::BadRequest(
            "registry sync not supported".into(),
        ));
    }
    let mut guard = state.shared.lock().await;
    {
        let Shared { docs, conns } = &mut *guard;
        let conn = conns
            .get_mut(&conn_id)
            .ok_or_else(|| ActionError::Internal(anyhow!("connection not registered")))?;
        let sub = conn
            .subs
            .get_mut(&key)
            .ok_or_else(|| ActionError::BadRequest("not subscribed to document".into()))?;
        let sync_state = sub
            .sync
            .as_mut()
            .ok_or_else(|| ActionError::BadRequest("document does not sync".into()))?;
        let doc_state = docs
            .get_mut(&key)
            .ok_or_else(|| ActionError::Internal(anyhow!("document not loaded")))?;
        sync::receive(&mut doc_state.doc, sync_state, &data)
            .map_err(|e| ActionError::BadRequest(e.to_string()))?;
        doc_state.mark_dirty();
    }
    broadcast(&mut guard, &key);
    Ok(())
}

async fn handle_request_full_state(
    state: &Arc<ServerState>,
    conn_id: u64,
    key: Option<DocKey>,
) -> Result<(), ActionError> {
    let mut guard = state.shared.lock().await;
    let Shared { docs, conns } = &mut *guard;
    let Some(conn) = conns.get_mut(&conn_id) else {
        return Ok(());
    };
    let keys = match key {
        Some(key) => {
            if !conn.subs.contains_key(&key) {
                return Err(ActionError::BadRequest("not subscribed to document".into()));
            }
            vec![key]
        }
        None => conn.subs.keys().cloned().collect(),
    };
    for key in keys {
        let doc_state = docs
            .get(&key)
            .ok_or_else(|| ActionError::Internal(anyhow!("document {key} not loaded")))?;
        let snapshot = project::snapshot_for(&doc_state.doc, &key, &conn.user)?;
        let _ = conn.tx.send(ServerMsg::Snapshot {
            doc: key,
            state: snapshot,
        });
    }
    Ok(())
}

/// Send (snapshot, outbound sync until quiescent) for one document to
/// one connection.
fn send_doc_to_conn(
    docs: &mut HashMap<DocKey, DocState>,
    conn: &mut Conn,
    key: &DocKey,
) -> anyhow::Result<()> {
    let doc_state = docs
        .get_mut(key)
        .ok_or_else(|| anyhow!("document {key} is not loaded"))?;
    let snapshot = project::snapshot_for(&doc_state.doc, key, &conn.user)?;
    let _ = conn.tx.send(ServerMsg::Snapshot {
        doc: key.clone(),
        state: snapshot,
    });
    if let Some(sub) = conn.subs.get_mut(key)
        && let Some(sync_state) = sub.sync.as_mut()
    {
        for data in sync::generate(&mut doc_state.doc, sync_state) {
            let _ = conn.tx.send(ServerMsg::Sync {
                doc: key.clone(),
                data,
            });
        }
    }
    Ok(())
}

/// After a mutation of `key`, fan out to every subscribed connection:
/// a fresh privacy-filtered snapshot, then the outbound sync loop.
pub(crate) fn broadcast(shared: &mut Shared, key: &DocKey) {
    let Shared { docs, conns } = shared;
    let Some(doc_state) = docs.get_mut(key) else {
        return;
    };
    for conn in conns.values_mut() {
        let Some(sub) = conn.subs.get_mut(key) else {
            continue;
        };
        match project::snapshot_for(&doc_state.doc, key, &conn.user) {
            Ok(snapshot) => {
                let _ = conn.tx.send(ServerMsg::Snapshot {
                    doc: key.clone(),
                    state: snapshot,
                });
            }
            Err(e) => {
                error!("failed to project {key}: {e:#}");
                continue;
            }
        }
        if let Some(sync_state) = sub.sync.as_mut() {
            for data in sync::generate(&mut doc_state.doc, sync_state) {
                let _ = conn.tx.send(ServerMsg::Sync {
                    doc: key.clone(),
                    data,
                });
            }
        }
    }
}
