//! Per-subscription CRDT sync.
//!
//! Sync messages are opaque automerge protocol bytes, base64-encoded
//! on the wire. Each subscription holds its own [`State`]; inbound
//! frames are merged into the authoritative document and the outbound
//! loop drains generated messages until the protocol is quiescent.

use anyhow::{Context, Result};
use automerge::AutoCommit;
use automerge::sync::{Message, State, SyncDoc};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Merge one client sync frame into `doc`.
pub fn receive(doc: &mut AutoCommit, state: &mut State, data: &str) -> Result<()> {
    let bytes = BASE64
        .decode(data)
        .context("sync payload is not valid base64")?;
    let message = Message::decode(&bytes).context("malformed sync message")?;
    doc.sync()
        .receive_sync_message(state, message)
        .context("sync message rejected")?;
    Ok(())
}

/// Drain outbound sync messages for one peer until quiescent.
pub fn generate(doc: &mut AutoCommit, state: &mut State) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(message) = doc.sync().generate_sync_message(state) {
        frames.push(BASE64.encode(message.encode()));
    }
    frames
}
