//! Privacy-filtered snapshot projection.
//!
//! Snapshots are plain-JSON views of the documents, filtered for the
//! viewing user. They are what clients render; the binary sync stream
//! carries the full CRDT and is gated at subscribe time instead.

use anyhow::Result;
use automerge::AutoCommit;
use serde::Serialize;

use crate::access::visible_to;
use crate::doc::DocKey;
use crate::ids::{ListId, UserId};
use crate::model::{self, Bulletin, ListEntry, Item, Visibility};

/// Projection of a list document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshot {
    pub list_id: ListId,
    pub items: Vec<Item>,
}

/// A privacy-filtered projection of one document.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    Registry(Vec<ListEntry>),
    Bulletins(Vec<Bulletin>),
    List(ListSnapshot),
}

/// Registry entries visible to `viewer`.
pub fn registry_snapshot(doc: &AutoCommit, viewer: &UserId) -> Result<Snapshot> {
    let entries = model::read_entries(doc)?
        .into_iter()
        .filter(|e| visible_to(e, viewer))
        .collect();
    Ok(Snapshot::Registry(entries))
}

/// Bulletins visible to `viewer`: public posts plus the viewer's own.
pub fn bulletins_snapshot(doc: &AutoCommit, viewer: &UserId) -> Result<Snapshot> {
    let bulletins = model::read_bulletins(doc)?
        .into_iter()
        .filter(|b| b.visibility == Visibility::Public || b.author_id == *viewer)
        .collect();
    Ok(Snapshot::Bulletins(bulletins))
}

/// Projection of a list document. Authorization happened at subscribe.
pub fn list_snapshot(doc: &AutoCommit, list_id: &ListId) -> Result<Snapshot> {
    Ok(Snapshot::List(ListSnapshot {
        list_id: model::read_list_id(doc).unwrap_or_else(|| list_id.clone()),
        items: model::read_items(doc)?,
    }))
}

/// Project `doc` (stored under `key`) for `viewer`.
pub fn snapshot_for(doc: &AutoCommit, key: &DocKey, viewer: &UserId) -> Result<Snapshot> {
    match key {
        DocKey::Registry => registry_snapshot(doc, viewer),
        DocKey::Bulletins => bulletins_snapshot(doc, viewer),
        DocKey::List(id) => list_snapshot(doc, id),
    }
}
