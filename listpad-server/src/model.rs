//! Plain-data views of the CRDT documents.
//!
//! The wire snapshots and the domain actions both work in terms of
//! these structs; collaborative-text fields are rendered to plain
//! strings when decoding.

use anyhow::Result;
use automerge::{AutoCommit, ObjId, ObjType, ROOT, ReadDoc, Value};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::doc;
use crate::ids::{BulletinId, ItemId, ListId, UserId};

/// Longest name/label and plain optional string, in characters.
pub const MAX_SHORT_TEXT: usize = 200;
/// Longest notes and bulletin text, in characters.
pub const MAX_LONG_TEXT: usize = 2000;
/// Most owned non-archived lists per user.
pub const MAX_OWNED_LISTS: usize = 200;
/// Most items per list.
pub const MAX_ITEMS_PER_LIST: usize = 1000;

/// Who may see a list or bulletin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Every signed-in user.
    Public,
    /// Owner and explicit collaborators (lists), or the author (bulletins).
    Private,
}

impl Visibility {
    fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// Registry entry describing one collaborative list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub id: ListId,
    pub owner_id: UserId,
    pub name: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub visibility: Visibility,
    pub collaborators: Vec<UserId>,
    pub archived: bool,
}

/// One item of a list document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub label: String,
    pub created_at: String,
    pub added_by: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub checked: bool,
}

/// One bulletin-board post.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bulletin {
    pub id: BulletinId,
    pub author_id: UserId,
    pub text: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    pub visibility: Visibility,
}

/// Current wall clock as ISO-8601 UTC. Cosmetic only; the CRDT
/// resolves ordering between concurrent edits.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_visibility(s: &str) -> Visibility {
    match s {
        "private" => Visibility::Private,
        _ => Visibility::Public,
    }
}

pub(crate) fn visibility_str(v: Visibility) -> &'static str {
    v.as_str()
}

fn read_entry(doc: &AutoCommit, obj: &ObjId) -> Option<ListEntry> {
    Some(ListEntry {
        id: ListId::from(doc::get_str(doc, obj, "id")?),
        owner_id: UserId::from(doc::get_str(doc, obj, "ownerId")?),
        name: doc::get_text(doc, obj, "name")?,
        created_at: doc::get_str(doc, obj, "createdAt")?,
        updated_at: doc::get_str(doc, obj, "updatedAt"),
        visibility: parse_visibility(&doc::get_str(doc, obj, "visibility")?),
        collaborators: doc::get_str_seq(doc, obj, "collaborators")
            .into_iter()
            .map(UserId::from)
            .collect(),
        archived: doc::get_bool(doc, obj, "archived").unwrap_or(false),
    })
}

fn read_item(doc: &AutoCommit, obj: &ObjId) -> Option<Item> {
    Some(Item {
        id: ItemId::from(doc::get_str(doc, obj, "id")?),
        label: doc::get_text(doc, obj, "label")?,
        created_at: doc::get_str(doc, obj, "createdAt")?,
        added_by: UserId::from(doc::get_str(doc, obj, "addedBy")?),
        quantity: doc::get_str(doc, obj, "quantity"),
        vendor: doc::get_str(doc, obj, "vendor"),
        notes: doc::get_text(doc, obj, "notes"),
        checked: doc::get_bool(doc, obj, "checked").unwrap_or(false),
    })
}

fn read_bulletin(doc: &AutoCommit, obj: &ObjId) -> Option<Bulletin> {
    Some(Bulletin {
        id: BulletinId::from(doc::get_str(doc, obj, "id")?),
        author_id: UserId::from(doc::get_str(doc, obj, "authorId")?),
        text: doc::get_text(doc, obj, "text")?,
        created_at: doc::get_str(doc, obj, "createdAt")?,
        edited_at: doc::get_str(doc, obj, "editedAt"),
        visibility: parse_visibility(&doc::get_str(doc, obj, "visibility")?),
    })
}

/// Map elements of a sequence, paired with their true sequence index.
/// Anything that is not a map (which only a misbehaving peer could
/// have synced in) is skipped.
fn map_elements(doc: &AutoCommit, seq: &ObjId) -> Vec<(usize, ObjId)> {
    let mut out = Vec::new();
    for i in 0..doc.length(seq) {
        if let Ok(Some((Value::Object(ObjType::Map), obj))) = doc.get(seq, i) {
            out.push((i, obj));
        }
    }
    out
}

/// All registry entries, in document order.
pub fn read_entries(doc: &AutoCommit) -> Result<Vec<ListEntry>> {
    let lists = doc::root_seq(doc, "lists")?;
    Ok(map_elements(doc, &lists)
        .iter()
        .filter_map(|(_, obj)| read_entry(doc, obj))
        .collect())
}

/// All items of a list document, in document order.
pub fn read_items(doc: &AutoCommit) -> Result<Vec<Item>> {
    let items = doc::root_seq(doc, "items")?;
    Ok(map_elements(doc, &items)
        .iter()
        .filter_map(|(_, obj)| read_item(doc, obj))
        .collect())
}

/// All bulletins, in document order.
pub fn read_bulletins(doc: &AutoCommit) -> Result<Vec<Bulletin>> {
    let bulletins = doc::root_seq(doc, "bulletins")?;
    Ok(map_elements(doc, &bulletins)
        .iter()
        .filter_map(|(_, obj)| read_bulletin(doc, obj))
        .collect())
}

/// The `listId` a list document claims to be.
pub fn read_list_id(doc: &AutoCommit) -> Option<ListId> {
    doc::get_str(doc, &ROOT, "listId").map(ListId::from)
}

/// Locate a registry entry by list id, returning its sequence index
/// and map object.
pub fn find_entry(doc: &AutoCommit, id: &ListId) -> Result<Option<(usize, ObjId)>> {
    let lists = doc::root_seq(doc, "lists")?;
    for (i, obj) in map_elements(doc, &lists) {
        if doc::get_str(doc, &obj, "id").as_deref() == Some(id.as_str()) {
            return Ok(Some((i, obj)));
        }
    }
    Ok(None)
}

/// Locate an item by id, returning its sequence index and map object.
pub fn find_item(doc: &AutoCommit, id: &ItemId) -> Result<Option<(usize, ObjId)>> {
    let items = doc::root_seq(doc, "items")?;
    for (i, obj) in map_elements(doc, &items) {
        if doc::get_str(doc, &obj, "id").as_deref() == Some(id.as_str()) {
            return Ok(Some((i, obj)));
        }
    }
    Ok(None)
}

/// Locate a bulletin by id, returning its sequence index and map object.
pub fn find_bulletin(doc: &AutoCommit, id: &BulletinId) -> Result<Option<(usize, ObjId)>> {
    let bulletins = doc::root_seq(doc, "bulletins")?;
    for (i, obj) in map_elements(doc, &bulletins) {
        if doc::get_str(doc, &obj, "id").as_deref() == Some(id.as_str()) {
            return Ok(Some((i, obj)));
        }
    }
    Ok(None)
}

/// A registry entry cloned out of the document for authorization
/// checks while the document itself is being mutated.
pub fn entry_by_id(doc: &AutoCommit, id: &ListId) -> Result<Option<ListEntry>> {
    match find_entry(doc, id)? {
        Some((_, obj)) => Ok(read_entry(doc, &obj)),
        None => Ok(None),
    }
}

pub(crate) fn entry_from_obj(doc: &AutoCommit, obj: &ObjId) -> Option<ListEntry> {
    read_entry(doc, obj)
}
