//! CRDT document handling.
//!
//! The server manages three document kinds, all stored as automerge
//! documents: the list registry, the bulletin board, and one document
//! per list. This module owns the document selector used on the wire
//! and the small set of read/write helpers the rest of the server
//! goes through, so the CRDT surface stays in one place.

use std::fmt;

use anyhow::{Context, Result, anyhow};
use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ROOT, ReadDoc, ScalarValue, Value};
use serde::Deserialize;

use crate::ids::ListId;

/// Selector for one of the server's documents.
///
/// Wire form: the string `"registry"`, the string `"bulletins"`, or an
/// object `{"listId": <id>}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocKey {
    Registry,
    Bulletins,
    List(ListId),
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Registry => f.write_str("registry"),
            DocKey::Bulletins => f.write_str("bulletins"),
            DocKey::List(id) => write!(f, "list/{id}"),
        }
    }
}

impl serde::Serialize for DocKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        match self {
            DocKey::Registry => serializer.serialize_str("registry"),
            DocKey::Bulletins => serializer.serialize_str("bulletins"),
            DocKey::List(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("listId", id)?;
                map.end()
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for DocKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Name(String),
            List {
                #[serde(rename = "listId")]
                list_id: ListId,
            },
        }
        match Wire::deserialize(deserializer)? {
            Wire::Name(s) if s == "registry" => Ok(DocKey::Registry),
            Wire::Name(s) if s == "bulletins" => Ok(DocKey::Bulletins),
            Wire::Name(s) => Err(serde::de::Error::custom(format!(
                "unknown document selector: {s}"
            ))),
            Wire::List { list_id } => Ok(DocKey::List(list_id)),
        }
    }
}

/// Create an empty document of the shape matching `key`.
pub fn empty(key: &DocKey) -> Result<AutoCommit> {
    let mut doc = AutoCommit::new();
    match key {
        DocKey::Registry => {
            doc.put_object(ROOT, "lists", ObjType::List)?;
        }
        DocKey::Bulletins => {
            doc.put_object(ROOT, "bulletins", ObjType::List)?;
        }
        DocKey::List(id) => {
            doc.put(ROOT, "listId", id.as_str())?;
            doc.put_object(ROOT, "items", ObjType::List)?;
        }
    }
    Ok(doc)
}

/// Deserialize a document from its persisted bytes.
pub fn load(key: &DocKey, bytes: &[u8]) -> Result<AutoCommit> {
    AutoCommit::load(bytes).with_context(|| format!("failed to load document {key}"))
}

/// Find the top-level sequence object stored under `key`.
pub fn root_seq(doc: &AutoCommit, key: &str) -> Result<ObjId> {
    match doc.get(ROOT, key)? {
        Some((Value::Object(ObjType::List), id)) => Ok(id),
        _ => Err(anyhow!("document is missing the {key} sequence")),
    }
}

fn scalar_str(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Scalar(s) => match s.as_ref() {
            ScalarValue::Str(s) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Read a plain string property of a map object.
pub fn get_str(doc: &AutoCommit, obj: &ObjId, key: &str) -> Option<String> {
    let (value, _) = doc.get(obj, key).ok()??;
    scalar_str(&value)
}

/// Read a boolean property of a map object.
pub fn get_bool(doc: &AutoCommit, obj: &ObjId, key: &str) -> Option<bool> {
    let (value, _) = doc.get(obj, key).ok()??;
    match value {
        Value::Scalar(s) => match s.as_ref() {
            ScalarValue::Boolean(b) => Some(*b),
            _ => None,
        },
        _ => None,
    }
}

/// Read a collaborative-text property as a plain string.
///
/// Tolerates a plain string where older writers stored one.
pub fn get_text(doc: &AutoCommit, obj: &ObjId, key: &str) -> Option<String> {
    let (value, id) = doc.get(obj, key).ok()??;
    match value {
        Value::Object(ObjType::Text) => doc.text(&id).ok(),
        other => scalar_str(&other),
    }
}

/// Replace the entire content of a collaborative-text property.
///
/// Creates the text object if the property is absent.
pub fn set_text(doc: &mut AutoCommit, obj: &ObjId, key: &str, value: &str) -> Result<()> {
    let text_id = match doc.get(obj, key)? {
        Some((Value::Object(ObjType::Text), id)) => id,
        _ => doc.put_object(obj, key, ObjType::Text)?,
    };
    let existing = doc.length(&text_id);
    doc.splice_text(&text_id, 0, existing as isize, value)?;
    Ok(())
}

/// Read a sequence of strings stored under `key` of a map object.
pub fn get_str_seq(doc: &AutoCommit, obj: &ObjId, key: &str) -> Vec<String> {
    let Ok(Some((Value::Object(ObjType::List), seq))) = doc.get(obj, key) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for i in 0..doc.length(&seq) {
        if let Ok(Some((value, _))) = doc.get(&seq, i)
            && let Some(s) = scalar_str(&value)
        {
            out.push(s);
        }
    }
    out
}
