//! Domain actions: validated server-side mutations of the documents.
//!
//! Each action validates its payload, checks authorization against the
//! registry entry, and applies all of its mutations as one CRDT
//! change. Failures are typed and map onto the stable wire error
//! codes.

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ReadDoc, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access;
use crate::doc;
use crate::ids::{BulletinId, ItemId, ListId, UserId};
use crate::model::{
    self, ListEntry, MAX_ITEMS_PER_LIST, MAX_LONG_TEXT, MAX_OWNED_LISTS, MAX_SHORT_TEXT,
    Visibility, visibility_str,
};

/// Stable error codes reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Forbidden,
    NotFound,
    RateLimited,
}

/// Failure of a domain action or of frame handling.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ActionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ActionError::BadRequest(_) | ActionError::Internal(_) => ErrorCode::BadRequest,
            ActionError::Forbidden(_) => ErrorCode::Forbidden,
            ActionError::NotFound(_) => ErrorCode::NotFound,
        }
    }
}

impl From<automerge::AutomergeError> for ActionError {
    fn from(e: automerge::AutomergeError) -> Self {
        ActionError::Internal(e.into())
    }
}

/// Mutations of the list registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RegistryAction {
    CreateList {
        name: String,
        #[serde(default)]
        visibility: Option<Visibility>,
    },
    RenameList {
        list_id: ListId,
        name: String,
    },
    UpdateListVisibility {
        list_id: ListId,
        visibility: Visibility,
    },
    SetCollaborators {
        list_id: ListId,
        collaborators: Vec<UserId>,
    },
    ArchiveList {
        list_id: ListId,
    },
    RestoreList {
        list_id: ListId,
    },
    DeleteList {
        list_id: ListId,
    },
}

/// Mutations of a single list document.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ListAction {
    AddItem {
        label: String,
        #[serde(default)]
        quantity: Option<String>,
        #[serde(default)]
        vendor: Option<String>,
    },
    UpdateItem {
        item_id: ItemId,
        label: String,
    },
    SetItemQuantity {
        item_id: ItemId,
        #[serde(default)]
        quantity: Option<String>,
    },
    SetItemVendor {
        item_id: ItemId,
        #[serde(default)]
        vendor: Option<String>,
    },
    SetItemNotes {
        item_id: ItemId,
        #[serde(default)]
        notes: Option<String>,
    },
    ToggleItemChecked {
        item_id: ItemId,
        checked: bool,
    },
    RemoveItem {
        item_id: ItemId,
    },
}

/// Mutations of the bulletin board.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BulletinAction {
    AddBulletin {
        text: String,
        #[serde(default)]
        visibility: Option<Visibility>,
    },
    EditBulletin {
        bulletin_id: BulletinId,
        text: String,
    },
    DeleteBulletin {
        bulletin_id: BulletinId,
    },
}

/// What a registry action did, as far as the session layer cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEffect {
    /// A new list was created; its document must be created too.
    Created(ListId),
    /// An entry changed without affecting who may see the list.
    Updated(ListId),
    /// The audience of the list may have shrunk.
    AccessChanged(ListId),
    /// The entry is gone; cache and blob must go with it.
    Deleted(ListId),
}

fn required_text(field: &str, value: &str, max: usize) -> Result<String, ActionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ActionError::BadRequest(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max {
        return Err(ActionError::BadRequest(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn optional_text(
    field: &str,
    value: Option<&str>,
    max: usize,
) -> Result<Option<String>, ActionError> {
    let Some(value) = value else { return Ok(None) };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > max {
        return Err(ActionError::BadRequest(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn owned_entry(
    doc: &AutoCommit,
    caller: &UserId,
    id: &ListId,
) -> Result<(usize, ObjId, ListEntry), ActionError> {
    let Some((idx, obj)) = model::find_entry(doc, id)? else {
        return Err(ActionError::NotFound("list not found".into()));
    };
    let entry = model::entry_from_obj(doc, &obj)
        .ok_or_else(|| ActionError::Internal(anyhow::anyhow!("malformed registry entry")))?;
    if entry.owner_id != *caller {
        return Err(ActionError::Forbidden(
            "only the owner may change this list".into(),
        ));
    }
    Ok((idx, obj, entry))
}

/// Apply a registry action for `caller`, returning what happened.
pub fn apply_registry_action(
    doc: &mut AutoCommit,
    caller: &UserId,
    action: &RegistryAction,
    now: &str,
) -> Result<RegistryEffect, ActionError> {
    match action {
        RegistryAction::CreateList { name, visibility } => {
            let name = required_text("name", name, MAX_SHORT_TEXT)?;
            let owned = model::read_entries(doc)?
                .iter()
                .filter(|e| e.owner_id == *caller && !e.archived)
                .count();
            if owned >= MAX_OWNED_LISTS {
                return Err(ActionError::BadRequest(format!(
                    "a user may own at most {MAX_OWNED_LISTS} lists"
                )));
            }
            let id = ListId::fresh();
            let lists = doc::root_seq(doc, "lists")?;
            let entry = doc.insert_object(&lists, doc.length(&lists), ObjType::Map)?;
            doc.put(&entry, "id", id.as_str())?;
            doc.put(&entry, "ownerId", caller.as_str())?;
            doc.put(&entry, "createdAt", now)?;
            doc.put(
                &entry,
                "visibility",
                visibility_str(visibility.unwrap_or(Visibility::Private)),
            )?;
            doc.put(&entry, "archived", false)?;
            doc.put_object(&entry, "collaborators", ObjType::List)?;
            doc::set_text(doc, &entry, "name", &name)?;
            Ok(RegistryEffect::Created(id))
        }
        RegistryAction::RenameList { list_id, name } => {
            let name = required_text("name", name, MAX_SHORT_TEXT)?;
            let (_, obj, _) = owned_entry(doc, caller, list_id)?;
            doc::set_text(doc, &obj, "name", &name)?;
            doc.put(&obj, "updatedAt", now)?;
            Ok(RegistryEffect::Updated(list_id.clone()))
        }
        RegistryAction::UpdateListVisibility {
            list_id,
            visibility,
        } => {
            let (_, obj, _) = owned_entry(doc, caller, list_id)?;
            doc.put(&obj, "visibility", visibility_str(*visibility))?;
            doc.put(&obj, "updatedAt", now)?;
            Ok(RegistryEffect::AccessChanged(list_id.clone()))
        }
        RegistryAction::SetCollaborators {
            list_id,
            collaborators,
        } => {
            let (_, obj, entry) = owned_entry(doc, caller, list_id)?;
            let mut cleaned: Vec<&UserId> = Vec::new();
            for c in collaborators {
                if *c != entry.owner_id && !cleaned.contains(&c) {
                    cleaned.push(c);
                }
            }
            let seq = match doc.get(&obj, "collaborators")? {
                Some((Value::Object(ObjType::List), id)) => id,
                _ => doc.put_object(&obj, "collaborators", ObjType::List)?,
            };
            for _ in 0..doc.length(&seq) {
                doc.delete(&seq, 0)?;
            }
            for (i, c) in cleaned.iter().enumerate() {
                doc.insert(&seq, i, c.as_str())?;
            }
            doc.put(&obj, "updatedAt", now)?;
            Ok(RegistryEffect::AccessChanged(list_id.clone()))
        }
        RegistryAction::ArchiveList { list_id } => {
            let (_, obj, _) = owned_entry(doc, caller, list_id)?;
            doc.put(&obj, "archived", true)?;
            doc.put(&obj, "updatedAt", now)?;
            Ok(RegistryEffect::Updated(list_id.clone()))
        }
        RegistryAction::RestoreList { list_id } => {
            let (_, obj, _) = owned_entry(doc, caller, list_id)?;
            doc.put(&obj, "archived", false)?;
            doc.put(&obj, "updatedAt", now)?;
            Ok(RegistryEffect::Updated(list_id.clone()))
        }
        RegistryAction::DeleteList { list_id } => {
            let (idx, _, _) = owned_entry(doc, caller, list_id)?;
            let lists = doc::root_seq(doc, "lists")?;
            doc.delete(&lists, idx)?;
            Ok(RegistryEffect::Deleted(list_id.clone()))
        }
    }
}

/// Refresh a registry entry's `updatedAt` after one of its list's
/// items changed.
pub fn touch_entry(doc: &mut AutoCommit, list_id: &ListId, now: &str) -> Result<(), ActionError> {
    if let Some((_, obj)) = model::find_entry(doc, list_id)? {
        doc.put(&obj, "updatedAt", now)?;
    }
    Ok(())
}

/// Apply a list action for `caller` against the list document whose
/// registry entry is `entry`.
pub fn apply_list_action(
    doc: &mut AutoCommit,
    entry: &ListEntry,
    caller: &UserId,
    action: &ListAction,
    now: &str,
) -> Result<(), ActionError> {
    if !access::editable_to(entry, caller) {
        return Err(if entry.archived {
            ActionError::Forbidden("list is archived".into())
        } else {
            ActionError::Forbidden("not allowed to edit this list".into())
        });
    }
    match action {
        ListAction::AddItem {
            label,
            quantity,
            vendor,
        } => {
            let label = required_text("label", label, MAX_SHORT_TEXT)?;
            let quantity = optional_text("quantity", quantity.as_deref(), MAX_SHORT_TEXT)?;
            let vendor = optional_text("vendor", vendor.as_deref(), MAX_SHORT_TEXT)?;
            let items = doc::root_seq(doc, "items")?;
            if doc.length(&items) >= MAX_ITEMS_PER_LIST {
                return Err(ActionError::BadRequest(format!(
                    "a list may hold at most {MAX_ITEMS_PER_LIST} items"
                )));
            }
            let item = doc.insert_object(&items, doc.length(&items), ObjType::Map)?;
            doc.put(&item, "id", ItemId::fresh().as_str())?;
            doc.put(&item, "createdAt", now)?;
            doc.put(&item, "addedBy", caller.as_str())?;
            doc.put(&item, "checked", false)?;
            if let Some(q) = &quantity {
                doc.put(&item, "quantity", q.as_str())?;
            }
            if let Some(v) = &vendor {
                doc.put(&item, "vendor", v.as_str())?;
            }
            doc::set_text(doc, &item, "label", &label)?;
            Ok(())
        }
        ListAction::UpdateItem { item_id, label } => {
            let label = required_text("label", label, MAX_SHORT_TEXT)?;
            let (_, obj) = find_item(doc, item_id)?;
            doc::set_text(doc, &obj, "label", &label)?;
            Ok(())
        }
        ListAction::SetItemQuantity { item_id, quantity } => {
            let quantity = optional_text("quantity", quantity.as_deref(), MAX_SHORT_TEXT)?;
            let (_, obj) = find_item(doc, item_id)?;
            match quantity {
                Some(q) => doc.put(&obj, "quantity", q.as_str())?,
                None => clear_key(doc, &obj, "quantity")?,
            }
            Ok(())
        }
        ListAction::SetItemVendor { item_id, vendor } => {
            let vendor = optional_text("vendor", vendor.as_deref(), MAX_SHORT_TEXT)?;
            let (_, obj) = find_item(doc, item_id)?;
            match vendor {
                Some(v) => doc.put(&obj, "vendor", v.as_str())?,
                None => clear_key(doc, &obj, "vendor")?,
            }
            Ok(())
        }
        ListAction::SetItemNotes { item_id, notes } => {
            let notes = optional_text("notes", notes.as_deref(), MAX_LONG_TEXT)?;
            let (_, obj) = find_item(doc, item_id)?;
            match notes {
                Some(n) => doc::set_text(doc, &obj, "notes", &n)?,
                None => clear_key(doc, &obj, "notes")?,
            }
            Ok(())
        }
        ListAction::ToggleItemChecked { item_id, checked } => {
            let (_, obj) = find_item(doc, item_id)?;
            doc.put(&obj, "checked", *checked)?;
            Ok(())
        }
        ListAction::RemoveItem { item_id } => {
            let (idx, _) = find_item(doc, item_id)?;
            let items = doc::root_seq(doc, "items")?;
            doc.delete(&items, idx)?;
            Ok(())
        }
    }
}

fn find_item(doc: &AutoCommit, id: &ItemId) -> Result<(usize, ObjId), ActionError> {
    model::find_item(doc, id)?.ok_or_else(|| ActionError::NotFound("item not found".into()))
}

fn clear_key(doc: &mut AutoCommit, obj: &ObjId, key: &str) -> Result<(), ActionError> {
    if doc.get(obj, key)?.is_some() {
        doc.delete(obj, key)?;
    }
    Ok(())
}

/// Apply a bulletin action for `caller`.
pub fn apply_bulletin_action(
    doc: &mut AutoCommit,
    caller: &UserId,
    action: &BulletinAction,
    now: &str,
) -> Result<(), ActionError> {
    match action {
        BulletinAction::AddBulletin { text, visibility } => {
            let text = required_text("text", text, MAX_LONG_TEXT)?;
            let bulletins = doc::root_seq(doc, "bulletins")?;
            let bulletin = doc.insert_object(&bulletins, doc.length(&bulletins), ObjType::Map)?;
            doc.put(&bulletin, "id", BulletinId::fresh().as_str())?;
            doc.put(&bulletin, "authorId", caller.as_str())?;
            doc.put(&bulletin, "createdAt", now)?;
            doc.put(
                &bulletin,
                "visibility",
                visibility_str(visibility.unwrap_or(Visibility::Public)),
            )?;
            doc::set_text(doc, &bulletin, "text", &text)?;
            Ok(())
        }
        BulletinAction::EditBulletin { bulletin_id, text } => {
            let text = required_text("text", text, MAX_LONG_TEXT)?;
            let (_, obj) = authored_bulletin(doc, caller, bulletin_id)?;
            doc::set_text(doc, &obj, "text", &text)?;
            doc.put(&obj, "editedAt", now)?;
            Ok(())
        }
        BulletinAction::DeleteBulletin { bulletin_id } => {
            let (idx, _) = authored_bulletin(doc, caller, bulletin_id)?;
            let bulletins = doc::root_seq(doc, "bulletins")?;
            doc.delete(&bulletins, idx)?;
            Ok(())
        }
    }
}

fn authored_bulletin(
    doc: &AutoCommit,
    caller: &UserId,
    id: &BulletinId,
) -> Result<(usize, ObjId), ActionError> {
    let Some((idx, obj)) = model::find_bulletin(doc, id)? else {
        return Err(ActionError::NotFound("bulletin not found".into()));
    };
    if doc::get_str(doc, &obj, "authorId").as_deref() != Some(caller.as_str()) {
        return Err(ActionError::Forbidden(
            "only the author may change this bulletin".into(),
        ));
    }
    Ok((idx, obj))
}
