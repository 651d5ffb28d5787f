//! Access-control predicates over registry entries.

use crate::ids::UserId;
use crate::model::{ListEntry, Visibility};

/// Whether `user` may see the list described by `entry`.
pub fn visible_to(entry: &ListEntry, user: &UserId) -> bool {
    entry.visibility == Visibility::Public
        || entry.owner_id == *user
        || entry.collaborators.contains(user)
}

/// Whether `user` may edit the items of the list described by `entry`.
///
/// Archived lists are read-only for everyone. Any signed-in user may
/// edit a public list's items; private lists follow visibility.
pub fn editable_to(entry: &ListEntry, user: &UserId) -> bool {
    if entry.archived {
        return false;
    }
    entry.visibility == Visibility::Public || visible_to(entry, user)
}
