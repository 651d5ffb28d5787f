//! Identifier newtypes for users, lists, items, and bulletins.

use std::fmt;
use std::str::FromStr;

use rand::random;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Longest identifier accepted over the wire, in bytes.
const MAX_LEN: usize = 64;

fn valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

fn validate(s: &str) -> anyhow::Result<()> {
    if s.is_empty() || s.len() > MAX_LEN {
        anyhow::bail!("identifier length must be between 1 and {MAX_LEN}");
    }
    if !s.chars().all(valid_char) {
        anyhow::bail!("identifier contains invalid characters");
    }
    Ok(())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
        impl FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate(s)?;
                Ok(Self(s.to_string()))
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }
        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

opaque_id! {
    /// Identity of a connected user, as derived during the WebSocket upgrade.
    UserId
}
opaque_id! {
    /// Server-assigned identifier of a collaborative list.
    ListId
}
opaque_id! {
    /// Server-assigned identifier of an item within a list.
    ItemId
}
opaque_id! {
    /// Server-assigned identifier of a bulletin.
    BulletinId
}

impl UserId {
    /// Derive an identity from a client-supplied username, if it is valid.
    ///
    /// Usernames are constrained to `^[a-z0-9_-]{1,32}$`.
    pub fn from_username(name: &str) -> Option<Self> {
        let valid = (1..=32).contains(&name.len())
            && name
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'));
        valid.then(|| Self(format!("user-{name}")))
    }

    /// Derive an identity from a bearer token.
    pub fn from_token(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        Self(format!(
            "user-{:02x}{:02x}{:02x}{:02x}",
            digest[0], digest[1], digest[2], digest[3]
        ))
    }

    /// Fresh anonymous identity.
    pub fn anonymous() -> Self {
        Self(format!("anon-{:08x}", random::<u32>()))
    }
}

impl ListId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
impl ItemId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
impl BulletinId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
