//! Filesystem persistence for document blobs.
//!
//! Each document is stored as a single opaque CRDT save:
//! `registry.bin`, `bulletins.bin`, and `lists/<listId>.bin` under the
//! storage root. Replacement is atomic: bytes are written to a
//! uniquely named temp sibling and renamed over the target, so no
//! reader or crash observes a torn file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::random;
use tokio::fs;

use crate::doc::DocKey;

/// Blob storage keyed by document identity.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("lists"))
            .await
            .with_context(|| format!("failed to create storage at {}", root.display()))?;
        Ok(Self { root })
    }

    /// Open a store in a fresh temporary directory for testing.
    #[cfg(test)]
    pub async fn temporary() -> Result<Self> {
        let root = std::env::temp_dir().join(format!("listpad_{:x}", random::<u64>()));
        Self::new(root).await
    }

    fn path_for(&self, key: &DocKey) -> PathBuf {
        match key {
            DocKey::Registry => self.root.join("registry.bin"),
            DocKey::Bulletins => self.root.join("bulletins.bin"),
            DocKey::List(id) => self.root.join("lists").join(format!("{id}.bin")),
        }
    }

    /// Read the blob stored under `key`, if any.
    pub async fn read(&self, key: &DocKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {key}")),
        }
    }

    /// Atomically replace the blob stored under `key`.
    pub async fn write(&self, key: &DocKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Unique temp name per writer so concurrent writers never share one.
        let tmp = path.with_extension(format!("tmp{:08x}", random::<u32>()));
        let bytes = bytes.to_vec();
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Err(e) = std::fs::write(&tmp, &bytes) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e).with_context(|| format!("failed to write {key}"));
            }
            if let Err(e) = std::fs::rename(&tmp, &path) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e).with_context(|| format!("failed to replace {key}"));
            }
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Remove the blob stored under `key`. Missing blobs are not an error.
    pub async fn delete(&self, key: &DocKey) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {key}")),
        }
    }
}

#[cfg(test)]
impl Drop for Store {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if self.root.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}
