//! Persistent document store abstraction.
//!
//! All durable state (version entries, registrations, prefs) is kept
//! as named JSON documents behind the [`PersistentStore`] capability.
//! Business logic never reads the platform registry, plists, or flat
//! files directly; production wires a [`JsonFileStore`] and tests wire
//! a [`MemoryStore`].

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure reading or writing a document.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be encoded or decoded.
    #[error("store codec error for {key:?}: {source}")]
    Codec {
        /// Document key.
        key: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Internal lock poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// A named-document persistent store.
pub trait PersistentStore: Send + Sync {
    /// Load the raw document stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or decode failure.
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Durably store `value` under `key`, replacing any previous
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or encode failure.
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;

    /// Remove the document under `key`. Removing an absent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O failure.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl dyn PersistentStore {
    /// Load and decode the document under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or decode failure.
    pub fn load_doc<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.load(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Codec {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Encode and durably store `doc` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O or encode failure.
    pub fn save_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.save(key, &value)
    }
}

/// On-disk store: one `{key}.json` file per document, written
/// atomically via a tempfile rename in the same directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl PersistentStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })
    }

    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_vec_pretty(value).map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })?;
        // Write-then-rename so a crash never leaves a torn document.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&encoded)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(key))
            .map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let docs = self.docs.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(docs.get(key).cloned())
    }

    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().map_err(|_| StoreError::LockPoisoned)?;
        docs.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().map_err(|_| StoreError::LockPoisoned)?;
        docs.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn memory_store_round_trip() {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        assert!(store.load_doc::<Doc>("d").unwrap().is_none());

        let doc = Doc {
            name: "a".into(),
            count: 3,
        };
        store.save_doc("d", &doc).unwrap();
        assert_eq!(store.load_doc::<Doc>("d").unwrap(), Some(doc));

        store.remove("d").unwrap();
        assert!(store.load_doc::<Doc>("d").unwrap().is_none());
        // Idempotent remove.
        store.remove("d").unwrap();
    }

    #[test]
    fn file_store_round_trip_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistentStore> =
            Arc::new(JsonFileStore::open(dir.path()).unwrap());

        let doc = Doc {
            name: "x".into(),
            count: 1,
        };
        store.save_doc("prefs", &doc).unwrap();
        let replaced = Doc {
            name: "x".into(),
            count: 2,
        };
        store.save_doc("prefs", &replaced).unwrap();
        assert_eq!(store.load_doc::<Doc>("prefs").unwrap(), Some(replaced));
    }

    #[test]
    fn file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.load("absent").unwrap().is_none());
        store.remove("absent").unwrap();
    }
}
