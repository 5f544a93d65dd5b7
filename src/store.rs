use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Minimal key-value persistence. Each service owns a disjoint key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_file(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Store(format!("invalid store key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KvStore for JsonFileStore {
    /// A missing file reads as absent. An unparsable file is moved aside to
    /// `<key>.json.corrupt-<unix secs>` and reported as an error, so callers
    /// never overwrite data they could not read.
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.key_file(key)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Store(format!("failed to read {}: {e}", path.display())));
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let aside = path.with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
                std::fs::rename(&path, &aside).map_err(|re| {
                    Error::Store(format!(
                        "corrupted store file {} ({e}) could not be moved aside: {re}",
                        path.display()
                    ))
                })?;
                warn!("corrupted store file {}: {e}, moved to {}", path.display(), aside.display());
                Err(Error::Store(format!(
                    "corrupted store file {}: {e} (moved to {})",
                    path.display(),
                    aside.display()
                )))
            }
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.key_file(key)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Store(format!("failed to create store dir: {e}")))?;

        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| Error::Store(format!("failed to serialize {key}: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::Store(format!("failed to replace {}: {e}", path.display())))?;

        Ok(())
    }
}

/// Process-local store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, JsonFileStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("store"));
        (dir, store)
    }

    #[test]
    fn test_get_missing_key_is_none() {
        let (_dir, store) = test_store();
        assert!(store.get("review-history").unwrap().is_none());
    }

    #[test]
    fn test_set_then_get() {
        let (_dir, store) = test_store();
        store.set("review-history", json!([{"id": "a"}])).unwrap();
        assert_eq!(
            store.get("review-history").unwrap(),
            Some(json!([{"id": "a"}]))
        );
    }

    #[test]
    fn test_keys_are_disjoint_files() {
        let (_dir, store) = test_store();
        store.set("one", json!(1)).unwrap();
        store.set("two", json!(2)).unwrap();
        assert_eq!(store.get("one").unwrap(), Some(json!(1)));
        assert!(store.dir().join("two.json").exists());
    }

    #[test]
    fn test_corrupted_file_is_moved_aside_and_reported() {
        let (_dir, store) = test_store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("bad.json"), "{ not json").unwrap();

        let err = store.get("bad").unwrap_err().to_string();
        assert!(err.contains("corrupted store file"));
        assert!(!store.dir().join("bad.json").exists());

        let aside: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("bad.json.corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);
        let kept = std::fs::read_to_string(store.dir().join(&aside[0])).unwrap();
        assert_eq!(kept, "{ not json");

        assert!(store.get("bad").unwrap().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_file_is_an_error() {
        let (_dir, store) = test_store();
        // A directory where the file should be cannot be read as a string.
        std::fs::create_dir_all(store.dir().join("blocked.json")).unwrap();
        assert!(store.get("blocked").is_err());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let (_dir, store) = test_store();
        assert!(store.set("../escape", json!(1)).is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonFileStore::new(dir.path());
            store.set("k", json!({"x": 1})).unwrap();
        }
        let store = JsonFileStore::new(dir.path());
        assert_eq!(store.get("k").unwrap(), Some(json!({"x": 1})));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("k").unwrap().is_none());
        store.set("k", json!("v")).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!("v")));
    }
}
