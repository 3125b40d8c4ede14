//! Durable permission preference store.
//!
//! Preferences are a flat map from `"<origin>:<permission>"` to the remembered
//! decision. The file form is pretty-printed JSON with sorted keys, so saving
//! what was just loaded leaves the file byte-for-byte unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Persisted decisions keyed by [`PermissionKey`] string form.
pub type PermissionMap = BTreeMap<String, bool>;

/// Store errors. Callers treat all of them as "no decision available".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Permission store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission store is corrupt: {0}")]
    Corrupt(String),

    #[error("Permission store unavailable: {0}")]
    Unavailable(String),
}

/// `(origin, permission)` pair identifying one remembered decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionKey {
    pub origin: String,
    pub permission: String,
}

impl PermissionKey {
    pub fn new(origin: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            permission: permission.into(),
        }
    }

    /// Parse the `"<origin>:<permission>"` form. Origins carry colons of
    /// their own, so the split is on the last one.
    pub fn parse(key: &str) -> Option<Self> {
        let (origin, permission) = key.rsplit_once(':')?;
        if origin.is_empty() || permission.is_empty() {
            return None;
        }
        Some(Self::new(origin, permission))
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.permission)
    }
}

/// Backend holding remembered permission decisions.
pub trait PermissionStore: Send + Sync {
    fn load(&self) -> Result<PermissionMap, StoreError>;
    fn save(&self, map: &PermissionMap) -> Result<(), StoreError>;
}

/// JSON file backend.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PermissionStore for JsonFileStore {
    /// Returns an empty map if the file doesn't exist yet.
    fn load(&self) -> Result<PermissionMap, StoreError> {
        if !self.path.exists() {
            return Ok(PermissionMap::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| {
            StoreError::Corrupt(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, map: &PermissionMap) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize preferences: {e}")))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-process backend, used when no file path is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<PermissionMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(map: PermissionMap) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }
}

impl PermissionStore for MemoryStore {
    fn load(&self) -> Result<PermissionMap, StoreError> {
        self.map
            .lock()
            .map(|m| m.clone())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn save(&self, map: &PermissionMap) -> Result<(), StoreError> {
        let mut guard = self
            .map
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        guard.clone_from(map);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_string_form() {
        let key = PermissionKey::new("https://example.com:8443", "geolocation");
        assert_eq!(key.to_string(), "https://example.com:8443:geolocation");
        assert_eq!(PermissionKey::parse(&key.to_string()), Some(key));
    }

    #[test]
    fn key_parse_rejects_missing_parts() {
        assert_eq!(PermissionKey::parse("no-separator"), None);
        assert_eq!(PermissionKey::parse("https://example.com:"), None);
        assert_eq!(PermissionKey::parse(":media"), None);
    }

    #[test]
    fn load_nonexistent_returns_empty() {
        let store = JsonFileStore::new("/nonexistent/veil/permissions.json");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("permissions.json"));

        let mut map = PermissionMap::new();
        map.insert("https://example.com:geolocation".into(), false);
        map.insert("https://meet.example:media".into(), true);
        store.save(&map).unwrap();

        assert_eq!(store.load().unwrap(), map);
    }

    #[test]
    fn saving_loaded_map_leaves_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        let store = JsonFileStore::new(&path);

        let mut map = PermissionMap::new();
        map.insert("https://b.example:notifications".into(), true);
        map.insert("https://a.example:geolocation".into(), false);
        store.save(&map).unwrap();
        let before = std::fs::read(&path).unwrap();

        store.save(&store.load().unwrap()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn load_corrupted_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        std::fs::write(&path, "{ not valid json !!!").unwrap();

        let result = JsonFileStore::new(&path).load();
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn memory_store_saves_and_loads() {
        let store = MemoryStore::new();
        let mut map = PermissionMap::new();
        map.insert("https://example.com:midi".into(), true);
        store.save(&map).unwrap();
        assert_eq!(store.load().unwrap(), map);
    }
}
