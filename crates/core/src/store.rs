//! Blob store for profiles, RGB libraries, key assignments and macros.
//!
//! Keys are relative paths of the form `<dir>/<name>.json` (or a bare
//! `<name>.json` at the root). Names must match `[a-zA-Z0-9-]+`.
//! Saves are not atomic; a crash mid-save may leave a truncated blob, which
//! the loaders treat like a missing one.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::RwLock;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const PROFILES_DIR: &str = "profiles";
pub const RGB_DIR: &str = "rgb";
pub const KEY_ASSIGNMENTS_DIR: &str = "key-assignments";
pub const MACROS_KEY: &str = "macros.json";
pub const SPEED_PROFILES_KEY: &str = "temperatures.json";

const EXTENSION: &str = ".json";

static NAME_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

/// Whether `name` is usable as a blob base name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9-]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Split and validate a key into `(dir, base name)`.
pub fn parse_key(key: &str) -> Result<(Option<&str>, &str)> {
    let (dir, file) = match key.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, key),
    };
    let base = file
        .strip_suffix(EXTENSION)
        .ok_or_else(|| Error::Store(format!("{key}: not a {EXTENSION} blob")))?;
    if !is_valid_name(base) {
        return Err(Error::Store(format!("{key}: invalid name")));
    }
    if let Some(dir) = dir {
        if dir.split('/').any(|part| !is_valid_name(part)) {
            return Err(Error::Store(format!("{key}: invalid directory")));
        }
    }
    Ok((dir, base))
}

/// `<dir>/<name>.json`
pub fn key(dir: &str, name: &str) -> String {
    format!("{dir}/{name}{EXTENSION}")
}

/// Opaque blob storage.
pub trait ProfileStore: Send + Sync {
    /// Blob for `key`, `None` when absent.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, blob: &[u8]) -> Result<()>;
    /// Base names of every blob in `dir`, sorted.
    fn list(&self, dir: &str) -> Result<Vec<String>>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Load and decode a JSON blob. Undecodable blobs are logged and treated as
/// missing.
pub fn load_json<T: DeserializeOwned>(store: &dyn ProfileStore, key: &str) -> Result<Option<T>> {
    let Some(blob) = store.load(key)? else {
        return Ok(None);
    };
    match serde_json::from_slice(&blob) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable blob");
            Ok(None)
        }
    }
}

/// Encode `value` as indented JSON and save it.
pub fn save_json<T: Serialize>(store: &dyn ProfileStore, key: &str, value: &T) -> Result<()> {
    let mut blob = serde_json::to_vec_pretty(value)?;
    blob.push(b'\n');
    store.save(key, &blob)
}

/// Store rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        parse_key(key)?;
        Ok(self.root.join(key))
    }
}

impl ProfileStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key)?;
        match fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, blob)?;
        debug!(path = %path.display(), bytes = blob.len(), "blob saved");
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.root.join(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let file = e.file_name().into_string().ok()?;
                let base = file.strip_suffix(EXTENSION)?;
                is_valid_name(base).then(|| base.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "blob deleted");
        Ok(())
    }
}

/// In-memory store for previews and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        parse_key(key)?;
        Ok(self.blobs.read().get(key).cloned())
    }

    fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        parse_key(key)?;
        self.blobs.write().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = format!("{dir}/");
        Ok(self
            .blobs
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .filter_map(|rest| rest.strip_suffix(EXTENSION))
            .map(str::to_string)
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        parse_key(key)?;
        self.blobs
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::Store(format!("{key}: not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        name: String,
        value: u32,
    }

    #[test]
    fn key_validation() {
        assert_eq!(parse_key("profiles/ABC-123.json").unwrap(), (Some("profiles"), "ABC-123"));
        assert_eq!(parse_key("macros.json").unwrap(), (None, "macros"));
        assert!(parse_key("profiles/abc.txt").is_err());
        assert!(parse_key("profiles/a b.json").is_err());
        assert!(parse_key("../etc/passwd.json").is_err());
        assert!(parse_key("profiles/.json").is_err());
    }

    #[test]
    fn file_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let blob = Blob {
            name: "x".into(),
            value: 7,
        };
        save_json(&store, "profiles/SER1.json", &blob).unwrap();
        save_json(&store, "profiles/SER1-gaming.json", &blob).unwrap();
        fs::write(dir.path().join("profiles/notes.txt"), "x").unwrap();

        let loaded: Blob = load_json(&store, "profiles/SER1.json").unwrap().unwrap();
        assert_eq!(loaded, blob);
        assert_eq!(store.list("profiles").unwrap(), vec!["SER1", "SER1-gaming"]);

        store.delete("profiles/SER1-gaming.json").unwrap();
        assert_eq!(store.list("profiles").unwrap(), vec!["SER1"]);
        assert!(store.delete("profiles/SER1-gaming.json").is_err());
    }

    #[test]
    fn missing_and_corrupt_blobs_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(load_json::<Blob>(&store, "rgb/NOPE.json").unwrap().is_none());
        assert!(store.list("rgb").unwrap().is_empty());
        store.save("rgb/BAD.json", b"{\"name\": ").unwrap();
        assert!(load_json::<Blob>(&store, "rgb/BAD.json").unwrap().is_none());
    }

    #[test]
    fn memory_store_lists_one_level() {
        let store = MemoryStore::new();
        store.save("profiles/A.json", b"{}").unwrap();
        store.save("profiles/B.json", b"{}").unwrap();
        store.save("rgb/A.json", b"{}").unwrap();
        assert_eq!(store.list("profiles").unwrap(), vec!["A", "B"]);
        assert!(store.delete("rgb/Z.json").is_err());
    }
}
