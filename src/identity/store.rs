//! Keyed state storage
//!
//! A small `get/put/remove` interface with an in-memory backend (tests) and a
//! JSON-file backend (production). The file backend rewrites the whole
//! document on every change using write-temp-then-rename, so a crash leaves
//! either the old or the new file, never a mix.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

pub trait KeyedStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<V>>;

    fn put(&self, key: &str, value: V) -> Result<()>;

    /// Remove a key, returning its previous value
    fn remove(&self, key: &str) -> Result<Option<V>>;

    /// All entries, ordered by key
    fn entries(&self) -> Result<Vec<(String, V)>>;

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Volatile store
pub struct MemoryStore<V> {
    map: RwLock<BTreeMap<String, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> KeyedStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<V>> {
        Ok(self.map.write().remove(key))
    }

    fn entries(&self) -> Result<Vec<(String, V)>> {
        Ok(self.map.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Durable store backed by one JSON document
pub struct FileStore<V> {
    path: PathBuf,
    cache: RwLock<BTreeMap<String, V>>,
}

impl<V: Serialize + DeserializeOwned + Clone + Send + Sync> FileStore<V> {
    /// Open the store, loading existing entries.
    ///
    /// A missing file is an empty store. An empty or unparsable file (e.g. a
    /// truncated write from another tool) is moved aside and the store
    /// starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = load(&path)?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened state store");
        Ok(Self {
            path,
            cache: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &BTreeMap<String, V>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(map)?;
        write_atomic(&self.path, &bytes)
    }
}

impl<V: Serialize + DeserializeOwned + Clone + Send + Sync> KeyedStore<V> for FileStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.cache.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        let mut cache = self.cache.write();
        let mut next = cache.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *cache = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<V>> {
        let mut cache = self.cache.write();
        if !cache.contains_key(key) {
            return Ok(None);
        }
        let mut next = cache.clone();
        let previous = next.remove(key);
        self.persist(&next)?;
        *cache = next;
        Ok(previous)
    }

    fn entries(&self) -> Result<Vec<(String, V)>> {
        Ok(self.cache.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

fn load<V: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, V>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    if content.trim().is_empty() {
        tracing::warn!(path = %path.display(), "State file is empty, starting with an empty store");
        return Ok(BTreeMap::new());
    }

    match serde_json::from_str(&content) {
        Ok(map) => Ok(map),
        Err(e) => {
            let aside = path.with_extension(format!(
                "unreadable-{}",
                chrono::Utc::now().format("%Y%m%dT%H%M%S")
            ));
            tracing::warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                error = %e,
                "State file is unreadable, starting with an empty store"
            );
            fs::rename(path, &aside)?;
            Ok(BTreeMap::new())
        }
    }
}

/// Replace `path` with `bytes` so readers see either the old or new content
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    sync_dir(dir);
    Ok(())
}

/// Make a completed rename durable
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.put("a", 1u32).unwrap();
        store.put("b", 2u32).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(1));
        assert!(store.contains("b").unwrap());
        assert_eq!(store.remove("a").unwrap(), Some(1));
        assert_eq!(store.remove("a").unwrap(), None);
        assert_eq!(store.entries().unwrap(), vec![("b".to_string(), 2)]);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("vmids.json");

        let store = FileStore::open(&path).unwrap();
        store.put("pod-1-web", 4242u32).unwrap();
        store.put("pod-1-db", 777u32).unwrap();
        store.remove("pod-1-db").unwrap();
        drop(store);

        let store: FileStore<u32> = FileStore::open(&path).unwrap();
        assert_eq!(store.get("pod-1-web").unwrap(), Some(4242));
        assert_eq!(store.get("pod-1-db").unwrap(), None);
    }

    #[test]
    fn test_file_store_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vmids.json");
        let store = FileStore::open(&path).unwrap();
        for i in 0..5u32 {
            store.put(&format!("c{}", i), i).unwrap();
        }
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["vmids.json".to_string()]);
    }

    #[test]
    fn test_missing_and_empty_files_are_empty_stores() {
        let temp = TempDir::new().unwrap();
        let store: FileStore<u32> = FileStore::open(temp.path().join("none.json")).unwrap();
        assert!(store.entries().unwrap().is_empty());

        let empty = temp.path().join("empty.json");
        fs::write(&empty, "").unwrap();
        let store: FileStore<u32> = FileStore::open(&empty).unwrap();
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_file_is_moved_aside() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vmids.json");
        fs::write(&path, r#"{"pod-1-web": 42"#).unwrap();

        let store: FileStore<u32> = FileStore::open(&path).unwrap();
        assert!(store.entries().unwrap().is_empty());
        assert!(!path.exists());

        let aside = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("unreadable"));
        assert!(aside);
    }
}
