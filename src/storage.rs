use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::warn;

/// Persisted string key/value storage.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.entries.lock().ok()?;
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage mutex poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage mutex poisoned"))?;
        map.remove(key);
        Ok(())
    }
}

/// A single JSON object on disk holding every key. Writes go through a temp file + rename.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!("ignoring unreadable storage file {:?}: {}", path, err);
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {:?}", path));
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        let data = serde_json::to_vec_pretty(map)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &data).with_context(|| format!("failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {:?}", self.path))?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.entries.lock().ok()?;
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage mutex poisoned"))?;
        let mut next = map.clone();
        next.insert(key.to_string(), value.to_string());
        self.flush(&next)?;
        *map = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage mutex poisoned"))?;
        if !map.contains_key(key) {
            return Ok(());
        }
        let mut next = map.clone();
        next.remove(key);
        self.flush(&next)?;
        *map = next;
        Ok(())
    }
}
