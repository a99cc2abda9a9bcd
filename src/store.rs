//! Durable narration cache: one JSON file mapping period key → audio entry.
//!
//! Writes are read-modify-write under an exclusive file lock, so two periods
//! finishing synthesis back to back both land in the file. The file itself is
//! replaced atomically (temp file in the same dir, then rename).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Base64 audio bytes.
    pub payload: String,
    /// Seconds, as measured by the decoder when the entry was created.
    pub duration: f64,
    /// Unix millis; drives eviction order.
    #[serde(default)]
    pub stored_at: i64,
}

impl CacheEntry {
    pub fn new(payload: String, duration: f64) -> Self {
        Self {
            payload,
            duration,
            stored_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub type CacheMap = BTreeMap<String, CacheEntry>;

#[derive(Debug, Clone)]
pub struct NarrationStore {
    path: PathBuf,
    lock_path: PathBuf,
    max_entries: Option<usize>,
}

impl NarrationStore {
    pub fn new(path: impl Into<PathBuf>, max_entries: Option<usize>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            max_entries: max_entries.map(|n| n.max(1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every persisted entry. A missing file is an empty cache.
    pub fn load(&self) -> Result<CacheMap, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(CacheMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge one entry into the file. Returns keys evicted to honour the
    /// capacity limit (never `key` itself).
    pub fn put(&self, key: &str, entry: CacheEntry) -> Result<Vec<String>, StoreError> {
        let _lock = self.lock()?;
        let mut entries = self.load_for_write();
        entries.insert(key.to_string(), entry);
        let evicted = self.evict(&mut entries, key);
        self.write(&entries)?;
        debug!(
            "Persisted narration for {key} ({} entries, {} evicted)",
            entries.len(),
            evicted.len()
        );
        Ok(evicted)
    }

    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let _lock = self.lock()?;
        let mut entries = self.load_for_write();
        let removed = entries.remove(key).is_some();
        if removed {
            self.write(&entries)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        let _lock = self.lock()?;
        let count = self.load_for_write().len();
        self.write(&CacheMap::new())?;
        info!("Cleared {count} narration cache entries");
        Ok(count)
    }

    /// A corrupt file is not allowed to block new writes; it gets replaced.
    fn load_for_write(&self) -> CacheMap {
        match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Discarding unreadable narration cache {}: {e}", self.path.display());
                CacheMap::new()
            }
        }
    }

    fn evict(&self, entries: &mut CacheMap, keep: &str) -> Vec<String> {
        let Some(max) = self.max_entries else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while entries.len() > max {
            let oldest = entries
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .min_by(|a, b| a.1.stored_at.cmp(&b.1.stored_at).then_with(|| a.0.cmp(b.0)))
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                    evicted.push(k);
                }
                None => break,
            }
        }
        evicted
    }

    fn lock(&self) -> Result<fs::File, StoreError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn write(&self, entries: &CacheMap) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let data = serde_json::to_vec(entries)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}
