//! C2: the metadata store.
//!
//! Single authoritative writer of `api_path -> {attrs, source_path, pinned}`,
//! plus the reverse `source_path -> api_path` map the eviction scanner needs.
//! Every other component reads or submits updates through [`MetadataStore`];
//! nothing else touches the backing file directly.
//!
//! Persistence follows the same session-persistence pattern as `rqbit`'s session store: the whole
//! table is kept in memory under a lock and flushed to a temp file that is
//! then renamed over the real one, so a crash mid-write never corrupts it.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DataPlaneError, Result};

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Canonical per-path record. `parent == parent_of(api_path)`; the root has
/// `api_path == "/"` and `parent == ""`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiFile {
    pub api_path: String,
    pub parent: String,
    pub size: u64,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub changed: u64,
    pub directory: bool,
    pub encryption_token: Option<String>,
    /// Local cache filename, or empty for directories and not-yet-materialized
    /// zero-byte files.
    pub source_path: String,
    /// Forbids eviction even when otherwise eligible.
    pub pinned: bool,
}

impl ApiFile {
    pub fn new_dir(api_path: &str) -> Self {
        let now = now_nanos();
        Self {
            api_path: api_path.to_string(),
            parent: parent_of(api_path),
            size: 0,
            created: now,
            modified: now,
            accessed: now,
            changed: now,
            directory: true,
            encryption_token: None,
            source_path: String::new(),
            pinned: false,
        }
    }

    pub fn new_file(api_path: &str) -> Self {
        let now = now_nanos();
        Self {
            api_path: api_path.to_string(),
            parent: parent_of(api_path),
            size: 0,
            created: now,
            modified: now,
            accessed: now,
            changed: now,
            directory: false,
            encryption_token: None,
            source_path: String::new(),
            pinned: false,
        }
    }
}

/// Normalizes to a `/`-rooted, forward-slash path with no trailing slash
/// (except for the root itself).
pub fn normalize(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

pub fn parent_of(api_path: &str) -> String {
    if api_path == "/" {
        return String::new();
    }
    match api_path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => api_path[..idx].to_string(),
        None => "/".to_string(),
    }
}

/// Projection of [`ApiFile`] used by the data plane; captured at open time so
/// a strategy always reflects the store's view as of that moment.
#[derive(Debug, Clone)]
pub struct FilesystemItem {
    pub api_path: String,
    pub size: u64,
    pub directory: bool,
    pub source_path: String,
    pub encryption_token: Option<String>,
}

impl From<&ApiFile> for FilesystemItem {
    fn from(f: &ApiFile) -> Self {
        Self {
            api_path: f.api_path.clone(),
            size: f.size,
            directory: f.directory,
            source_path: f.source_path.clone(),
            encryption_token: f.encryption_token.clone(),
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct SerializedTable {
    items: HashMap<String, ApiFile>,
}

struct Inner {
    items: HashMap<String, ApiFile>,
    /// source_path -> api_path, rebuilt from `items` on load.
    by_source: HashMap<String, String>,
}

/// The process-wide metadata singleton (C2).
pub struct MetadataStore {
    db_path: PathBuf,
    inner: RwLock<Inner>,
}

impl MetadataStore {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("meta.json");
        let table: SerializedTable = match std::fs::read(&db_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut t = SerializedTable::default();
                t.items
                    .insert("/".to_string(), ApiFile::new_dir("/"));
                t
            }
            Err(e) => return Err(e.into()),
        };
        let mut by_source = HashMap::new();
        for (path, item) in table.items.iter() {
            if !item.source_path.is_empty() {
                by_source.insert(item.source_path.clone(), path.clone());
            }
        }
        let store = Self {
            db_path,
            inner: RwLock::new(Inner {
                items: table.items,
                by_source,
            }),
        };
        store.flush()?;
        Ok(store)
    }

    fn flush(&self) -> anyhow::Result<()> {
        let table = {
            let inner = self.inner.read();
            SerializedTable {
                items: inner.items.clone(),
            }
        };
        let tmp_path = self.db_path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&table)?;
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &self.db_path)?;
        Ok(())
    }

    pub fn get(&self, api_path: &str) -> Option<ApiFile> {
        self.inner.read().items.get(api_path).cloned()
    }

    pub fn exists(&self, api_path: &str) -> bool {
        self.inner.read().items.contains_key(api_path)
    }

    pub fn api_path_from_source(&self, source_path: &str) -> Option<String> {
        self.inner.read().by_source.get(source_path).cloned()
    }

    pub fn put(&self, item: ApiFile) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write();
            if !item.source_path.is_empty() {
                inner
                    .by_source
                    .insert(item.source_path.clone(), item.api_path.clone());
            }
            inner.items.insert(item.api_path.clone(), item);
        }
        self.flush()
    }

    pub fn remove(&self, api_path: &str) -> anyhow::Result<Option<ApiFile>> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.items.remove(api_path);
            if let Some(item) = removed.as_ref() {
                if !item.source_path.is_empty() {
                    inner.by_source.remove(&item.source_path);
                }
            }
            removed
        };
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if !inner.items.contains_key(from) {
                return Err(DataPlaneError::NotFound);
            }
            if inner.items.contains_key(to) {
                return Err(DataPlaneError::Exists);
            }
            let mut item = inner.items.remove(from).unwrap();
            item.api_path = to.to_string();
            item.parent = parent_of(to);
            item.changed = now_nanos();
            if !item.source_path.is_empty() {
                inner.by_source.insert(item.source_path.clone(), to.to_string());
            }
            inner.items.insert(to.to_string(), item);
        }
        self.flush().map_err(|e| DataPlaneError::IoError(e.to_string()))
    }

    pub fn list_children(&self, dir_path: &str) -> Vec<ApiFile> {
        let inner = self.inner.read();
        inner
            .items
            .values()
            .filter(|item| item.parent == dir_path && item.api_path != dir_path)
            .cloned()
            .collect()
    }

    pub fn set_pinned(&self, api_path: &str, pinned: bool) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write();
            if let Some(item) = inner.items.get_mut(api_path) {
                item.pinned = pinned;
            }
        }
        self.flush()
    }

    pub fn is_pinned(&self, api_path: &str) -> bool {
        self.inner
            .read()
            .items
            .get(api_path)
            .map(|i| i.pinned)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.read();
        let items = inner.items.len() as u64;
        let total = inner.items.values().map(|i| i.size).sum();
        (items, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize("foo/bar"), "/foo/bar");
        assert_eq!(normalize("/foo/bar/"), "/foo/bar");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn parent_paths() {
        assert_eq!(parent_of("/"), "");
        assert_eq!(parent_of("/foo"), "/");
        assert_eq!(parent_of("/foo/bar"), "/foo");
    }

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(store.exists("/"));

        let mut f = ApiFile::new_file("/a.txt");
        f.source_path = "src-a".to_string();
        store.put(f.clone()).unwrap();

        assert_eq!(store.get("/a.txt").unwrap().source_path, "src-a");
        assert_eq!(store.api_path_from_source("src-a").unwrap(), "/a.txt");

        store.remove("/a.txt").unwrap();
        assert!(!store.exists("/a.txt"));
        assert!(store.api_path_from_source("src-a").is_none());
    }

    #[test]
    fn rename_transfers_reverse_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        let mut f = ApiFile::new_file("/a.txt");
        f.source_path = "src-a".to_string();
        store.put(f).unwrap();

        store.rename("/a.txt", "/b.txt").unwrap();
        assert!(!store.exists("/a.txt"));
        assert_eq!(store.get("/b.txt").unwrap().source_path, "src-a");
        assert_eq!(store.api_path_from_source("src-a").unwrap(), "/b.txt");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MetadataStore::open(dir.path()).unwrap();
            store.put(ApiFile::new_file("/a.txt")).unwrap();
        }
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(store.exists("/a.txt"));
    }
}
