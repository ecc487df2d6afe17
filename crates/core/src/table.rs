//! C5: the open-file table.
//!
//! One outer mutex over `api_path -> OpenFile`, released before any call
//! into an `OpenFile` itself, per the locking discipline: outer (C5) ->
//! OpenFile state -> chunk/ring -> I/O queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::cache_governor::CacheGovernor;
use crate::chunks::{self, ReadStateSnapshot, DEFAULT_CHUNK_SIZE};
use crate::config::{Config, PreferredDownloadType};
use crate::error::{DataPlaneError, Result};
use crate::metadata::{ApiFile, FilesystemItem, MetadataStore};
use crate::openfile::{direct::DirectStrategy, full_file::FullFileStrategy, ring_buffer::RingBufferStrategy};
use crate::openfile::{OpenFile, OpenFileData, Strategy};
use crate::provider::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    Read,
    ReadWrite,
}

pub struct OpenFileTable {
    data_dir: std::path::PathBuf,
    entries: Mutex<HashMap<String, Arc<OpenFile>>>,
    next_handle: AtomicU64,
    provider: Arc<dyn Provider>,
    governor: Arc<CacheGovernor>,
    metadata: Arc<MetadataStore>,
    config: Mutex<Config>,
}

impl OpenFileTable {
    pub fn new(
        data_dir: std::path::PathBuf,
        provider: Arc<dyn Provider>,
        governor: Arc<CacheGovernor>,
        metadata: Arc<MetadataStore>,
        config: Config,
    ) -> Self {
        Self {
            data_dir,
            entries: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            provider,
            governor,
            metadata,
            config: Mutex::new(config),
        }
    }

    fn alloc_handle(&self) -> u64 {
        loop {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return handle;
            }
        }
    }

    fn free_cache_bytes(&self) -> u64 {
        let cfg = self.config.lock();
        cfg.max_cache_size_bytes().saturating_sub(self.governor.size())
    }

    /// §4.5's strategy selection table.
    fn choose_strategy_kind(&self, intent: OpenIntent, directory: bool, size: u64) -> StrategyKind {
        let cfg = self.config.lock();
        if directory || size == 0 || intent == OpenIntent::ReadWrite {
            return StrategyKind::FullFile;
        }
        let free_cache = cfg.max_cache_size_bytes().saturating_sub(self.governor.size());
        if (size <= free_cache && cfg.preferred_download_type == PreferredDownloadType::Default)
            || (self.provider.is_read_only() && size <= free_cache)
        {
            return StrategyKind::FullFile;
        }
        let ring_bytes = cfg.ring_buffer_file_size_bytes();
        if cfg.preferred_download_type != PreferredDownloadType::Direct
            && size <= ring_bytes.saturating_mul(1)
        {
            return StrategyKind::RingBuffer;
        }
        StrategyKind::Direct
    }

    /// Opens `api_path`, coalescing with any existing handle set for the
    /// same path, and returns the new handle plus the `OpenFile`.
    ///
    /// Building a strategy can block for a long time (`governor.expand` on a
    /// cold full-file open waits for the eviction scanner), so the `entries`
    /// lock is released before that happens — holding it would deadlock
    /// against `try_evict`/`release`, which need the same lock to free the
    /// space this call is waiting on.
    #[tracing::instrument(skip(self, open_data))]
    pub fn open(
        &self,
        api_path: &str,
        intent: OpenIntent,
        item: &ApiFile,
        open_data: OpenFileData,
    ) -> Result<(u64, Arc<OpenFile>)> {
        if let Some(existing) = self.existing_open_file(api_path)? {
            let handle = self.alloc_handle();
            existing.add_handle(handle, open_data);
            return Ok((handle, existing));
        }

        let fsi = FilesystemItem::from(item);
        let chunk_timeout = self.config.lock().download_timeout_secs;
        let strategy = if item.directory {
            Strategy::FullFile(
                FullFileStrategy::create(
                    api_path,
                    self.data_dir.join("cache").join(Uuid::new_v4().to_string()),
                    0,
                    DEFAULT_CHUNK_SIZE,
                    None,
                    self.provider.clone(),
                    self.governor.clone(),
                    item.encryption_token.clone(),
                )
                .map_err(|e| DataPlaneError::IoError(e.to_string()))?,
            )
        } else {
            let kind = self.choose_strategy_kind(intent, false, item.size);
            self.build_strategy(kind, api_path, item)
                .map_err(|e| DataPlaneError::IoError(e.to_string()))?
        };
        let open_file =
            OpenFile::with_read_only_provider(fsi, chunk_timeout, strategy, self.provider.is_read_only());

        // Someone may have opened (and inserted) the same path while we were
        // blocked above; if so, join that one and let ours be dropped.
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(api_path) {
            if existing.is_removed() {
                open_file.strategy.stop();
                return Err(DataPlaneError::NotFound);
            }
            let handle = self.alloc_handle();
            existing.add_handle(handle, open_data);
            return Ok((handle, existing.clone()));
        }

        let handle = self.alloc_handle();
        open_file.add_handle(handle, open_data);
        entries.insert(api_path.to_string(), open_file.clone());
        Ok((handle, open_file))
    }

    fn existing_open_file(&self, api_path: &str) -> Result<Option<Arc<OpenFile>>> {
        let entries = self.entries.lock();
        match entries.get(api_path) {
            Some(of) if of.is_removed() => Err(DataPlaneError::NotFound),
            Some(of) => Ok(Some(of.clone())),
            None => Ok(None),
        }
    }

    fn build_strategy(&self, kind: StrategyKind, api_path: &str, item: &ApiFile) -> anyhow::Result<Strategy> {
        match kind {
            StrategyKind::FullFile => {
                let source_path = if item.source_path.is_empty() {
                    self.data_dir.join("cache").join(Uuid::new_v4().to_string())
                } else {
                    std::path::PathBuf::from(&item.source_path)
                };
                self.governor
                    .expand(item.size)
                    .map_err(|e| anyhow::anyhow!("cache governor: {e}"))?;
                Ok(Strategy::FullFile(FullFileStrategy::create(
                    api_path,
                    source_path,
                    item.size,
                    DEFAULT_CHUNK_SIZE,
                    None,
                    self.provider.clone(),
                    self.governor.clone(),
                    item.encryption_token.clone(),
                )?))
            }
            StrategyKind::RingBuffer => {
                let ring_bytes = self.config.lock().ring_buffer_file_size_bytes();
                let ring_size = (ring_bytes / DEFAULT_CHUNK_SIZE).max(5);
                let scratch_path = self.data_dir.join("ring").join(Uuid::new_v4().to_string());
                Ok(Strategy::RingBuffer(RingBufferStrategy::create(
                    api_path,
                    scratch_path,
                    item.size,
                    DEFAULT_CHUNK_SIZE,
                    ring_size,
                    self.provider.clone(),
                    item.encryption_token.clone(),
                )?))
            }
            StrategyKind::Direct => Ok(Strategy::Direct(DirectStrategy::create(
                api_path,
                item.size,
                DEFAULT_CHUNK_SIZE,
                crate::openfile::direct::DEFAULT_RING_SIZE,
                self.provider.clone(),
                item.encryption_token.clone(),
            )?)),
        }
    }

    /// Rebuilds an `OpenFile` for a persisted `ResumeEntry` whose backing
    /// file still matches `expected_size`; otherwise drops it.
    pub fn rehydrate_resume(
        &self,
        api_path: &str,
        source_path: std::path::PathBuf,
        expected_size: u64,
        read_state: ReadStateSnapshot,
    ) -> Result<bool> {
        let on_disk_size = std::fs::metadata(&source_path).map(|m| m.len()).ok();
        if on_disk_size != Some(expected_size) {
            tracing::warn!(api_path, "resume entry size mismatch, dropping");
            return Ok(false);
        }
        self.governor
            .expand(expected_size)
            .map_err(|_| DataPlaneError::NoSpace)?;
        let strategy = FullFileStrategy::create(
            api_path,
            source_path.clone(),
            expected_size,
            DEFAULT_CHUNK_SIZE,
            Some(read_state),
            self.provider.clone(),
            self.governor.clone(),
            None,
        )
        .map_err(|e| DataPlaneError::IoError(e.to_string()))?;

        let fsi = FilesystemItem {
            api_path: api_path.to_string(),
            size: expected_size,
            directory: false,
            source_path: source_path.to_string_lossy().into_owned(),
            encryption_token: None,
        };
        let chunk_timeout = self.config.lock().download_timeout_secs;
        let open_file = OpenFile::with_read_only_provider(
            fsi,
            chunk_timeout,
            Strategy::FullFile(strategy),
            self.provider.is_read_only(),
        );
        self.entries.lock().insert(api_path.to_string(), open_file);
        Ok(true)
    }

    pub fn get(&self, api_path: &str) -> Option<Arc<OpenFile>> {
        self.entries.lock().get(api_path).cloned()
    }

    /// Drops the handle; if it was the last one and the file is eligible,
    /// removes the `OpenFile` from the table.
    pub fn release(&self, api_path: &str, handle: u64) {
        let mut entries = self.entries.lock();
        let Some(open_file) = entries.get(api_path).cloned() else {
            return;
        };
        let remaining = open_file.remove_handle(handle);
        if remaining == 0 && open_file.eligible_for_idle_close() {
            open_file.strategy.stop();
            entries.remove(api_path);
        }
    }

    /// Serialized against other opens of `from`/`to`: transfers the
    /// `OpenFile`, if present, to the new key.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(to) {
            return Err(DataPlaneError::Exists);
        }
        if let Some(open_file) = entries.remove(from) {
            open_file.rename(to);
            entries.insert(to.to_string(), open_file);
        }
        Ok(())
    }

    /// Marks the `OpenFile` (if present) as removed; actual teardown
    /// happens when the last handle closes.
    pub fn remove(&self, api_path: &str) {
        let entries = self.entries.lock();
        if let Some(open_file) = entries.get(api_path) {
            open_file.mark_removed();
        }
    }

    /// Authorizes the eviction scanner to delete `api_path`'s backing file.
    /// `release()` already drops completed, idle `OpenFile`s from `entries`
    /// as soon as the last handle closes, so by the time the scanner gets to
    /// a file there is usually no entry left to find: absence of an entry
    /// means the file is already at rest and is itself evictable. An entry
    /// is still present only while it's pinned, open, modified, or mid
    /// download, any of which blocks eviction.
    pub fn try_evict(&self, api_path: &str, pinned: bool) -> bool {
        if pinned {
            return false;
        }
        let mut entries = self.entries.lock();
        let Some(open_file) = entries.get(api_path) else {
            return true;
        };
        if open_file.handle_count() > 0 || open_file.is_modified() || !open_file.strategy.is_complete() {
            return false;
        }
        open_file.strategy.stop();
        entries.remove(api_path);
        true
    }

    /// Periodic timeout sweep (§4.5's 1 s background timer).
    pub fn sweep_idle(&self) {
        let mut entries = self.entries.lock();
        let to_close: Vec<String> = entries
            .iter()
            .filter(|(_, of)| of.eligible_for_idle_close())
            .map(|(k, _)| k.clone())
            .collect();
        for key in to_close {
            if let Some(of) = entries.remove(&key) {
                of.strategy.stop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum StrategyKind {
    FullFile,
    RingBuffer,
    Direct,
}
