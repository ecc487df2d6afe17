//! C7: the eviction scanner.
//!
//! Scan-then-wait loop straight from `eviction.cpp`'s `service_function`:
//! filter by reference timestamp, evict-or-skip per file, then a condvar
//! wait bounded to the scan period so a shrink or shutdown can interrupt it
//! early.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use walkdir::WalkDir;

use crate::cache_governor::CacheGovernor;
use crate::metadata::MetadataStore;
use crate::stop::StopFlag;
use crate::table::OpenFileTable;

const SCAN_PERIOD: Duration = Duration::from_secs(30);

pub struct EvictionScanner {
    cache_dir: std::path::PathBuf,
    metadata: Arc<MetadataStore>,
    table: Arc<OpenFileTable>,
    governor: Arc<CacheGovernor>,
    stop: Arc<StopFlag>,
    eviction_delay: Duration,
    use_accessed_time: bool,
}

impl EvictionScanner {
    pub fn new(
        cache_dir: std::path::PathBuf,
        metadata: Arc<MetadataStore>,
        table: Arc<OpenFileTable>,
        governor: Arc<CacheGovernor>,
        stop: Arc<StopFlag>,
        eviction_delay: Duration,
        use_accessed_time: bool,
    ) -> Self {
        Self {
            cache_dir,
            metadata,
            table,
            governor,
            stop,
            eviction_delay,
            use_accessed_time,
        }
    }

    pub fn run(&self) {
        loop {
            if self.stop.is_stopped() {
                return;
            }
            self.scan_once();
            if self.stop.wait_timeout(SCAN_PERIOD) {
                return;
            }
        }
    }

    fn reference_time(&self, meta: &std::fs::Metadata) -> std::time::SystemTime {
        if self.use_accessed_time {
            meta.accessed().unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        } else {
            meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn scan_once(&self) {
        if !self.cache_dir.exists() {
            return;
        }
        for entry in WalkDir::new(&self.cache_dir).into_iter().filter_map(|e| e.ok()) {
            if self.stop.is_stopped() {
                return;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let reference = self.reference_time(&meta);
            let idle = reference.elapsed().unwrap_or_default();
            if idle < self.eviction_delay {
                continue;
            }
            self.evict_one(entry.path(), meta.len());
        }
    }

    fn evict_one(&self, source_path: &Path, size: u64) {
        let source_str = source_path.to_string_lossy().into_owned();
        let Some(api_path) = self.metadata.api_path_from_source(&source_str) else {
            tracing::info!(path = %source_str, "orphaned cache file, removing");
            let _ = std::fs::remove_file(source_path);
            self.governor.shrink(size);
            return;
        };

        let pinned = self.metadata.is_pinned(&api_path);
        if self.table.try_evict(&api_path, pinned) {
            let _ = std::fs::remove_file(source_path);
            self.governor.shrink(size);
            tracing::debug!(api_path, "evicted idle cache entry");
        } else {
            tracing::trace!(api_path, "skipped: processing, open, or pinned");
        }
    }
}
