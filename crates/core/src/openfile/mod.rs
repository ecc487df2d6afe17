//! C4: the three open-file strategies, and the `OpenFile` that wraps
//! whichever one was chosen for a given `api_path` (§4.5 picks which).

pub mod direct;
pub mod download;
pub mod full_file;
pub mod io_queue;
pub mod ring_buffer;
pub mod ring_window;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{DataPlaneError, Result};
use crate::metadata::FilesystemItem;

/// Opaque per-handle state owned by the syscall shim; the core never looks
/// inside it.
pub type OpenFileData = Box<dyn Any + Send + Sync>;

pub enum Strategy {
    FullFile(full_file::FullFileStrategy),
    RingBuffer(ring_buffer::RingBufferStrategy),
    Direct(direct::DirectStrategy),
}

impl Strategy {
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        match self {
            Strategy::FullFile(s) => s.read(offset, len),
            Strategy::RingBuffer(s) => s.read(offset, len),
            Strategy::Direct(s) => s.read(offset, len),
        }
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        match self {
            Strategy::FullFile(s) => s.write(offset, buf),
            Strategy::RingBuffer(_) | Strategy::Direct(_) => Err(DataPlaneError::NotSupported),
        }
    }

    pub fn resize(&self, new_size: u64) -> Result<()> {
        match self {
            Strategy::FullFile(s) => s.resize(new_size),
            Strategy::RingBuffer(_) | Strategy::Direct(_) => Err(DataPlaneError::NotSupported),
        }
    }

    pub fn file_size(&self) -> u64 {
        match self {
            Strategy::FullFile(s) => s.file_size(),
            Strategy::RingBuffer(s) => s.file_size(),
            Strategy::Direct(s) => s.file_size(),
        }
    }

    pub fn is_modified(&self) -> bool {
        match self {
            Strategy::FullFile(s) => s.is_modified(),
            Strategy::RingBuffer(_) | Strategy::Direct(_) => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            Strategy::FullFile(s) => s.is_complete(),
            Strategy::RingBuffer(_) | Strategy::Direct(_) => true,
        }
    }

    pub fn rename(&self, new_api_path: &str) {
        match self {
            Strategy::FullFile(s) => s.rename(new_api_path),
            Strategy::RingBuffer(s) => s.rename(new_api_path),
            Strategy::Direct(s) => s.rename(new_api_path),
        }
    }

    pub fn stop(&self) {
        match self {
            Strategy::FullFile(s) => s.stop(),
            Strategy::RingBuffer(s) => s.stop(),
            Strategy::Direct(s) => s.stop(),
        }
    }

    pub fn source_path(&self) -> Option<&std::path::Path> {
        match self {
            Strategy::FullFile(s) => Some(s.source_path()),
            Strategy::RingBuffer(_) | Strategy::Direct(_) => None,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One per `api_path` with at least one open handle, an active download, or
/// pending modifications (§3's `OpenFile` entity).
pub struct OpenFile {
    pub fsi: Mutex<FilesystemItem>,
    pub chunk_timeout_secs: u64,
    pub strategy: Strategy,
    /// Whether the backing provider is read-only, captured at open time —
    /// such files are always eligible for idle-close since no write or
    /// in-flight upload can ever pin them open.
    read_only_provider: bool,
    handles: Mutex<HashMap<u64, OpenFileData>>,
    last_access: AtomicU64,
    removed: AtomicBool,
    sticky_error: Mutex<Option<DataPlaneError>>,
}

impl OpenFile {
    pub fn new(fsi: FilesystemItem, chunk_timeout_secs: u64, strategy: Strategy) -> Arc<Self> {
        Self::with_read_only_provider(fsi, chunk_timeout_secs, strategy, false)
    }

    pub fn with_read_only_provider(
        fsi: FilesystemItem,
        chunk_timeout_secs: u64,
        strategy: Strategy,
        read_only_provider: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            fsi: Mutex::new(fsi),
            chunk_timeout_secs,
            strategy,
            read_only_provider,
            handles: Mutex::new(HashMap::new()),
            last_access: AtomicU64::new(now_secs()),
            removed: AtomicBool::new(false),
            sticky_error: Mutex::new(None),
        })
    }

    pub fn touch(&self) {
        self.last_access.store(now_secs(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_access.load(Ordering::Relaxed))
    }

    pub fn add_handle(&self, handle: u64, data: OpenFileData) {
        self.handles.lock().insert(handle, data);
        self.touch();
    }

    /// Returns the remaining handle count after removal.
    pub fn remove_handle(&self, handle: u64) -> usize {
        let mut handles = self.handles.lock();
        handles.remove(&handle);
        handles.len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn is_modified(&self) -> bool {
        self.strategy.is_modified()
    }

    pub fn set_sticky_error(&self, err: DataPlaneError) {
        let mut current = self.sticky_error.lock();
        let replace = match current.as_ref() {
            None => true,
            Some(existing) => err.download_precedence() > existing.download_precedence(),
        };
        if replace {
            *current = Some(err);
        }
    }

    pub fn sticky_error(&self) -> Option<DataPlaneError> {
        self.sticky_error.lock().clone()
    }

    /// Safe to close from the table's idle-timeout sweep: no handles, not
    /// modified, download complete (or read-only strategy never has one
    /// in progress past construction).
    pub fn eligible_for_idle_close(&self) -> bool {
        self.handle_count() == 0
            && !self.is_modified()
            && (self.strategy.is_complete()
                || self.read_only_provider
                || self.idle_secs() >= self.chunk_timeout_secs)
    }

    pub fn rename(&self, new_api_path: &str) {
        self.strategy.rename(new_api_path);
        self.fsi.lock().api_path = new_api_path.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_governor::CacheGovernor;
    use crate::provider::passthrough::PassthroughProvider;
    use crate::provider::Provider;
    use crate::stop::StopFlag;

    fn fsi(path: &str) -> FilesystemItem {
        FilesystemItem {
            api_path: path.to_string(),
            size: 0,
            directory: false,
            source_path: String::new(),
            encryption_token: None,
        }
    }

    #[test]
    fn handle_table_tracks_count_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(PassthroughProvider::new(dir.path().join("remote")).unwrap());
        let governor = Arc::new(CacheGovernor::new(u64::MAX));
        let strategy = full_file::FullFileStrategy::create(
            "/f.bin",
            dir.path().join("cache/f.bin"),
            0,
            4,
            None,
            provider,
            governor,
            None,
        )
        .unwrap();

        let of = OpenFile::new(fsi("/f.bin"), 30, Strategy::FullFile(strategy));
        of.add_handle(1, Box::new(()));
        assert_eq!(of.handle_count(), 1);
        assert_eq!(of.remove_handle(1), 0);
        assert!(of.eligible_for_idle_close());
    }

    struct ReadOnlyProvider(PassthroughProvider);

    impl crate::provider::Provider for ReadOnlyProvider {
        fn list(&self, path: &str) -> Result<Vec<crate::provider::ProviderEntry>> {
            self.0.list(path)
        }
        fn head(&self, path: &str) -> Result<crate::provider::ProviderAttrs> {
            self.0.head(path)
        }
        fn read_range(
            &self,
            path: &str,
            offset: u64,
            len: u64,
            token: Option<&str>,
            stop: &StopFlag,
        ) -> Result<Vec<u8>> {
            self.0.read_range(path, offset, len, token, stop)
        }
        fn upload(&self, path: &str, source_path: &std::path::Path, stop: &StopFlag) -> Result<()> {
            self.0.upload(path, source_path, stop)
        }
        fn mkdir(&self, path: &str) -> Result<()> {
            self.0.mkdir(path)
        }
        fn rmdir(&self, path: &str) -> Result<()> {
            self.0.rmdir(path)
        }
        fn is_read_only(&self) -> bool {
            true
        }
    }

    #[test]
    fn read_only_provider_makes_an_incomplete_download_idle_closeable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ReadOnlyProvider(
            PassthroughProvider::new(dir.path().join("remote")).unwrap(),
        ));
        let scratch = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(scratch.path(), vec![0u8; 16]).unwrap();
        provider.upload("/f.bin", scratch.path(), &StopFlag::new()).unwrap();

        let governor = Arc::new(CacheGovernor::new(u64::MAX));
        let strategy = full_file::FullFileStrategy::create(
            "/f.bin",
            dir.path().join("cache/f.bin"),
            16,
            4,
            None,
            provider,
            governor,
            None,
        )
        .unwrap();
        assert!(!strategy.is_complete());

        let of = OpenFile::with_read_only_provider(fsi("/f.bin"), 3600, Strategy::FullFile(strategy), true);
        assert!(of.eligible_for_idle_close());
    }

    #[test]
    fn sticky_error_precedence_never_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(PassthroughProvider::new(dir.path()).unwrap());
        let governor = Arc::new(CacheGovernor::new(u64::MAX));
        let strategy = full_file::FullFileStrategy::create(
            "/f.bin",
            dir.path().join("cache/f.bin"),
            0,
            4,
            None,
            provider,
            governor,
            None,
        )
        .unwrap();
        let of = OpenFile::new(fsi("/f.bin"), 30, Strategy::FullFile(strategy));

        of.set_sticky_error(DataPlaneError::DownloadStopped);
        of.set_sticky_error(DataPlaneError::DownloadIncomplete);
        assert!(matches!(
            of.sticky_error(),
            Some(DataPlaneError::DownloadStopped)
        ));

        of.set_sticky_error(DataPlaneError::CommError("x".into()));
        assert!(matches!(of.sticky_error(), Some(DataPlaneError::CommError(_))));
    }
}
