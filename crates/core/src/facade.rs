//! C8: the filesystem façade consumed by the syscall shim.
//!
//! Composes C2 (metadata), C5 (open-file table), C6 (upload manager) and C7
//! (eviction scanner) behind the operation set in §6. This is the only
//! surface a FUSE/WinFSP binding needs to call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache_governor::CacheGovernor;
use crate::config::Config;
use crate::eviction::EvictionScanner;
use crate::metadata::{normalize, parent_of, ApiFile, MetadataStore};
use crate::openfile::OpenFileData;
use crate::provider::Provider;
use crate::stop::StopFlag;
use crate::table::{OpenFileTable, OpenIntent};
use crate::upload::UploadManager;
use crate::error::{DataPlaneError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    pub sync: bool,
}

impl OpenFlags {
    fn intent(&self) -> OpenIntent {
        if self.write || self.create || self.truncate || self.append {
            OpenIntent::ReadWrite
        } else {
            OpenIntent::Read
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatFs {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub item_count: u64,
}

/// Process-wide wiring: owns every C1-C7 singleton and the background
/// threads that drive them. Constructed once per mounted volume.
pub struct DataPlane {
    data_dir: std::path::PathBuf,
    config: Mutex<Config>,
    metadata: Arc<MetadataStore>,
    table: Arc<OpenFileTable>,
    governor: Arc<CacheGovernor>,
    upload: Arc<UploadManager>,
    provider: Arc<dyn Provider>,
    stop: Arc<StopFlag>,
    handle_paths: Mutex<HashMap<u64, String>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl DataPlane {
    pub fn start(data_dir: std::path::PathBuf, provider: Arc<dyn Provider>) -> anyhow::Result<Arc<Self>> {
        let config = Config::load_or_default(&data_dir)?;
        let metadata = Arc::new(MetadataStore::open(&data_dir.join("db"))?);
        let governor = Arc::new(CacheGovernor::new(config.max_cache_size_bytes()));
        let stop = Arc::new(StopFlag::new());
        let upload = UploadManager::open(
            &data_dir.join("db"),
            config.max_upload_count(),
            metadata.clone(),
            provider.clone(),
            stop.clone(),
        )?;
        let table = Arc::new(OpenFileTable::new(
            data_dir.clone(),
            provider.clone(),
            governor.clone(),
            metadata.clone(),
            config.clone(),
        ));

        for entry in upload.resume_entries() {
            let _ = table.rehydrate_resume(
                &entry.api_path,
                std::path::PathBuf::from(&entry.source_path),
                metadata.get(&entry.api_path).map(|f| f.size).unwrap_or(0),
                entry.read_state,
            );
        }

        let plane = Arc::new(Self {
            data_dir: data_dir.clone(),
            config: Mutex::new(config.clone()),
            metadata,
            table,
            governor,
            upload,
            provider,
            stop,
            handle_paths: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
        });

        plane.spawn_background_threads(&config);
        Ok(plane)
    }

    fn spawn_background_threads(self: &Arc<Self>, config: &Config) {
        let mut threads = self.threads.lock();

        let upload = self.upload.clone();
        threads.push(
            std::thread::Builder::new()
                .name("upload-worker".into())
                .spawn(move || upload.run_worker())
                .expect("spawn upload worker"),
        );

        let scanner = EvictionScanner::new(
            self.data_dir.join("cache"),
            self.metadata.clone(),
            self.table.clone(),
            self.governor.clone(),
            self.stop.clone(),
            Duration::from_secs(config.eviction_delay_mins * 60),
            config.eviction_uses_accessed_time,
        );
        threads.push(
            std::thread::Builder::new()
                .name("eviction-scanner".into())
                .spawn(move || scanner.run())
                .expect("spawn eviction scanner"),
        );

        let idle_table = self.table.clone();
        let idle_stop = self.stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("openfile-idle-sweep".into())
                .spawn(move || {
                    while !idle_stop.wait_timeout(Duration::from_secs(1)) {
                        idle_table.sweep_idle();
                    }
                })
                .expect("spawn idle sweep"),
        );
    }

    pub fn shutdown(&self) {
        self.stop.stop();
        self.governor.stop();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn statfs(&self) -> StatFs {
        let config = self.config.lock();
        let (items, _) = self.metadata.stats();
        let used = self.governor.size();
        let total = config.max_cache_size_bytes();
        StatFs {
            total_bytes: total,
            used_bytes: used,
            free_bytes: total.saturating_sub(used),
            item_count: items,
        }
    }

    pub fn getattr(&self, path: &str) -> Result<ApiFile> {
        let path = normalize(path);
        self.metadata.get(&path).ok_or(DataPlaneError::NotFound)
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<ApiFile>> {
        let path = normalize(path);
        let item = self.metadata.get(&path).ok_or(DataPlaneError::NotFound)?;
        if !item.directory {
            return Err(DataPlaneError::IsFile);
        }
        Ok(self.metadata.list_children(&path))
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        if self.metadata.exists(&path) {
            return Err(DataPlaneError::Exists);
        }
        let parent = parent_of(&path);
        if !parent.is_empty() && !self.metadata.exists(&parent) {
            return Err(DataPlaneError::NotFound);
        }
        self.provider.mkdir(&path)?;
        self.metadata
            .put(ApiFile::new_dir(&path))
            .map_err(|e| DataPlaneError::IoError(e.to_string()))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let item = self.metadata.get(&path).ok_or(DataPlaneError::NotFound)?;
        if !item.directory {
            return Err(DataPlaneError::IsFile);
        }
        if !self.metadata.list_children(&path).is_empty() {
            return Err(DataPlaneError::DirectoryNotEmpty);
        }
        self.provider.rmdir(&path)?;
        self.metadata
            .remove(&path)
            .map(|_| ())
            .map_err(|e| DataPlaneError::IoError(e.to_string()))
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let item = self.metadata.get(&path).ok_or(DataPlaneError::NotFound)?;
        if item.directory {
            return Err(DataPlaneError::IsDirectory);
        }
        self.table.remove(&path);
        let _ = self.upload.remove_upload(&path);
        self.metadata
            .remove(&path)
            .map(|_| ())
            .map_err(|e| DataPlaneError::IoError(e.to_string()))
    }

    pub fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        if !self.provider.supports_rename() {
            return Err(DataPlaneError::NotSupported);
        }
        if !self.metadata.exists(&from) {
            return Err(DataPlaneError::NotFound);
        }
        if self.metadata.exists(&to) {
            if !overwrite {
                return Err(DataPlaneError::Exists);
            }
            if self.metadata.get(&to).unwrap().directory {
                return Err(DataPlaneError::IsDirectory);
            }
        }
        self.provider.rename(&from, &to)?;
        self.table.rename(&from, &to)?;
        self.metadata.rename(&from, &to)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, open_data))]
    pub fn open(&self, path: &str, flags: OpenFlags, open_data: OpenFileData) -> Result<u64> {
        let path = normalize(path);
        let item = match self.metadata.get(&path) {
            Some(item) => item,
            None if flags.create => {
                let item = ApiFile::new_file(&path);
                self.metadata
                    .put(item.clone())
                    .map_err(|e| DataPlaneError::IoError(e.to_string()))?;
                item
            }
            None => return Err(DataPlaneError::NotFound),
        };
        if item.directory && (flags.write || flags.truncate) {
            return Err(DataPlaneError::IsDirectory);
        }

        let (handle, open_file) = self.table.open(&path, flags.intent(), &item, open_data)?;
        self.handle_paths.lock().insert(handle, path.clone());

        // A cold open picks a fresh cache path the first time; persist it so
        // the eviction scanner and resume rehydration can find this file by
        // its on-disk location later.
        if item.source_path.is_empty() {
            if let Some(source_path) = open_file.strategy.source_path() {
                let mut item = item;
                item.source_path = source_path.to_string_lossy().into_owned();
                let _ = self.metadata.put(item);
            }
        }

        if flags.truncate {
            self.resize(handle, 0)?;
        }
        Ok(handle)
    }

    fn path_for(&self, handle: u64) -> Result<String> {
        self.handle_paths
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(DataPlaneError::InvalidOperation)
    }

    pub fn read(&self, handle: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.path_for(handle)?;
        let open_file = self.table.get(&path).ok_or(DataPlaneError::NotFound)?;
        open_file.touch();
        match open_file.strategy.read(offset, len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                open_file.set_sticky_error(e.clone());
                Err(e)
            }
        }
    }

    pub fn write(&self, handle: u64, offset: u64, buf: &[u8]) -> Result<usize> {
        let path = self.path_for(handle)?;
        let open_file = self.table.get(&path).ok_or(DataPlaneError::NotFound)?;
        open_file.touch();
        let written = open_file.strategy.write(offset, buf)?;
        let new_size = open_file.strategy.file_size();
        let mut fsi = open_file.fsi.lock();
        if fsi.size != new_size {
            fsi.size = new_size;
            let mut item = self.metadata.get(&path).unwrap_or_else(|| ApiFile::new_file(&path));
            item.size = new_size;
            item.modified = crate::metadata::now_nanos();
            let _ = self.metadata.put(item);
        }
        Ok(written)
    }

    pub fn resize(&self, handle: u64, new_size: u64) -> Result<()> {
        let path = self.path_for(handle)?;
        let open_file = self.table.get(&path).ok_or(DataPlaneError::NotFound)?;
        open_file.strategy.resize(new_size)?;
        open_file.fsi.lock().size = new_size;
        let mut item = self.metadata.get(&path).unwrap_or_else(|| ApiFile::new_file(&path));
        item.size = new_size;
        item.modified = crate::metadata::now_nanos();
        self.metadata
            .put(item)
            .map_err(|e| DataPlaneError::IoError(e.to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub fn release(&self, handle: u64) -> Result<()> {
        let Some(path) = self.handle_paths.lock().remove(&handle) else {
            // Idempotent: releasing an already-released handle is a no-op.
            return Ok(());
        };
        let Some(open_file) = self.table.get(&path) else {
            return Ok(());
        };

        let was_last = open_file.handle_count() == 1;
        let modified = open_file.is_modified();
        let source_path = open_file.strategy.source_path().map(|p| p.to_path_buf());

        self.table.release(&path, handle);

        if was_last && modified {
            if let Some(source_path) = source_path {
                self.upload
                    .queue_upload(&path, &source_path.to_string_lossy())
                    .map_err(|e| DataPlaneError::IoError(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::passthrough::PassthroughProvider;

    fn plane() -> (tempfile::TempDir, Arc<DataPlane>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(PassthroughProvider::new(dir.path().join("remote")).unwrap());
        let plane = DataPlane::start(dir.path().join("data"), provider).unwrap();
        (dir, plane)
    }

    #[test]
    fn create_write_read_back_then_release_queues_upload() {
        let (_dir, plane) = plane();
        let handle = plane
            .open(
                "/f.txt",
                OpenFlags {
                    write: true,
                    create: true,
                    ..Default::default()
                },
                Box::new(()),
            )
            .unwrap();

        plane.write(handle, 0, b"TestData").unwrap();
        let bytes = plane.read(handle, 0, 8).unwrap();
        assert_eq!(bytes, b"TestData");

        plane.release(handle).unwrap();
        assert_eq!(plane.getattr("/f.txt").unwrap().size, 8);
        assert!(plane.upload.pending_contains("/f.txt") || plane.upload.active_contains("/f.txt"));

        plane.shutdown();
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, plane) = plane();
        let handle = plane
            .open(
                "/f.txt",
                OpenFlags {
                    write: true,
                    create: true,
                    ..Default::default()
                },
                Box::new(()),
            )
            .unwrap();
        plane.release(handle).unwrap();
        assert!(plane.release(handle).is_ok());
        plane.shutdown();
    }

    #[test]
    fn mkdir_readdir_rmdir_round_trip() {
        let (_dir, plane) = plane();
        plane.mkdir("/d").unwrap();
        let entries = plane.readdir("/").unwrap();
        assert!(entries.iter().any(|e| e.api_path == "/d"));
        plane.rmdir("/d").unwrap();
        assert!(plane.getattr("/d").is_err());
        plane.shutdown();
    }

    #[test]
    fn getattr_on_missing_path_is_not_found() {
        let (_dir, plane) = plane();
        assert!(matches!(plane.getattr("/nope"), Err(DataPlaneError::NotFound)));
        plane.shutdown();
    }

    /// A cold read-only open picks a fresh cache path for its backing file;
    /// that path must land in metadata so the eviction scanner can match the
    /// file on disk back to this api_path later.
    #[test]
    fn cold_open_persists_chosen_source_path_in_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("r.bin"), b"hello").unwrap();
        let provider = Arc::new(PassthroughProvider::new(remote).unwrap());
        let plane = DataPlane::start(dir.path().join("data"), provider).unwrap();

        plane.metadata.put(ApiFile { size: 5, ..ApiFile::new_file("/r.bin") }).unwrap();
        assert!(plane.getattr("/r.bin").unwrap().source_path.is_empty());

        let handle = plane
            .open("/r.bin", OpenFlags { read: true, ..Default::default() }, Box::new(()))
            .unwrap();
        assert!(!plane.getattr("/r.bin").unwrap().source_path.is_empty());
        plane.release(handle).unwrap();
        plane.shutdown();
    }
}
