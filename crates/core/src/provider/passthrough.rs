//! Reference `Provider`: an encrypt-pass-through local directory.
//!
//! No actual encryption is performed (there is no key-management surface in
//! scope here); the name matches the kind of back-end this adapter stands in
//! for. Grounded on `librqbit`'s `FilesystemStorage` (`storage/filesystem/fs.rs`):
//! a bounded LRU of open file handles, lazy open-on-miss, `set_len`-based
//! resize that skips the syscall when the size already matches.

use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// `read_at` on unix is a pread and needs no seek; on other platforms fall
/// back to seek+read under the same file lock.
#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{DataPlaneError, Result};
use crate::stop::StopFlag;

use super::{Provider, ProviderAttrs, ProviderEntry};

const DEFAULT_FILE_CACHE_CAPACITY: usize = 128;

pub struct PassthroughProvider {
    root: PathBuf,
    file_cache: Mutex<LruCache<PathBuf, Arc<Mutex<File>>>>,
}

impl PassthroughProvider {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            file_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_FILE_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    fn local_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Two-phase get-or-open: check cache under lock,
    /// release it before the blocking open, then re-check on insert.
    fn get_or_open(&self, local: &Path) -> Result<Arc<Mutex<File>>> {
        if let Some(file) = self.file_cache.lock().get(local) {
            return Ok(file.clone());
        }
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(local)?;
        let file = Arc::new(Mutex::new(file));
        let mut cache = self.file_cache.lock();
        if let Some(existing) = cache.get(local) {
            return Ok(existing.clone());
        }
        cache.put(local.to_path_buf(), file.clone());
        Ok(file)
    }

    fn evict(&self, local: &Path) {
        self.file_cache.lock().pop(local);
    }
}

fn modified_nanos(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        })
}

impl Provider for PassthroughProvider {
    #[tracing::instrument(skip(self))]
    fn list(&self, path: &str) -> Result<Vec<ProviderEntry>> {
        let local = self.local_path(path);
        let read_dir = std::fs::read_dir(&local).map_err(DataPlaneError::from)?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(DataPlaneError::from)?;
            let meta = entry.metadata().map_err(DataPlaneError::from)?;
            entries.push(ProviderEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                attrs: ProviderAttrs {
                    size: meta.len(),
                    directory: meta.is_dir(),
                    modified_nanos: modified_nanos(&meta),
                },
            });
        }
        Ok(entries)
    }

    fn head(&self, path: &str) -> Result<ProviderAttrs> {
        let local = self.local_path(path);
        let meta = std::fs::metadata(&local).map_err(DataPlaneError::from)?;
        Ok(ProviderAttrs {
            size: meta.len(),
            directory: meta.is_dir(),
            modified_nanos: modified_nanos(&meta),
        })
    }

    #[tracing::instrument(skip(self, stop), fields(offset, len))]
    fn read_range(&self, path: &str, offset: u64, len: u64, _token: Option<&str>, stop: &StopFlag) -> Result<Vec<u8>> {
        // No actual encryption is performed (there is no key-management
        // surface in scope here), so the token is accepted but unused.
        if stop.is_stopped() {
            return Err(DataPlaneError::DownloadStopped);
        }
        let local = self.local_path(path);
        let file = self.get_or_open(&local)?;
        let mut buf = vec![0u8; len as usize];
        let file = file.lock();
        let read = read_at(&file, &mut buf, offset).map_err(DataPlaneError::from)?;
        buf.truncate(read);
        Ok(buf)
    }

    #[tracing::instrument(skip(self, stop))]
    fn upload(&self, path: &str, source_path: &Path, stop: &StopFlag) -> Result<()> {
        if stop.is_stopped() {
            return Err(DataPlaneError::UploadStopped);
        }
        let local = self.local_path(path);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source_path, &local).map_err(DataPlaneError::from)?;
        self.evict(&local);
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(self.local_path(path)).map_err(DataPlaneError::from)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        let local = self.local_path(path);
        if std::fs::read_dir(&local)
            .map_err(DataPlaneError::from)?
            .next()
            .is_some()
        {
            return Err(DataPlaneError::DirectoryNotEmpty);
        }
        std::fs::remove_dir(&local).map_err(DataPlaneError::from)
    }

    fn supports_rename(&self) -> bool {
        true
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_local = self.local_path(from);
        let to_local = self.local_path(to);
        if let Some(parent) = to_local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.evict(&from_local);
        std::fs::rename(&from_local, &to_local).map_err(DataPlaneError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_then_read_range_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let provider = PassthroughProvider::new(root.path().join("remote")).unwrap();
        let stop = StopFlag::new();

        let scratch = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(scratch.path(), b"hello world").unwrap();

        provider.upload("/f.txt", scratch.path(), &stop).unwrap();
        let attrs = provider.head("/f.txt").unwrap();
        assert_eq!(attrs.size, 11);

        let data = provider.read_range("/f.txt", 6, 5, None, &stop).unwrap();
        assert_eq!(data, b"world");
    }

    #[test]
    fn read_range_stopped_returns_download_stopped() {
        let root = tempfile::tempdir().unwrap();
        let provider = PassthroughProvider::new(root.path()).unwrap();
        let stop = StopFlag::new();
        stop.stop();
        assert!(matches!(
            provider.read_range("/f.txt", 0, 1, None, &stop),
            Err(DataPlaneError::DownloadStopped)
        ));
    }

    #[test]
    fn rmdir_rejects_nonempty() {
        let root = tempfile::tempdir().unwrap();
        let provider = PassthroughProvider::new(root.path()).unwrap();
        provider.mkdir("/d").unwrap();
        let stop = StopFlag::new();
        let scratch = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(scratch.path(), b"x").unwrap();
        provider.upload("/d/f.txt", scratch.path(), &stop).unwrap();

        assert!(matches!(provider.rmdir("/d"), Err(DataPlaneError::DirectoryNotEmpty)));
    }

    #[test]
    fn rename_moves_file_and_evicts_cache() {
        let root = tempfile::tempdir().unwrap();
        let provider = PassthroughProvider::new(root.path()).unwrap();
        let stop = StopFlag::new();
        let scratch = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(scratch.path(), b"data").unwrap();
        provider.upload("/a.txt", scratch.path(), &stop).unwrap();

        provider.rename("/a.txt", "/b.txt").unwrap();
        assert!(provider.head("/a.txt").is_err());
        assert_eq!(provider.head("/b.txt").unwrap().size, 4);
    }
}
