//! §4.2 full-file strategy: writable, chunk-downloaded into a persistent
//! backing file.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache_governor::CacheGovernor;
use crate::chunks::{self, ReadState, ReadStateSnapshot};
use crate::error::{DataPlaneError, Result};
use crate::provider::Provider;
use crate::stop::StopFlag;

use super::download::Coordinator;
use super::io_queue::{IoOutcome, IoQueue};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    file.read_exact_at(buf, offset)
}
#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn pread(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}
#[cfg(not(unix))]
fn pwrite(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

struct Shared {
    api_path: Mutex<String>,
    source_path: PathBuf,
    encryption_token: Option<String>,
    chunk_size: u64,
    file_size: AtomicU64,
    file: Mutex<File>,
    read_state: Mutex<ReadState>,
    modified: AtomicBool,
    provider: Arc<dyn Provider>,
    governor: Arc<CacheGovernor>,
    coordinator: Coordinator,
    stop: Arc<StopFlag>,
    sticky_error: Mutex<Option<DataPlaneError>>,
    prefetch_hint: Mutex<Option<u64>>,
    prefetch_cond: parking_lot::Condvar,
}

/// Owns the backing file, the I/O worker, and the background prefetcher for
/// one writable `OpenFile`. Dropping it (after `stop()`) joins both threads.
pub struct FullFileStrategy {
    shared: Arc<Shared>,
    io_queue: Arc<IoQueue>,
    io_worker: Option<std::thread::JoinHandle<()>>,
    prefetch_worker: Option<std::thread::JoinHandle<()>>,
}

impl FullFileStrategy {
    pub fn create(
        api_path: &str,
        source_path: PathBuf,
        file_size: u64,
        chunk_size: u64,
        read_state: Option<ReadStateSnapshot>,
        provider: Arc<dyn Provider>,
        governor: Arc<CacheGovernor>,
        encryption_token: Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = source_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&source_path)?;
        if file.metadata()?.len() != file_size {
            file.set_len(file_size)?;
        }
        let chunk_total = chunks::chunk_count(file_size, chunk_size) as usize;
        let read_state = match read_state {
            Some(snap) => {
                let mut rs: ReadState = snap.into();
                rs.resize(chunk_total);
                rs
            }
            None => ReadState::new(chunk_total),
        };

        let stop = Arc::new(StopFlag::new());
        let shared = Arc::new(Shared {
            api_path: Mutex::new(api_path.to_string()),
            source_path,
            encryption_token,
            chunk_size,
            file_size: AtomicU64::new(file_size),
            file: Mutex::new(file),
            read_state: Mutex::new(read_state),
            modified: AtomicBool::new(false),
            provider,
            governor,
            coordinator: Coordinator::new(),
            stop: stop.clone(),
            sticky_error: Mutex::new(None),
            prefetch_hint: Mutex::new(None),
            prefetch_cond: parking_lot::Condvar::new(),
        });

        let io_queue = IoQueue::new(stop.clone());
        let io_worker = io_queue.spawn_worker();

        let prefetch_shared = shared.clone();
        let prefetch_worker = std::thread::Builder::new()
            .name("openfile-prefetch".into())
            .spawn(move || prefetch_loop(prefetch_shared))?;

        Ok(Self {
            shared,
            io_queue,
            io_worker: Some(io_worker),
            prefetch_worker: Some(prefetch_worker),
        })
    }

    pub fn rename(&self, new_api_path: &str) {
        *self.shared.api_path.lock() = new_api_path.to_string();
    }

    pub fn source_path(&self) -> &std::path::Path {
        &self.shared.source_path
    }

    pub fn is_complete(&self) -> bool {
        self.shared.read_state.lock().all_set()
    }

    pub fn read_state_snapshot(&self) -> ReadStateSnapshot {
        (&*self.shared.read_state.lock()).into()
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let shared = self.shared.clone();
        match self
            .io_queue
            .submit(Box::new(move || do_read(&shared, offset, len)))?
        {
            IoOutcome::Read(bytes) => Ok(bytes),
            _ => unreachable!("read submission always returns IoOutcome::Read"),
        }
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let shared = self.shared.clone();
        let owned = buf.to_vec();
        match self
            .io_queue
            .submit(Box::new(move || do_write(&shared, offset, &owned)))?
        {
            IoOutcome::Written(n) => Ok(n),
            _ => unreachable!("write submission always returns IoOutcome::Written"),
        }
    }

    pub fn resize(&self, new_size: u64) -> Result<()> {
        let shared = self.shared.clone();
        match self
            .io_queue
            .submit(Box::new(move || do_resize(&shared, new_size)))?
        {
            IoOutcome::Resized => Ok(()),
            _ => unreachable!("resize submission always returns IoOutcome::Resized"),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.shared.file_size.load(Ordering::SeqCst)
    }

    pub fn is_modified(&self) -> bool {
        self.shared.modified.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.shared.stop.stop();
        self.io_queue.wake();
        self.shared.prefetch_cond.notify_all();
    }
}

impl Drop for FullFileStrategy {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.io_worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.prefetch_worker.take() {
            let _ = handle.join();
        }
    }
}

fn download_chunk(shared: &Shared, chunk_index: u64) -> Result<()> {
    if shared.read_state.lock().get(chunk_index as usize) {
        return Ok(());
    }
    let key = chunk_index;
    shared.coordinator.run_or_wait(key, || {
        if shared.stop.is_stopped() {
            return Err(DataPlaneError::DownloadStopped);
        }
        if shared.read_state.lock().get(chunk_index as usize) {
            return Ok(());
        }
        let file_size = shared.file_size.load(Ordering::SeqCst);
        let len = chunks::chunk_len(chunk_index, shared.chunk_size, file_size);
        if len == 0 {
            shared.read_state.lock().set(chunk_index as usize, true);
            return Ok(());
        }
        let api_path = shared.api_path.lock().clone();
        let chunk_offset = chunks::chunk_offset(chunk_index, shared.chunk_size);
        let bytes = shared
            .provider
            .read_range(&api_path, chunk_offset, len, shared.encryption_token.as_deref(), &shared.stop)
            .map_err(|e| {
                *shared.sticky_error.lock() = Some(e.clone());
                e
            })?;
        {
            let file = shared.file.lock();
            pwrite(&file, &bytes, chunk_offset).map_err(DataPlaneError::from)?;
        }
        shared.read_state.lock().set(chunk_index as usize, true);
        Ok(())
    })
}

fn do_read(shared: &Shared, offset: u64, len: u64) -> Result<IoOutcome> {
    if let Some(err) = shared.sticky_error.lock().clone() {
        return Err(err);
    }
    let file_size = shared.file_size.load(Ordering::SeqCst);
    let offset = offset.min(file_size);
    let len = len.min(file_size.saturating_sub(offset));
    if len == 0 {
        return Ok(IoOutcome::Read(Vec::new()));
    }

    for chunk in chunks::chunks_covering(offset, len, shared.chunk_size) {
        download_chunk(shared, chunk)?;
    }

    let mut buf = vec![0u8; len as usize];
    {
        let file = shared.file.lock();
        pread(&file, &mut buf, offset).map_err(DataPlaneError::from)?;
    }

    let last_chunk = chunks::chunk_index(offset + len - 1, shared.chunk_size);
    *shared.prefetch_hint.lock() = Some(last_chunk);
    shared.prefetch_cond.notify_all();

    Ok(IoOutcome::Read(buf))
}

fn do_write(shared: &Shared, offset: u64, buf: &[u8]) -> Result<IoOutcome> {
    shared.modified.store(true, Ordering::SeqCst);
    let write_len = buf.len() as u64;
    let current_size = shared.file_size.load(Ordering::SeqCst);
    let new_size = (offset + write_len).max(current_size);

    if new_size > current_size {
        grow(shared, new_size)?;
    }

    for chunk in chunks::chunks_covering(offset, write_len, shared.chunk_size) {
        let chunk_start = chunks::chunk_offset(chunk, shared.chunk_size);
        let chunk_len = chunks::chunk_len(chunk, shared.chunk_size, new_size);
        let covers_whole_chunk = offset <= chunk_start && offset + write_len >= chunk_start + chunk_len;
        if !covers_whole_chunk {
            download_chunk(shared, chunk)?;
        }
    }

    {
        let file = shared.file.lock();
        pwrite(&file, buf, offset).map_err(DataPlaneError::from)?;
    }

    for chunk in chunks::chunks_covering(offset, write_len, shared.chunk_size) {
        shared.read_state.lock().set(chunk as usize, true);
    }

    Ok(IoOutcome::Written(buf.len()))
}

fn grow(shared: &Shared, new_size: u64) -> Result<()> {
    let current_size = shared.file_size.load(Ordering::SeqCst);
    shared.governor.expand(new_size - current_size)?;
    {
        let file = shared.file.lock();
        file.set_len(new_size).map_err(DataPlaneError::from)?;
    }
    let new_chunk_total = chunks::chunk_count(new_size, shared.chunk_size) as usize;
    let old_chunk_total = chunks::chunk_count(current_size, shared.chunk_size) as usize;
    {
        let mut rs = shared.read_state.lock();
        rs.resize(new_chunk_total);
        // Newly created chunks beyond the old tail are known-zero.
        for i in old_chunk_total..new_chunk_total {
            rs.set(i, true);
        }
    }
    shared.file_size.store(new_size, Ordering::SeqCst);
    Ok(())
}

fn do_resize(shared: &Shared, new_size: u64) -> Result<IoOutcome> {
    shared.modified.store(true, Ordering::SeqCst);
    let current_size = shared.file_size.load(Ordering::SeqCst);
    if new_size == current_size {
        return Ok(IoOutcome::Resized);
    }
    if new_size > current_size {
        grow(shared, new_size)?;
        return Ok(IoOutcome::Resized);
    }

    shared.governor.shrink(current_size - new_size);
    {
        let file = shared.file.lock();
        file.set_len(new_size).map_err(DataPlaneError::from)?;
    }
    // Truncating drops the trailing bits outright and marks everything
    // within the new length present: the final chunk's bytes past
    // `new_size` are now unreachable, so there's nothing left to download.
    let new_chunk_total = chunks::chunk_count(new_size, shared.chunk_size) as usize;
    shared.read_state.lock().set_present_up_to(new_chunk_total);
    shared.file_size.store(new_size, Ordering::SeqCst);
    Ok(IoOutcome::Resized)
}

fn prefetch_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.is_stopped() {
            return;
        }
        let hint = {
            let mut hint = shared.prefetch_hint.lock();
            if hint.is_none() {
                shared
                    .prefetch_cond
                    .wait_for(&mut hint, std::time::Duration::from_millis(500));
            }
            hint.take()
        };
        let Some(last_read_chunk) = hint else {
            continue;
        };
        let next = last_read_chunk + 1;
        let total = chunks::chunk_count(shared.file_size.load(Ordering::SeqCst), shared.chunk_size);
        if next >= total {
            continue;
        }
        if shared.read_state.lock().get(next as usize) {
            continue;
        }
        let _ = download_chunk(&shared, next);
    }
}
