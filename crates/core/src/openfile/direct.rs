//! §4.4 direct strategy: read-only, memory-backed sliding window.
//!
//! Structurally identical to the ring-buffer strategy except the "scratch"
//! is a `Vec` of in-memory buffers rather than a file, so there is no local
//! persistence at all. Used when even the ring-buffer's backing file
//! wouldn't fit, or the caller wants zero disk footprint.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::chunks;
use crate::error::{DataPlaneError, Result};
use crate::provider::Provider;
use crate::stop::StopFlag;

use super::download::Coordinator;
use super::ring_window::RingWindow;

pub const DEFAULT_RING_SIZE: u64 = 5;

struct Slots {
    window: RingWindow,
    tags: Vec<Option<u64>>,
    buffers: Vec<Vec<u8>>,
}

struct Shared {
    api_path: Mutex<String>,
    encryption_token: Option<String>,
    file_size: u64,
    chunk_size: u64,
    ring_size: u64,
    slots: Mutex<Slots>,
    cond: Condvar,
    provider: Arc<dyn Provider>,
    coordinator: Coordinator,
    stop: Arc<StopFlag>,
    sticky_error: Mutex<Option<DataPlaneError>>,
}

pub struct DirectStrategy {
    shared: Arc<Shared>,
    background: Option<std::thread::JoinHandle<()>>,
}

impl DirectStrategy {
    pub fn create(
        api_path: &str,
        file_size: u64,
        chunk_size: u64,
        ring_size: u64,
        provider: Arc<dyn Provider>,
        encryption_token: Option<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(ring_size >= 5, "ring_size must be at least 5");
        let total_chunks = chunks::chunk_count(file_size, chunk_size);
        let window = RingWindow::new(ring_size, total_chunks);
        let shared = Arc::new(Shared {
            api_path: Mutex::new(api_path.to_string()),
            encryption_token,
            file_size,
            chunk_size,
            ring_size,
            slots: Mutex::new(Slots {
                window,
                tags: vec![None; ring_size as usize],
                buffers: vec![Vec::new(); ring_size as usize],
            }),
            cond: Condvar::new(),
            provider,
            coordinator: Coordinator::new(),
            stop: Arc::new(StopFlag::new()),
            sticky_error: Mutex::new(None),
        });

        let bg_shared = shared.clone();
        let background = std::thread::Builder::new()
            .name("openfile-direct-reader".into())
            .spawn(move || background_loop(bg_shared))?;

        Ok(Self {
            shared,
            background: Some(background),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.shared.file_size
    }

    pub fn rename(&self, new_api_path: &str) {
        *self.shared.api_path.lock() = new_api_path.to_string();
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if let Some(err) = self.shared.sticky_error.lock().clone() {
            return Err(err);
        }
        let offset = offset.min(self.shared.file_size);
        let len = len.min(self.shared.file_size.saturating_sub(offset));
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut remaining = (offset, len);
        while remaining.1 > 0 {
            let (off, rem) = remaining;
            let chunk = chunks::chunk_index(off, self.shared.chunk_size);
            let chunk_off = chunks::chunk_offset(chunk, self.shared.chunk_size);
            let chunk_len = chunks::chunk_len(chunk, self.shared.chunk_size, self.shared.file_size);
            let within_off = off - chunk_off;
            let within_len = (chunk_len - within_off).min(rem);

            match read_one_chunk(&self.shared, chunk, within_off, within_len) {
                Ok(bytes) => {
                    out.extend_from_slice(&bytes);
                    remaining = (off + within_len, rem - within_len);
                }
                Err(DataPlaneError::InvalidRingBufferPosition) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub fn stop(&self) {
        self.shared.stop.stop();
        self.shared.cond.notify_all();
    }
}

impl Drop for DirectStrategy {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.background.take() {
            let _ = handle.join();
        }
    }
}

fn move_window(shared: &Shared, target_chunk: u64) {
    let mut slots = shared.slots.lock();
    let pos = slots.window.pos;
    if target_chunk > pos {
        slots.window.forward(target_chunk - pos);
    } else if target_chunk < pos {
        slots.window.reverse(pos - target_chunk);
    }
    shared.cond.notify_all();
}

fn read_one_chunk(shared: &Shared, chunk: u64, within_offset: u64, len: u64) -> Result<Vec<u8>> {
    move_window(shared, chunk);

    let slot = (chunk % shared.ring_size) as usize;
    let present = {
        let slots = shared.slots.lock();
        slots.tags[slot] == Some(chunk)
    };
    if !present {
        download_into_buffer(shared, chunk)?;
    }

    let slots = shared.slots.lock();
    if slots.tags[slot] != Some(chunk) || !slots.window.contains(chunk) {
        return Err(DataPlaneError::InvalidRingBufferPosition);
    }
    let start = within_offset as usize;
    let end = start + len as usize;
    Ok(slots.buffers[slot][start..end].to_vec())
}

fn download_into_buffer(shared: &Shared, chunk: u64) -> Result<()> {
    shared.coordinator.run_or_wait(chunk, || {
        if shared.stop.is_stopped() {
            return Err(DataPlaneError::DownloadStopped);
        }
        if !shared.slots.lock().window.contains(chunk) {
            return Err(DataPlaneError::InvalidRingBufferPosition);
        }
        let chunk_off = chunks::chunk_offset(chunk, shared.chunk_size);
        let chunk_len = chunks::chunk_len(chunk, shared.chunk_size, shared.file_size);
        let api_path = shared.api_path.lock().clone();
        let bytes = shared
            .provider
            .read_range(&api_path, chunk_off, chunk_len, shared.encryption_token.as_deref(), &shared.stop)
            .map_err(|e| {
                *shared.sticky_error.lock() = Some(e.clone());
                e
            })?;

        let mut slots = shared.slots.lock();
        if !slots.window.contains(chunk) {
            return Err(DataPlaneError::InvalidRingBufferPosition);
        }
        let slot = (chunk % shared.ring_size) as usize;
        slots.buffers[slot] = bytes;
        slots.tags[slot] = Some(chunk);
        Ok(())
    })
}

fn background_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.is_stopped() {
            return;
        }
        let next_missing = {
            let slots = shared.slots.lock();
            let w = slots.window;
            (w.pos..=w.end).find(|&c| slots.tags[(c % shared.ring_size) as usize] != Some(c))
        };
        match next_missing {
            Some(chunk) => {
                let _ = download_into_buffer(&shared, chunk);
            }
            None => {
                let mut guard = shared.slots.lock();
                shared
                    .cond
                    .wait_for(&mut guard, std::time::Duration::from_millis(500));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::passthrough::PassthroughProvider;

    #[test]
    fn read_matches_source_with_no_disk_footprint() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(PassthroughProvider::new(dir.path().join("remote")).unwrap());
        let scratch = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..40u64).map(|i| (i % 251) as u8).collect();
        std::fs::write(scratch.path(), &data).unwrap();
        provider
            .upload("/f.bin", scratch.path(), &StopFlag::new())
            .unwrap();

        let strategy = DirectStrategy::create("/f.bin", 40, 4, 5, provider, None).unwrap();
        let bytes = strategy.read(0, 8).unwrap();
        assert_eq!(bytes, &data[0..8]);
    }

    #[test]
    fn write_and_resize_are_not_part_of_the_contract() {
        // `DirectStrategy` intentionally has no write/resize methods: the
        // absence is the test.
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(PassthroughProvider::new(dir.path()).unwrap());
        let _ = DirectStrategy::create("/f.bin", 0, 4, 5, provider, None).unwrap();
    }
}
