//! §4.3 ring-buffer strategy: read-only, disk-backed sliding window.
//!
//! Scratch slots are validated by tag (see `ring_window.rs`) rather than by
//! eagerly clearing bits on every slide: a slot is only trusted for chunk
//! `c` if `tags[slot] == Some(c)`. A download that finishes after the window
//! has moved past its target chunk is discarded and the caller retries,
//! exactly as §4.3's "window invariant on a racing download" describes.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::chunks;
use crate::error::{DataPlaneError, Result};
use crate::provider::Provider;
use crate::stop::StopFlag;

use super::download::Coordinator;
use super::ring_window::RingWindow;

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

struct Slots {
    window: RingWindow,
    /// `tags[slot] == Some(c)` iff the scratch slot currently holds chunk `c`.
    tags: Vec<Option<u64>>,
}

struct Shared {
    api_path: Mutex<String>,
    encryption_token: Option<String>,
    file_size: u64,
    chunk_size: u64,
    ring_size: u64,
    scratch: Mutex<File>,
    slots: Mutex<Slots>,
    cond: Condvar,
    provider: Arc<dyn Provider>,
    coordinator: Coordinator,
    stop: Arc<StopFlag>,
    sticky_error: Mutex<Option<DataPlaneError>>,
}

pub struct RingBufferStrategy {
    shared: Arc<Shared>,
    background: Option<std::thread::JoinHandle<()>>,
}

impl RingBufferStrategy {
    pub fn create(
        api_path: &str,
        scratch_path: PathBuf,
        file_size: u64,
        chunk_size: u64,
        ring_size: u64,
        provider: Arc<dyn Provider>,
        encryption_token: Option<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(ring_size >= 5, "ring_size must be at least 5");
        if let Some(parent) = scratch_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let scratch = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&scratch_path)?;
        scratch.set_len(ring_size * chunk_size)?;

        let total_chunks = chunks::chunk_count(file_size, chunk_size);
        let window = RingWindow::new(ring_size, total_chunks);
        let shared = Arc::new(Shared {
            api_path: Mutex::new(api_path.to_string()),
            encryption_token,
            file_size,
            chunk_size,
            ring_size,
            scratch: Mutex::new(scratch),
            slots: Mutex::new(Slots {
                window,
                tags: vec![None; ring_size as usize],
            }),
            cond: Condvar::new(),
            provider,
            coordinator: Coordinator::new(),
            stop: Arc::new(StopFlag::new()),
            sticky_error: Mutex::new(None),
        });

        let bg_shared = shared.clone();
        let background = std::thread::Builder::new()
            .name("openfile-ring-reader".into())
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
            let within = (off - chunk_off, (chunk_len - (off - chunk_off)).min(rem));

            match read_one_chunk(&self.shared, chunk, within.0, within.1) {
                Ok(bytes) => {
                    out.extend_from_slice(&bytes);
                    remaining = (off + within.1, rem - within.1);
                }
                Err(DataPlaneError::InvalidRingBufferPosition) => {
                    // Window slid mid-download; retry the same chunk.
                    continue;
                }
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

impl Drop for RingBufferStrategy {
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
    let slid = if target_chunk > pos {
        slots.window.forward(target_chunk - pos)
    } else if target_chunk < pos {
        slots.window.reverse(pos - target_chunk)
    } else {
        false
    };
    if slid {
        tracing::trace!(target_chunk, "ring window slid");
    }
    shared.cond.notify_all();
}

/// Downloads `chunk` into the ring if needed, then returns `len` bytes
/// starting at `within_chunk_offset` inside it.
fn read_one_chunk(
    shared: &Shared,
    chunk: u64,
    within_chunk_offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    move_window(shared, chunk);

    let slot = chunk % shared.ring_size;
    let already_present = {
        let slots = shared.slots.lock();
        slots.tags[slot as usize] == Some(chunk)
    };
    if !already_present {
        download_into_ring(shared, chunk)?;
    }

    let slots = shared.slots.lock();
    if slots.tags[slot as usize] != Some(chunk) || !slots.window.contains(chunk) {
        return Err(DataPlaneError::InvalidRingBufferPosition);
    }
    drop(slots);

    let mut buf = vec![0u8; len as usize];
    let file = shared.scratch.lock();
    let slot_offset = slot * shared.chunk_size + within_chunk_offset;
    pread(&file, &mut buf, slot_offset).map_err(DataPlaneError::from)?;
    Ok(buf)
}

fn download_into_ring(shared: &Shared, chunk: u64) -> Result<()> {
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

        // Re-verify under the ring lock before committing: the window may
        // have slid while the network call was in flight.
        let mut slots = shared.slots.lock();
        if !slots.window.contains(chunk) {
            return Err(DataPlaneError::InvalidRingBufferPosition);
        }
        let slot = chunk % shared.ring_size;
        drop(slots);
        {
            let file = shared.scratch.lock();
            pwrite(&file, &bytes, slot * shared.chunk_size).map_err(DataPlaneError::from)?;
        }
        slots = shared.slots.lock();
        if !slots.window.contains(chunk) {
            return Err(DataPlaneError::InvalidRingBufferPosition);
        }
        slots.tags[slot as usize] = Some(chunk);
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
                let _ = download_into_ring(&shared, chunk);
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

    fn setup(file_size: u64, ring_size: u64, chunk_size: u64) -> (tempfile::TempDir, RingBufferStrategy) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(PassthroughProvider::new(dir.path().join("remote")).unwrap());
        let scratch = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
        std::fs::write(scratch.path(), &data).unwrap();
        provider
            .upload("/f.bin", scratch.path(), &StopFlag::new())
            .unwrap();

        let strategy = RingBufferStrategy::create(
            "/f.bin",
            dir.path().join("ring").join("f.bin"),
            file_size,
            chunk_size,
            ring_size,
            provider,
            None,
        )
        .unwrap();
        (dir, strategy)
    }

    #[test]
    fn sequential_read_of_two_chunks_matches_source() {
        let (_dir, strategy) = setup(40, 5, 4);
        let first = strategy.read(0, 4).unwrap();
        let second = strategy.read(4, 4).unwrap();
        let expected: Vec<u8> = (0..4u64).map(|i| (i % 251) as u8).collect();
        assert_eq!(first, expected);
        let expected2: Vec<u8> = (4..8u64).map(|i| (i % 251) as u8).collect();
        assert_eq!(second, expected2);
    }

    #[test]
    fn seek_backward_past_window_reloads_correct_bytes() {
        // ring_size = 5, chunk_size = 4 -> window holds 5 of 20 chunks.
        let (_dir, strategy) = setup(80, 5, 4);
        // advance to chunk 10 (offset 40), window becomes [6..10]
        let _ = strategy.read(40, 4).unwrap();
        // seek back to offset 0: window must slide to [0..4]
        let bytes = strategy.read(0, 4).unwrap();
        let expected: Vec<u8> = (0..4u64).map(|i| (i % 251) as u8).collect();
        assert_eq!(bytes, expected);
    }
}
