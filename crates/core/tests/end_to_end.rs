//! Integration tests exercising the full `DataPlane` façade, covering the
//! end-to-end scenarios that no single module's unit tests reach on their
//! own: cache-pressure blocking-expand-then-evict, and resume-after-restart.

use std::sync::Arc;
use std::time::Duration;

use vaultfs_core::cache_governor::CacheGovernor;
use vaultfs_core::config::Config;
use vaultfs_core::eviction::EvictionScanner;
use vaultfs_core::facade::{DataPlane, OpenFlags};
use vaultfs_core::metadata::{ApiFile, MetadataStore};
use vaultfs_core::provider::passthrough::PassthroughProvider;
use vaultfs_core::stop::StopFlag;
use vaultfs_core::table::{OpenFileTable, OpenIntent};

fn write_remote_file(remote_root: &std::path::Path, name: &str, bytes: &[u8]) {
    let path = remote_root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn create_write_read_release_persists_size_in_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(PassthroughProvider::new(dir.path().join("remote")).unwrap());
    let plane = DataPlane::start(dir.path().join("data"), provider).unwrap();

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
    plane.shutdown();
}

#[test]
fn rename_then_read_from_new_path_returns_same_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(PassthroughProvider::new(dir.path().join("remote")).unwrap());
    let plane = DataPlane::start(dir.path().join("data"), provider).unwrap();

    let handle = plane
        .open(
            "/a.txt",
            OpenFlags {
                write: true,
                create: true,
                ..Default::default()
            },
            Box::new(()),
        )
        .unwrap();
    plane.write(handle, 0, b"payload").unwrap();
    plane.release(handle).unwrap();

    plane.rename("/a.txt", "/b.txt", false).unwrap();
    assert!(plane.getattr("/a.txt").is_err());

    let handle = plane
        .open("/b.txt", OpenFlags { read: true, ..Default::default() }, Box::new(()))
        .unwrap();
    let bytes = plane.read(handle, 0, 7).unwrap();
    assert_eq!(bytes, b"payload");
    plane.release(handle).unwrap();
    plane.shutdown();
}

/// §8 scenario 6: a resume entry whose backing file matches the persisted
/// size rehydrates transparently, and a read of an already-downloaded chunk
/// never touches the provider again. We approximate "never touches the
/// provider again" by deleting the remote copy after priming the local
/// cache: if rehydration had to re-download, the read would fail.
#[test]
fn resume_after_restart_serves_already_downloaded_chunk_without_provider() {
    let base = tempfile::tempdir().unwrap();
    let remote_root = base.path().join("remote");
    let data_dir = base.path().join("data");
    write_remote_file(&remote_root, "f.bin", &vec![7u8; 16]);

    let source_path = data_dir.join("cache").join("resume-test.bin");
    std::fs::create_dir_all(source_path.parent().unwrap()).unwrap();
    std::fs::write(&source_path, vec![7u8; 16]).unwrap();

    {
        let provider = Arc::new(PassthroughProvider::new(remote_root.clone()).unwrap());
        let plane = DataPlane::start(data_dir.clone(), provider).unwrap();
        let item = vaultfs_core::metadata::ApiFile {
            source_path: source_path.to_string_lossy().into_owned(),
            size: 16,
            ..vaultfs_core::metadata::ApiFile::new_file("/f.bin")
        };
        // Record the file in metadata and a fully-present resume entry so
        // the next start() rehydrates it.
        let metadata_dir = data_dir.join("db");
        let metadata = vaultfs_core::metadata::MetadataStore::open(&metadata_dir).unwrap();
        metadata.put(item).unwrap();
        drop(metadata);

        let upload_db = data_dir.join("db");
        let resume_json = upload_db.join("upload.json");
        let read_state = vaultfs_core::chunks::ReadStateSnapshot(vec![true, true, true, true]);
        let tables = serde_json::json!({
            "pending": [],
            "active": [],
            "resume": [{
                "api_path": "/f.bin",
                "source_path": source_path.to_string_lossy(),
                "chunk_size": 4u64,
                "read_state": read_state,
            }],
        });
        std::fs::write(&resume_json, serde_json::to_vec_pretty(&tables).unwrap()).unwrap();
        plane.shutdown();
    }

    // Remove the remote copy: any read that needs to fall back to the
    // provider will now fail.
    std::fs::remove_file(remote_root.join("f.bin")).unwrap();

    let provider = Arc::new(PassthroughProvider::new(remote_root).unwrap());
    let plane = DataPlane::start(data_dir, provider).unwrap();
    let handle = plane
        .open("/f.bin", OpenFlags { read: true, ..Default::default() }, Box::new(()))
        .unwrap();
    let bytes = plane.read(handle, 0, 16).unwrap();
    assert_eq!(bytes, vec![7u8; 16]);
    plane.release(handle).unwrap();
    plane.shutdown();
}

/// §8 scenario 4: cache pressure. `Config::max_cache_size_bytes` has a
/// 100 MiB floor (a production safety clamp, see DESIGN.md) that makes the
/// spec's illustrative "3K cache / 2K files" numbers impossible to drive
/// through the real `Config`/`DataPlane` path, and `EvictionScanner::run`'s
/// 30 second real-time period makes the background loop impractical to
/// exercise from a test. So this drives the same C1+C5+C7 composition
/// `table.rs` and `eviction.rs` already unit-test directly: a
/// `CacheGovernor`, `MetadataStore` and `OpenFileTable` wired together, with
/// `scan_once()` called explicitly instead of waiting on the real loop.
#[test]
fn cache_pressure_blocks_until_eviction_frees_space() {
    const FILE_SIZE: u64 = 8 * 1024 * 1024;
    const CACHE_MAX: u64 = 20 * 1024 * 1024;

    let base = tempfile::tempdir().unwrap();
    let remote_root = base.path().join("remote");
    std::fs::create_dir_all(&remote_root).unwrap();
    for name in ["one.bin", "two.bin", "three.bin"] {
        let f = std::fs::File::create(remote_root.join(name)).unwrap();
        f.set_len(FILE_SIZE).unwrap();
    }

    let data_dir = base.path().join("data");
    let cache_dir = data_dir.join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();

    let provider = Arc::new(PassthroughProvider::new(remote_root).unwrap());
    let metadata = Arc::new(MetadataStore::open(&data_dir.join("db")).unwrap());
    let governor = Arc::new(CacheGovernor::with_poll(CACHE_MAX, Duration::from_millis(20)));
    let table = Arc::new(OpenFileTable::new(
        data_dir.clone(),
        provider,
        governor.clone(),
        metadata.clone(),
        Config::default(),
    ));

    // Open, fully download and close both files that fit: 16 MiB used of a
    // 20 MiB budget, 4 MiB free.
    for name in ["/one.bin", "/two.bin"] {
        let item = ApiFile { size: FILE_SIZE, ..ApiFile::new_file(name) };
        metadata.put(item.clone()).unwrap();
        let (handle, open_file) = table.open(name, OpenIntent::Read, &item, Box::new(())).unwrap();
        open_file.strategy.read(0, FILE_SIZE).unwrap();
        // Persist the cache path the strategy picked, the way the façade
        // does on a cold open, so the scanner can find this file later.
        let mut item = item;
        item.source_path = open_file.strategy.source_path().unwrap().to_string_lossy().into_owned();
        metadata.put(item).unwrap();
        table.release(name, handle);
        assert!(table.get(name).is_none());
    }
    assert_eq!(governor.size(), 2 * FILE_SIZE);

    let third = ApiFile { size: FILE_SIZE, ..ApiFile::new_file("/three.bin") };
    metadata.put(third.clone()).unwrap();

    // Third open doesn't fit: it blocks inside `governor.expand` on a
    // background thread until eviction frees space.
    let table2 = table.clone();
    let blocked_open = std::thread::spawn(move || {
        table2.open("/three.bin", OpenIntent::Read, &third, Box::new(()))
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(!blocked_open.is_finished());

    let scanner = EvictionScanner::new(
        cache_dir,
        metadata,
        table.clone(),
        governor.clone(),
        Arc::new(StopFlag::new()),
        Duration::ZERO,
        false,
    );
    scanner.scan_once();

    let (handle, open_file) = blocked_open.join().unwrap().unwrap();
    let bytes = open_file.strategy.read(0, 1).unwrap();
    assert_eq!(bytes.len(), 1);
    table.release("/three.bin", handle);
    assert_eq!(governor.size(), FILE_SIZE);
}
