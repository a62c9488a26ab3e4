use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use rand::RngCore;
use tokio_util::sync::CancellationToken;

use keep_merkle::SECTOR_SIZE;
use keep_store::{MemoryBackend, MetaStore, StoreError};
use keep_storage::{StorageError, VolumeManager};

fn open_manager() -> (Arc<MetaStore>, VolumeManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MetaStore::open(Arc::new(MemoryBackend::new())).unwrap());
    let manager = VolumeManager::new(store.clone(), 16).unwrap();
    (store, manager, dir)
}

fn random_sector() -> Vec<u8> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    rand::thread_rng().fill_bytes(&mut sector[..256]);
    sector
}

#[test]
fn add_write_remove_cycle() {
    let (_, manager, dir) = open_manager();
    let cancel = CancellationToken::new();

    let volume = manager
        .add_volume(dir.path().join("v1.dat"), 64, &cancel)
        .unwrap();
    assert_eq!(volume.total_sectors, 64);
    assert_eq!(volume.used_sectors, 0);
    assert!(volume.available);

    // Backing file length tracks the slot count exactly.
    let meta = std::fs::metadata(dir.path().join("v1.dat")).unwrap();
    assert_eq!(meta.len(), 64 * SECTOR_SIZE as u64);

    let sector = random_sector();
    let (root, release) = manager.write_sector(sector.clone()).unwrap();
    assert_eq!(manager.volume(volume.id).unwrap().used_sectors, 1);

    let (read, read_release) = manager.read_sector(&root).unwrap();
    assert_eq!(*read, sector);
    read_release.release();
    release.release();

    manager.remove_sector(&root).unwrap();
    assert_eq!(manager.volume(volume.id).unwrap().used_sectors, 0);

    manager.remove_volume(volume.id, false, &cancel).unwrap();
    assert!(manager.volumes().unwrap().is_empty());
    assert!(!dir.path().join("v1.dat").exists());
}

#[test]
fn remove_volume_with_data_needs_destination() {
    let (_, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    let volume = manager
        .add_volume(dir.path().join("v1.dat"), 8, &cancel)
        .unwrap();

    let (root, release) = manager.write_sector(random_sector()).unwrap();
    release.release();

    // The only volume holds data and there is nowhere to migrate it.
    let err = manager.remove_volume(volume.id, false, &cancel).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Store(StoreError::NotEnoughStorage)
    ));
    // The failed removal leaves the volume writable.
    assert!(!manager.volume(volume.id).unwrap().read_only);

    manager.remove_sector(&root).unwrap();
    manager.remove_volume(volume.id, false, &cancel).unwrap();
}

#[test]
fn write_is_idempotent() {
    let (_, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    let volume = manager
        .add_volume(dir.path().join("v1.dat"), 4, &cancel)
        .unwrap();

    let sector = random_sector();
    let (root1, release1) = manager.write_sector(sector.clone()).unwrap();
    let (root2, release2) = manager.write_sector(sector).unwrap();
    assert_eq!(root1, root2);
    assert_eq!(manager.volume(volume.id).unwrap().used_sectors, 1);
    release1.release();
    release2.release();
}

#[test]
fn shrink_migrates_tail_into_head() {
    let (store, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    let volume = manager
        .add_volume(dir.path().join("v1.dat"), 64, &cancel)
        .unwrap();

    let mut roots = Vec::new();
    for _ in 0..64 {
        let (root, release) = manager.write_sector(random_sector()).unwrap();
        release.release();
        roots.push(root);
    }

    // Full volume: shrinking must fail outright.
    let err = manager.resize_volume(volume.id, 48, &cancel).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Store(StoreError::NotEnoughStorage)
    ));

    // Free the first quarter, then shrink.
    for root in &roots[..16] {
        manager.remove_sector(root).unwrap();
    }
    manager.resize_volume(volume.id, 48, &cancel).unwrap();

    let resized = manager.volume(volume.id).unwrap();
    assert_eq!(resized.total_sectors, 48);
    assert_eq!(resized.used_sectors, 48);
    assert_eq!(
        std::fs::metadata(dir.path().join("v1.dat")).unwrap().len(),
        48 * SECTOR_SIZE as u64
    );

    // Every surviving root now lives below the new boundary, with its
    // bytes intact.
    for root in &roots[16..] {
        let (loc, release) = store.sector_location(root).unwrap();
        assert!(loc.index < 48);
        release.release();
        let (sector, release) = manager.read_sector(root).unwrap();
        assert_eq!(keep_merkle::sector_root(&sector), *root);
        release.release();
    }
}

#[test]
fn migration_to_smaller_volume_is_partial() {
    let (store, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    let v1 = manager
        .add_volume(dir.path().join("v1.dat"), 32, &cancel)
        .unwrap();
    let mut roots = BTreeSet::new();
    for _ in 0..32 {
        let (root, release) = manager.write_sector(random_sector()).unwrap();
        release.release();
        roots.insert(root);
    }

    let v2 = manager
        .add_volume(dir.path().join("v2.dat"), 8, &cancel)
        .unwrap();

    // Draining v1 can only partially succeed.
    let err = manager.remove_volume(v1.id, false, &cancel).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Store(StoreError::NotEnoughStorage)
    ));

    assert_eq!(manager.volume(v2.id).unwrap().used_sectors, 8);
    assert_eq!(manager.volume(v1.id).unwrap().used_sectors, 24);

    // The multiset of stored roots is preserved, and every sector still
    // reads back correctly from wherever it landed.
    for root in &roots {
        let (loc, release) = store.sector_location(root).unwrap();
        assert!(loc.volume == v1.id || loc.volume == v2.id);
        release.release();
        let (sector, release) = manager.read_sector(root).unwrap();
        assert_eq!(keep_merkle::sector_root(&sector), *root);
        release.release();
    }
}

#[test]
fn corrupt_sector_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(MetaStore::open(backend.clone()).unwrap());
    let cancel = CancellationToken::new();

    let path = dir.path().join("v1.dat");
    let root = {
        let manager = VolumeManager::new(store.clone(), 16).unwrap();
        manager.add_volume(&path, 4, &cancel).unwrap();
        let (root, release) = manager.write_sector(random_sector()).unwrap();
        release.release();
        root
    };

    // Flip a byte on disk behind the manager's back.
    {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();
    }

    // A fresh manager has a cold cache and must verify on read.
    let manager = VolumeManager::new(store, 16).unwrap();
    let err = manager.read_sector(&root).unwrap_err();
    assert!(matches!(err, StorageError::SectorCorrupt(_)));
}

#[test]
fn cache_serves_reads_but_still_locks() {
    let (store, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    manager
        .add_volume(dir.path().join("v1.dat"), 4, &cancel)
        .unwrap();

    let (root, release) = manager.write_sector(random_sector()).unwrap();
    release.release();
    assert_eq!(manager.cached_sectors(), 1);

    // While a cached read's lock is held, the sector cannot be removed.
    let (_, read_release) = manager.read_sector(&root).unwrap();
    assert!(matches!(
        store.remove_sector(&root),
        Err(StoreError::SectorLocked(_))
    ));
    read_release.release();
    manager.remove_sector(&root).unwrap();
}

#[test]
fn reading_unknown_root_fails() {
    let (_, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    manager
        .add_volume(dir.path().join("v1.dat"), 4, &cancel)
        .unwrap();

    let missing = keep_types::Hash256::from_bytes([0xaa; 32]);
    assert!(matches!(
        manager.read_sector(&missing).unwrap_err(),
        StorageError::Store(StoreError::SectorNotFound(_))
    ));
}

#[test]
fn cancellation_stops_preallocation() {
    let (_, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager
        .add_volume(dir.path().join("v1.dat"), 256, &cancel)
        .unwrap_err();
    assert!(matches!(err, StorageError::Canceled));

    // Partial progress is durable but the volume stays unavailable.
    let volumes = manager.volumes().unwrap();
    assert_eq!(volumes.len(), 1);
    assert!(!volumes[0].available);
}

#[test]
fn temp_sectors_are_reclaimed() {
    let (_, manager, dir) = open_manager();
    let cancel = CancellationToken::new();
    let volume = manager
        .add_volume(dir.path().join("v1.dat"), 4, &cancel)
        .unwrap();

    let (_, release) = manager.write_temp_sector(random_sector(), 100).unwrap();
    release.release();
    assert_eq!(manager.volume(volume.id).unwrap().used_sectors, 1);

    manager.expire_temp_sectors(99).unwrap();
    assert_eq!(manager.volume(volume.id).unwrap().used_sectors, 1);

    manager.expire_temp_sectors(100).unwrap();
    assert_eq!(manager.volume(volume.id).unwrap().used_sectors, 0);
}
