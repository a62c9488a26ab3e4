use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keep_merkle::{sector_root, SECTOR_SIZE};
use keep_store::{MetaStore, SectorLock, StoreError, Volume};
use keep_types::Hash256;

use crate::cache::SectorCache;
use crate::error::{Result, StorageError};
use crate::volume::VolumeFile;

/// Sectors preallocated per grow batch. Growth is cancelable between
/// batches; each committed batch is durable.
pub const GROW_BATCH_SIZE: u64 = 64;

/// Physical sector storage over one or more volume files, fronted by the
/// metadata store and an LRU sector cache.
pub struct VolumeManager {
    store: Arc<MetaStore>,
    files: RwLock<HashMap<u32, Arc<VolumeFile>>>,
    cache: SectorCache,
}

impl VolumeManager {
    /// Opens the backing file of every registered volume. A volume whose
    /// file cannot be opened is marked unavailable rather than failing
    /// startup.
    pub fn new(store: Arc<MetaStore>, cache_size: usize) -> Result<Self> {
        let mut files = HashMap::new();
        for volume in store.volumes()? {
            match VolumeFile::open(&volume.local_path) {
                Ok(file) => {
                    files.insert(volume.id, Arc::new(file));
                }
                Err(err) => {
                    error!(
                        volume = volume.id,
                        path = %volume.local_path,
                        %err,
                        "failed to open volume file; marking volume unavailable"
                    );
                    store.set_available(volume.id, false)?;
                }
            }
        }
        Ok(Self {
            store,
            files: RwLock::new(files),
            cache: SectorCache::new(cache_size),
        })
    }

    pub fn volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.store.volumes()?)
    }

    pub fn volume(&self, id: u32) -> Result<Volume> {
        Ok(self.store.volume(id)?)
    }

    pub fn set_read_only(&self, id: u32, read_only: bool) -> Result<()> {
        Ok(self.store.set_read_only(id, read_only)?)
    }

    fn volume_file(&self, id: u32) -> keep_store::Result<Arc<VolumeFile>> {
        let files = self.files.read().expect("volume map lock poisoned");
        files
            .get(&id)
            .cloned()
            .ok_or(StoreError::VolumeNotAvailable(id))
    }

    // ===== volume lifecycle =====

    /// Creates a volume file at `path` and preallocates `total_sectors`
    /// slots. The volume becomes available only once preallocation
    /// completes; cancellation leaves durable partial progress and the
    /// volume unavailable.
    pub fn add_volume<P: AsRef<Path>>(
        &self,
        path: P,
        total_sectors: u64,
        cancel: &CancellationToken,
    ) -> Result<Volume> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let volume = self.store.add_volume(&path_str, false)?;
        let file = match VolumeFile::create(path.as_ref()) {
            Ok(file) => Arc::new(file),
            Err(err) => {
                // Roll the registration back; nothing references it yet.
                self.store.remove_volume(volume.id, false)?;
                return Err(err.into());
            }
        };
        self.files
            .write()
            .expect("volume map lock poisoned")
            .insert(volume.id, file.clone());

        let mut current = 0;
        while current < total_sectors {
            if cancel.is_cancelled() {
                return Err(StorageError::Canceled);
            }
            let target = (current + GROW_BATCH_SIZE).min(total_sectors);
            file.resize(target)?;
            self.store.grow_volume(volume.id, target)?;
            current = target;
        }
        file.sync()?;
        self.store.set_available(volume.id, true)?;
        info!(volume = volume.id, path = %path_str, sectors = total_sectors, "added volume");
        Ok(self.store.volume(volume.id)?)
    }

    /// Grows or shrinks a volume to `new_total` slots. A shrink first
    /// migrates every sector above the target into the head of the volume
    /// or onto other volumes, batch by batch, then truncates the file.
    pub fn resize_volume(
        &self,
        id: u32,
        new_total: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let volume = self.store.volume(id)?;
        let file = self.volume_file(id)?;
        if new_total == volume.total_sectors {
            return Ok(());
        }

        if new_total > volume.total_sectors {
            let mut current = volume.total_sectors;
            while current < new_total {
                if cancel.is_cancelled() {
                    return Err(StorageError::Canceled);
                }
                let target = (current + GROW_BATCH_SIZE).min(new_total);
                file.resize(target)?;
                self.store.grow_volume(id, target)?;
                current = target;
            }
            file.sync()?;
            debug!(volume = id, sectors = new_total, "grew volume");
            return Ok(());
        }

        self.migrate_out(id, new_total, cancel)?;
        self.store.shrink_volume(id, new_total)?;
        file.resize(new_total)?;
        file.sync()?;
        debug!(volume = id, sectors = new_total, "shrank volume");
        Ok(())
    }

    /// Migrates a volume's sectors elsewhere and deletes it. Without
    /// `force` the removal fails if the rest of the cluster cannot absorb
    /// the data.
    pub fn remove_volume(&self, id: u32, force: bool, cancel: &CancellationToken) -> Result<()> {
        let volume = self.store.volume(id)?;
        // Freeze placement into the volume while it drains.
        self.store.set_read_only(id, true)?;
        match self.migrate_out(id, 0, cancel) {
            Ok(_) => {}
            Err(err) if force => {
                warn!(volume = id, %err, "force removing volume with unmigrated sectors");
            }
            Err(err) => {
                self.store.set_read_only(id, volume.read_only)?;
                return Err(err);
            }
        }
        if let Err(err) = self.store.remove_volume(id, force) {
            self.store.set_read_only(id, volume.read_only)?;
            return Err(err.into());
        }

        let removed = self
            .files
            .write()
            .expect("volume map lock poisoned")
            .remove(&id);
        if let Some(file) = removed {
            if let Err(err) = std::fs::remove_file(file.path()) {
                warn!(volume = id, path = %file.path().display(), %err, "failed to delete volume file");
            }
        }
        info!(volume = id, "removed volume");
        Ok(())
    }

    /// Migrates sectors at `index >= min_index` out of `volume_id`,
    /// copying and fsyncing each batch before its metadata commits.
    fn migrate_out(
        &self,
        volume_id: u32,
        min_index: u64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let result = self.store.migrate_sectors(volume_id, min_index, |moves| {
            if cancel.is_cancelled() {
                return Err(StoreError::Canceled);
            }
            let mut dirty: Vec<u32> = Vec::new();
            for mv in moves {
                let src = self.volume_file(mv.from.volume)?;
                let dst = self.volume_file(mv.to.volume)?;
                let sector = src.read_sector(mv.from.index)?;
                dst.write_sector(mv.to.index, &sector)?;
                if !dirty.contains(&mv.to.volume) {
                    dirty.push(mv.to.volume);
                }
            }
            for id in dirty {
                self.volume_file(id)?.sync()?;
            }
            Ok(())
        });
        match result {
            Ok(migrated) => Ok(migrated),
            Err(StoreError::Canceled) => Err(StorageError::Canceled),
            Err(err) => Err(err.into()),
        }
    }

    // ===== sector I/O =====

    /// Stores a sector, returning its root and a release handle. Writing
    /// the same sector twice returns the existing location and takes
    /// another reference on its lock.
    pub fn write_sector(&self, sector: Vec<u8>) -> Result<(Hash256, SectorLock)> {
        if sector.len() != SECTOR_SIZE {
            return Err(StorageError::InvalidSectorLength(sector.len()));
        }
        let root = sector_root(&sector);
        let lock = self.store.store_sector(root, |loc, exists| {
            if exists {
                return Ok(());
            }
            let file = self.volume_file(loc.volume)?;
            file.write_sector(loc.index, &sector)?;
            file.sync()?;
            Ok(())
        })?;
        self.cache.put(root, Arc::new(sector));
        Ok((root, lock))
    }

    /// Stores an ephemeral sector that may be reclaimed once
    /// `expiration_height` passes.
    pub fn write_temp_sector(
        &self,
        sector: Vec<u8>,
        expiration_height: u64,
    ) -> Result<(Hash256, SectorLock)> {
        let (root, lock) = self.write_sector(sector)?;
        self.store.add_temp_sector(&root, expiration_height)?;
        Ok((root, lock))
    }

    /// Reads a sector by root, verifying its bytes against the root. The
    /// returned lock pins the sector's slot until released.
    pub fn read_sector(&self, root: &Hash256) -> Result<(Arc<Vec<u8>>, SectorLock)> {
        if let Some(sector) = self.cache.get(root) {
            let (_, lock) = self.store.sector_location(root)?;
            return Ok((sector, lock));
        }

        let (loc, lock) = self.store.sector_location(root)?;
        let volume = self.store.volume(loc.volume)?;
        if !volume.available {
            lock.release();
            return Err(StorageError::VolumeNotAvailable(loc.volume));
        }
        let file = self.volume_file(loc.volume)?;
        let sector = file.read_sector(loc.index)?;
        if sector_root(&sector) != *root {
            lock.release();
            error!(
                %root,
                volume = loc.volume,
                index = loc.index,
                "sector failed root verification"
            );
            return Err(StorageError::SectorCorrupt(*root));
        }
        let sector = Arc::new(sector);
        self.cache.put(*root, sector.clone());
        Ok((sector, lock))
    }

    /// Frees a sector's slot. Fails while the sector is pinned or
    /// referenced by a contract.
    pub fn remove_sector(&self, root: &Hash256) -> Result<()> {
        self.store.remove_sector(root)?;
        self.cache.remove(root);
        Ok(())
    }

    /// Reclaims temp sectors whose expiration has passed. Sectors still
    /// pinned by a lock are left for the next sweep.
    pub fn expire_temp_sectors(&self, height: u64) -> Result<()> {
        for root in self.store.expire_temp_sectors(height)? {
            match self.store.remove_sector(&root) {
                Ok(()) => {
                    self.cache.remove(&root);
                    debug!(%root, "reclaimed expired temp sector");
                }
                Err(StoreError::SectorLocked(_)) => {
                    warn!(%root, "expired temp sector still pinned");
                }
                Err(StoreError::SectorNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Number of cached sectors; used by tests and metrics reporting.
    pub fn cached_sectors(&self) -> usize {
        self.cache.len()
    }
}
