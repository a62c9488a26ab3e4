use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use keep_types::Hash256;

use crate::backend::{Batch, KvBackend};
use crate::error::{Result, StoreError};
use crate::keys;
use crate::lock::{LockTable, SectorLock};
use crate::types::{SectorLocation, SectorMove, Slot, Volume};

/// Current schema version. Migrations are forward-only.
pub const DB_VERSION: u32 = 1;

/// Number of moves planned per migration batch.
pub const MIGRATE_BATCH_SIZE: usize = 64;

/// The durable record of volumes, sector locations, contracts, and chain
/// cursors.
///
/// Every mutation touching more than one record is staged into a single
/// backend batch under the mutation mutex, so partial application is
/// impossible: a failed placement or migration callback rolls back by
/// dropping the batch. Sector locks are reference-counted in memory; the
/// on-disk lock table exists only for crash diagnostics and is cleared on
/// startup.
pub struct MetaStore {
    pub(crate) backend: Arc<dyn KvBackend>,
    pub(crate) mutation: Mutex<()>,
    pub(crate) locks: LockTable,
}

impl MetaStore {
    pub fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        let store = Self {
            backend,
            mutation: Mutex::new(()),
            locks: Arc::new(Mutex::new(Default::default())),
        };
        store.migrate()?;
        store.clear_lock_records()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        match self.backend.get(keys::DB_VERSION_KEY)? {
            None => {
                self.backend
                    .put(keys::DB_VERSION_KEY, &DB_VERSION.to_be_bytes())?;
                debug!(version = DB_VERSION, "initialized metadata schema");
                Ok(())
            }
            Some(raw) => {
                let mut buf = [0u8; 4];
                if raw.len() != 4 {
                    return Err(StoreError::Invalid("corrupt db_version record".into()));
                }
                buf.copy_from_slice(&raw);
                let version = u32::from_be_bytes(buf);
                if version > DB_VERSION {
                    return Err(StoreError::Invalid(format!(
                        "database version {version} is newer than supported version {DB_VERSION}"
                    )));
                }
                // Forward-only migrations slot in here as versions grow.
                Ok(())
            }
        }
    }

    fn clear_lock_records(&self) -> Result<()> {
        let stale = self.backend.scan_prefix(keys::LOCKED_PREFIX)?;
        if stale.is_empty() {
            return Ok(());
        }
        warn!(count = stale.len(), "clearing stale sector lock records");
        let mut batch = Batch::new();
        for (key, _) in stale {
            batch.delete(key);
        }
        self.backend.write(batch)
    }

    pub(crate) fn get_record<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_record<T: Serialize>(batch: &mut Batch, key: Vec<u8>, value: &T) -> Result<()> {
        batch.put(key, bincode::serialize(value)?);
        Ok(())
    }

    // ===== volumes =====

    pub fn volumes(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        self.backend.scan_prefix_while(keys::VOLUME_PREFIX, &mut |_, raw| {
            if let Ok(volume) = bincode::deserialize::<Volume>(raw) {
                volumes.push(volume);
            }
            true
        })?;
        Ok(volumes)
    }

    pub fn volume(&self, id: u32) -> Result<Volume> {
        self.get_record(&keys::volume_key(id))?
            .ok_or(StoreError::VolumeNotFound(id))
    }

    /// Registers a new volume with no slots. The volume starts unavailable;
    /// the caller grows it as the backing file is preallocated, then flips
    /// it available.
    pub fn add_volume(&self, local_path: &str, read_only: bool) -> Result<Volume> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let id = match self.backend.get(keys::NEXT_VOLUME_ID_KEY)? {
            Some(raw) if raw.len() == 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&raw);
                u32::from_be_bytes(buf)
            }
            _ => 1,
        };
        let volume = Volume {
            id,
            local_path: local_path.to_string(),
            read_only,
            available: false,
            total_sectors: 0,
            used_sectors: 0,
        };
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::volume_key(id), &volume)?;
        batch.put(keys::NEXT_VOLUME_ID_KEY.to_vec(), (id + 1).to_be_bytes().to_vec());
        self.backend.write(batch)?;
        debug!(volume = id, path = local_path, "added volume");
        Ok(volume)
    }

    /// Appends empty slots up to `new_total`.
    pub fn grow_volume(&self, id: u32, new_total: u64) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut volume = self.volume(id)?;
        if new_total <= volume.total_sectors {
            return Err(StoreError::Invalid(format!(
                "grow target {new_total} is not larger than current size {}",
                volume.total_sectors
            )));
        }
        let mut batch = Batch::new();
        for index in volume.total_sectors..new_total {
            Self::put_record(&mut batch, keys::slot_key(id, index), &Slot::default())?;
        }
        volume.total_sectors = new_total;
        Self::put_record(&mut batch, keys::volume_key(id), &volume)?;
        self.backend.write(batch)
    }

    /// Drops the trailing slots down to `new_total`. Fails with
    /// `VolumeNotEmpty` while any dropped slot is occupied.
    pub fn shrink_volume(&self, id: u32, new_total: u64) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut volume = self.volume(id)?;
        if new_total > volume.total_sectors {
            return Err(StoreError::Invalid(format!(
                "shrink target {new_total} exceeds current size {}",
                volume.total_sectors
            )));
        }

        let mut batch = Batch::new();
        let mut blocked = false;
        self.backend
            .scan_prefix_while(&keys::slot_prefix(id), &mut |key, raw| {
                let Some((_, index)) = keys::parse_slot_key(key) else {
                    return true;
                };
                if index < new_total {
                    return true;
                }
                match bincode::deserialize::<Slot>(raw) {
                    Ok(slot) if slot.root.is_some() => {
                        blocked = true;
                        false
                    }
                    _ => {
                        batch.delete(key.to_vec());
                        true
                    }
                }
            })?;
        if blocked {
            return Err(StoreError::VolumeNotEmpty(id));
        }
        volume.total_sectors = new_total;
        Self::put_record(&mut batch, keys::volume_key(id), &volume)?;
        self.backend.write(batch)
    }

    pub fn set_available(&self, id: u32, available: bool) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut volume = self.volume(id)?;
        volume.available = available;
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::volume_key(id), &volume)?;
        self.backend.write(batch)
    }

    pub fn set_read_only(&self, id: u32, read_only: bool) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut volume = self.volume(id)?;
        volume.read_only = read_only;
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::volume_key(id), &volume)?;
        self.backend.write(batch)
    }

    /// Deletes a volume record and its slots. Without `force` the volume
    /// must be empty.
    pub fn remove_volume(&self, id: u32, force: bool) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let volume = self.volume(id)?;
        if !force && volume.used_sectors != 0 {
            return Err(StoreError::VolumeNotEmpty(id));
        }
        let mut batch = Batch::new();
        self.backend
            .scan_prefix_while(&keys::slot_prefix(id), &mut |key, raw| {
                if let Ok(Slot { root: Some(root) }) = bincode::deserialize::<Slot>(raw) {
                    // Only reachable under force; drop the location too.
                    batch.delete(keys::sector_key(&root));
                }
                batch.delete(key.to_vec());
                true
            })?;
        batch.delete(keys::volume_key(id));
        self.backend.write(batch)
    }

    // ===== sectors =====

    /// First empty writable slot, lowest `(volume, index)` first.
    fn find_placement_slot(&self) -> Result<Option<(u32, u64)>> {
        for volume in self.volumes()? {
            if !volume.available || volume.read_only || volume.used_sectors >= volume.total_sectors
            {
                continue;
            }
            if let Some(slot) = self.find_empty_slot(volume.id, u64::MAX, &mut |_| true)? {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// First empty slot in `volume` with index below `limit` accepted by
    /// `accept`.
    fn find_empty_slot(
        &self,
        volume: u32,
        limit: u64,
        accept: &mut dyn FnMut(u64) -> bool,
    ) -> Result<Option<(u32, u64)>> {
        let mut found = None;
        self.backend
            .scan_prefix_while(&keys::slot_prefix(volume), &mut |key, raw| {
                let Some((_, index)) = keys::parse_slot_key(key) else {
                    return true;
                };
                if index >= limit {
                    return false;
                }
                match bincode::deserialize::<Slot>(raw) {
                    Ok(slot) if slot.root.is_none() && accept(index) => {
                        found = Some((volume, index));
                        false
                    }
                    _ => true,
                }
            })?;
        Ok(found)
    }

    /// Places `root` in the first available writable slot, or reports its
    /// existing location. `on_placed` runs inside the transaction, under
    /// the slot lock, so the caller can perform the physical write before
    /// the metadata commits; an error rolls the placement back.
    pub fn store_sector<F>(&self, root: Hash256, on_placed: F) -> Result<SectorLock>
    where
        F: FnOnce(&SectorLocation, bool) -> Result<()>,
    {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");

        if let Some(loc) = self.get_record::<SectorLocation>(&keys::sector_key(&root))? {
            let lock = self.lock_slot(loc.volume, loc.index);
            if let Err(err) = on_placed(&loc, true) {
                lock.release();
                return Err(err);
            }
            return Ok(lock);
        }

        let Some((volume_id, index)) = self.find_placement_slot()? else {
            return Err(StoreError::NotEnoughStorage);
        };
        let loc = SectorLocation {
            volume: volume_id,
            index,
            root,
        };
        let lock = self.lock_slot(volume_id, index);
        if let Err(err) = on_placed(&loc, false) {
            lock.release();
            return Err(err);
        }

        let mut volume = self.volume(volume_id)?;
        volume.used_sectors += 1;
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::slot_key(volume_id, index), &Slot { root: Some(root) })?;
        Self::put_record(&mut batch, keys::sector_key(&root), &loc)?;
        Self::put_record(&mut batch, keys::volume_key(volume_id), &volume)?;
        if let Err(err) = self.backend.write(batch) {
            lock.release();
            return Err(err);
        }
        Ok(lock)
    }

    /// Looks up a sector's location and pins it with a read lock.
    pub fn sector_location(&self, root: &Hash256) -> Result<(SectorLocation, SectorLock)> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let loc: SectorLocation = self
            .get_record(&keys::sector_key(root))?
            .ok_or(StoreError::SectorNotFound(*root))?;
        let lock = self.lock_slot(loc.volume, loc.index);
        Ok((loc, lock))
    }

    /// Clears a sector's slot. Fails while the slot is pinned by a live
    /// lock or the root is referenced by a contract or temp entry.
    pub fn remove_sector(&self, root: &Hash256) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let loc: SectorLocation = self
            .get_record(&keys::sector_key(root))?
            .ok_or(StoreError::SectorNotFound(*root))?;
        if SectorLock::is_locked(&self.locks, (loc.volume, loc.index)) {
            return Err(StoreError::SectorLocked(*root));
        }
        if self.sector_referenced(root)? {
            return Err(StoreError::SectorLocked(*root));
        }

        let mut volume = self.volume(loc.volume)?;
        volume.used_sectors = volume.used_sectors.saturating_sub(1);
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::slot_key(loc.volume, loc.index), &Slot::default())?;
        batch.delete(keys::sector_key(root));
        Self::put_record(&mut batch, keys::volume_key(loc.volume), &volume)?;
        self.backend.write(batch)
    }

    /// Whether any contract root list or temp entry still references
    /// `root`.
    fn sector_referenced(&self, root: &Hash256) -> Result<bool> {
        if self.backend.get(&keys::temp_key(root))?.is_some() {
            return Ok(true);
        }
        let mut referenced = false;
        self.backend.scan_prefix_while(keys::ROOTS_PREFIX, &mut |_, raw| {
            match bincode::deserialize::<Vec<Hash256>>(raw) {
                Ok(roots) if roots.contains(root) => {
                    referenced = true;
                    false
                }
                _ => true,
            }
        })?;
        Ok(referenced)
    }

    fn lock_slot(&self, volume: u32, index: u64) -> SectorLock {
        SectorLock::acquire(self.locks.clone(), self.backend.clone(), (volume, index))
    }

    // ===== migration =====

    /// Moves sectors out of `volume_id` at indices `>= min_index`, either
    /// into the head of the same volume or into other writable volumes.
    ///
    /// Moves are planned in batches; `on_batch` performs the physical
    /// copies before each batch's metadata commits, so every reported
    /// batch is durable even if a later one fails. Read-locked sectors are
    /// skipped. Returns the number of migrated sectors, or
    /// `NotEnoughStorage` once destinations run out.
    pub fn migrate_sectors<F>(
        &self,
        volume_id: u32,
        min_index: u64,
        mut on_batch: F,
    ) -> Result<usize>
    where
        F: FnMut(&[SectorMove]) -> Result<()>,
    {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut migrated = 0;
        loop {
            let sources = self.migration_sources(volume_id, min_index, MIGRATE_BATCH_SIZE)?;
            if sources.is_empty() {
                return Ok(migrated);
            }

            let mut moves: Vec<SectorMove> = Vec::with_capacity(sources.len());
            let mut exhausted = false;
            for from in sources {
                let taken: Vec<(u32, u64)> =
                    moves.iter().map(|m| (m.to.volume, m.to.index)).collect();
                match self.find_migration_slot(volume_id, min_index, &taken)? {
                    Some((volume, index)) => moves.push(SectorMove {
                        root: from.root,
                        from,
                        to: SectorLocation {
                            volume,
                            index,
                            root: from.root,
                        },
                    }),
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }

            if !moves.is_empty() {
                on_batch(&moves)?;
                self.commit_moves(&moves)?;
                migrated += moves.len();
                debug!(
                    volume = volume_id,
                    batch = moves.len(),
                    migrated,
                    "committed migration batch"
                );
            }
            if exhausted {
                return Err(StoreError::NotEnoughStorage);
            }
        }
    }

    /// Occupied, unlocked slots of `volume` at `index >= min_index`, in
    /// index order.
    fn migration_sources(
        &self,
        volume: u32,
        min_index: u64,
        limit: usize,
    ) -> Result<Vec<SectorLocation>> {
        let mut sources = Vec::new();
        self.backend
            .scan_prefix_while(&keys::slot_prefix(volume), &mut |key, raw| {
                let Some((_, index)) = keys::parse_slot_key(key) else {
                    return true;
                };
                if index < min_index {
                    return true;
                }
                if let Ok(Slot { root: Some(root) }) = bincode::deserialize::<Slot>(raw) {
                    if SectorLock::is_locked(&self.locks, (volume, index)) {
                        warn!(volume, index, %root, "skipping locked sector during migration");
                    } else {
                        sources.push(SectorLocation { volume, index, root });
                    }
                }
                sources.len() < limit
            })?;
        Ok(sources)
    }

    /// An empty destination slot: same volume below `min_index`, else the
    /// first fit in any other available writable volume. Slots in `taken`
    /// are already claimed by the current batch.
    fn find_migration_slot(
        &self,
        source_volume: u32,
        min_index: u64,
        taken: &[(u32, u64)],
    ) -> Result<Option<(u32, u64)>> {
        let mut accept_head =
            |index: u64| !taken.contains(&(source_volume, index));
        if let Some(slot) = self.find_empty_slot(source_volume, min_index, &mut accept_head)? {
            return Ok(Some(slot));
        }
        for volume in self.volumes()? {
            if volume.id == source_volume
                || !volume.available
                || volume.read_only
                || volume.used_sectors >= volume.total_sectors
            {
                continue;
            }
            let mut accept = |index: u64| !taken.contains(&(volume.id, index));
            if let Some(slot) = self.find_empty_slot(volume.id, u64::MAX, &mut accept)? {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn commit_moves(&self, moves: &[SectorMove]) -> Result<()> {
        let mut batch = Batch::new();
        // Per-volume used counters; a move within one volume is neutral.
        let mut volumes: std::collections::HashMap<u32, Volume> = Default::default();
        for mv in moves {
            Self::put_record(
                &mut batch,
                keys::slot_key(mv.from.volume, mv.from.index),
                &Slot::default(),
            )?;
            Self::put_record(
                &mut batch,
                keys::slot_key(mv.to.volume, mv.to.index),
                &Slot { root: Some(mv.root) },
            )?;
            Self::put_record(&mut batch, keys::sector_key(&mv.root), &mv.to)?;
            if mv.from.volume != mv.to.volume {
                for id in [mv.from.volume, mv.to.volume] {
                    if !volumes.contains_key(&id) {
                        volumes.insert(id, self.volume(id)?);
                    }
                }
                volumes
                    .get_mut(&mv.from.volume)
                    .expect("loaded above")
                    .used_sectors -= 1;
                volumes
                    .get_mut(&mv.to.volume)
                    .expect("loaded above")
                    .used_sectors += 1;
            }
        }
        for (id, volume) in &volumes {
            Self::put_record(&mut batch, keys::volume_key(*id), volume)?;
        }
        self.backend.write(batch)
    }

    // ===== temp sectors =====

    /// Records `root` as ephemeral until `expiration_height`.
    pub fn add_temp_sector(&self, root: &Hash256, expiration_height: u64) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::temp_key(root), &expiration_height)?;
        self.backend.write(batch)
    }

    /// Drops temp entries that expired at or before `height` and returns
    /// their roots so the caller can reclaim the slots.
    pub fn expire_temp_sectors(&self, height: u64) -> Result<Vec<Hash256>> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut expired = Vec::new();
        let mut batch = Batch::new();
        self.backend.scan_prefix_while(keys::TEMP_PREFIX, &mut |key, raw| {
            if let Ok(expiration) = bincode::deserialize::<u64>(raw) {
                if expiration <= height {
                    if let Some(root) = std::str::from_utf8(key)
                        .ok()
                        .and_then(|k| k.strip_prefix("temp:"))
                        .and_then(|h| Hash256::from_hex(h).ok())
                    {
                        expired.push(root);
                        batch.delete(key.to_vec());
                    }
                }
            }
            true
        })?;
        if !batch.is_empty() {
            self.backend.write(batch)?;
        }
        Ok(expired)
    }

    // ===== chain cursors =====

    /// Last consensus change applied by `subscriber`, if any.
    pub fn last_change(&self, subscriber: &str) -> Result<Option<keep_types::ChangeId>> {
        match self.backend.get(&keys::cursor_key(subscriber))? {
            Some(raw) if raw.len() == 32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(&raw);
                Ok(Some(keep_types::ChangeId::from_bytes(buf)))
            }
            Some(_) => Err(StoreError::Invalid("corrupt chain cursor".into())),
            None => Ok(None),
        }
    }

    pub fn set_last_change(&self, subscriber: &str, change: &keep_types::ChangeId) -> Result<()> {
        self.backend
            .put(&keys::cursor_key(subscriber), change.as_bytes())
    }

    // ===== host identity =====

    pub fn host_key_seed(&self) -> Result<Option<[u8; 32]>> {
        match self.backend.get(keys::HOST_KEY_KEY)? {
            Some(raw) if raw.len() == 32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(&raw);
                Ok(Some(buf))
            }
            Some(_) => Err(StoreError::Invalid("corrupt host key record".into())),
            None => Ok(None),
        }
    }

    pub fn set_host_key_seed(&self, seed: &[u8; 32]) -> Result<()> {
        self.backend.put(keys::HOST_KEY_KEY, seed)
    }
}
