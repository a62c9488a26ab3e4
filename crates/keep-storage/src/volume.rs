use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keep_merkle::SECTOR_SIZE;

/// One open volume file. Slot `i` lives at byte offset `i * SECTOR_SIZE`;
/// the file handle is shared behind a mutex so concurrent readers and the
/// writer serialize their seeks.
pub struct VolumeFile {
    file: Mutex<File>,
    path: PathBuf,
}

impl VolumeFile {
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_sector(&self, index: u64) -> std::io::Result<Vec<u8>> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        let mut file = self.file.lock().expect("volume file lock poisoned");
        file.seek(SeekFrom::Start(index * SECTOR_SIZE as u64))?;
        file.read_exact(&mut sector)?;
        Ok(sector)
    }

    pub fn write_sector(&self, index: u64, sector: &[u8]) -> std::io::Result<()> {
        debug_assert_eq!(sector.len(), SECTOR_SIZE);
        let mut file = self.file.lock().expect("volume file lock poisoned");
        file.seek(SeekFrom::Start(index * SECTOR_SIZE as u64))?;
        file.write_all(sector)
    }

    /// Resizes the backing file to hold exactly `total_sectors` slots.
    pub fn resize(&self, total_sectors: u64) -> std::io::Result<()> {
        let file = self.file.lock().expect("volume file lock poisoned");
        file.set_len(total_sectors * SECTOR_SIZE as u64)
    }

    pub fn sync(&self) -> std::io::Result<()> {
        let file = self.file.lock().expect("volume file lock poisoned");
        file.sync_all()
    }

    pub fn len(&self) -> std::io::Result<u64> {
        let file = self.file.lock().expect("volume file lock poisoned");
        Ok(file.metadata()?.len())
    }
}
