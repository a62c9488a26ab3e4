use thiserror::Error;

use keep_store::StoreError;
use keep_types::Hash256;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sector {0} failed root verification")]
    SectorCorrupt(Hash256),

    #[error("sector has length {0}, expected 4 MiB")]
    InvalidSectorLength(usize),

    #[error("volume {0} is not available")]
    VolumeNotAvailable(u32),

    #[error("operation canceled")]
    Canceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
