use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not enough storage")]
    NotEnoughStorage,

    #[error("volume {0} is not empty")]
    VolumeNotEmpty(u32),

    #[error("volume {0} is not available")]
    VolumeNotAvailable(u32),

    #[error("volume {0} not found")]
    VolumeNotFound(u32),

    #[error("sector {0} not found")]
    SectorNotFound(keep_types::Hash256),

    #[error("sector {0} is locked")]
    SectorLocked(keep_types::Hash256),

    #[error("contract {0} not found")]
    ContractNotFound(keep_types::FileContractId),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("operation canceled")]
    Canceled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
