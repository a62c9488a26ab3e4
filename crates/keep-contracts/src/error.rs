use thiserror::Error;

use keep_store::StoreError;
use keep_types::FileContractId;

use crate::validation::RevisionError;

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("contract {0} not found")]
    ContractNotFound(FileContractId),

    #[error("revision rejected: {0}")]
    RevisionRejected(#[from] RevisionError),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("wallet could not fund transaction: {0}")]
    InsufficientFunds(String),

    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("transaction pool rejected set: {0}")]
    TPoolRejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] keep_storage::StorageError),

    #[error("invalid operation: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ContractError>;
