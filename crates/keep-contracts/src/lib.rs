//! Contract lifecycle management: the revision validator, the
//! per-contract state machine, the chain-driven action queue, and the
//! storage-proof builder.
//!
//! The manager owns no global state beyond the metadata store and the
//! storage engine it is handed; chain, transaction pool, wallet, and
//! settings are capability interfaces injected at construction.

pub mod actions;
pub mod error;
pub mod interfaces;
mod manager;
mod types;
pub mod validation;

pub use actions::{storage_proof_segment, ACTION_TIMEOUT, TXN_FEE_MULTIPLIER};
pub use error::{ContractError, Result};
pub use interfaces::{
    ChainManager, ChainUpdate, FundReservation, SettingsReporter, TransactionPool, Wallet,
};
pub use keep_store::{Contract, ContractStatus, RootDelta};
pub use manager::{
    ContractLock, ContractManager, FINAL_REVISION_MARGIN, MAX_BACKOFF_BLOCKS, REBROADCAST_STAGGER,
    SUBSCRIBER_NAME,
};
pub use types::{LifecycleAction, SignedRevision};
