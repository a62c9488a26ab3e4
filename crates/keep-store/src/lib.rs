//! Durable metadata for the keep host: volumes, sector locations,
//! contracts, sector-root lists, chain cursors, and the host identity key.
//!
//! All state lives in an ordered key-value backend. The in-memory backend
//! serves tests and development; RocksDB (behind the `rocksdb` feature)
//! serves deployments. Multi-record mutations commit atomically through a
//! single write batch.

pub mod backend;
mod contracts;
pub mod error;
pub mod keys;
mod lock;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
mod store;
mod types;

pub use backend::{Batch, BatchOp, KvBackend};
pub use error::{Result, StoreError};
pub use lock::SectorLock;
pub use memory::MemoryBackend;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;
pub use store::{MetaStore, DB_VERSION, MIGRATE_BATCH_SIZE};
pub use types::{Contract, ContractStatus, RootDelta, SectorLocation, SectorMove, Slot, Volume};
