pub mod contract;
pub mod currency;
pub mod encoding;
pub mod hash;
pub mod keys;
pub mod settings;
pub mod transaction;

pub use contract::{
    contract_unlock_conditions, FileContract, FileContractRevision, Output, UnlockConditions,
    RENTER_OUTPUT, HOST_OUTPUT, VOID_OUTPUT,
};
pub use currency::Currency;
pub use encoding::{Encode, Encoder};
pub use hash::{Address, BlockId, ChainIndex, ChangeId, FileContractId, Hash256};
pub use keys::{HostKey, PublicKey, Signature, SignatureError};
pub use settings::HostSettings;
pub use transaction::{
    CoveredFields, Segment, StorageProof, Transaction, TransactionSignature,
};

/// Sentinel revision number marking a clearing revision. A contract carrying
/// this revision number is settled cooperatively and accepts no further
/// revisions.
pub const MAX_REVISION_NUMBER: u64 = u64::MAX;
