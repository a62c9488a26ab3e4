//! Capability interfaces for the external collaborators the contract
//! manager depends on. Implementations are injected at construction;
//! tests swap in stubs.

use async_trait::async_trait;

use keep_types::{
    ChainIndex, ChangeId, CoveredFields, Currency, FileContractId, Hash256, HostSettings,
    Transaction,
};

use crate::error::Result;

/// Read access to the best chain.
#[async_trait]
pub trait ChainManager: Send + Sync {
    async fn tip(&self) -> Result<ChainIndex>;

    /// The chain index at `height` on the best chain.
    async fn index_at_height(&self, height: u64) -> Result<ChainIndex>;
}

/// Transaction relay and fee estimation.
#[async_trait]
pub trait TransactionPool: Send + Sync {
    async fn accept_transaction_set(&self, txns: Vec<Transaction>) -> Result<()>;

    /// `(minimum, maximum)` fee per byte currently recommended.
    async fn fee_estimation(&self) -> Result<(Currency, Currency)>;
}

/// A wallet's claim on the UTXOs backing a funded transaction. Dropping
/// the reservation returns them to the pool; wallets release spent inputs
/// on confirmation regardless.
pub trait FundReservation: Send {}

/// Transaction funding and signing.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Adds inputs (and change) worth `amount` to `txn`. Returns the ids
    /// to sign and a scoped reservation on the consumed UTXOs.
    async fn fund_transaction(
        &self,
        txn: &mut Transaction,
        amount: Currency,
    ) -> Result<(Vec<Hash256>, Box<dyn FundReservation>)>;

    async fn sign_transaction(
        &self,
        txn: &mut Transaction,
        to_sign: Vec<Hash256>,
        covered: CoveredFields,
    ) -> Result<()>;
}

/// The host's current advertised terms.
pub trait SettingsReporter: Send + Sync {
    fn settings(&self) -> HostSettings;
}

/// A batched view of what a consensus change did to the contracts the
/// host cares about. Produced by the chain manager's subscription and fed
/// to [`crate::ContractManager::process_chain_update`].
#[derive(Debug, Clone, Default)]
pub struct ChainUpdate {
    pub change_id: ChangeId,
    /// New chain tip after the change.
    pub index: ChainIndex,
    pub confirmed_formations: Vec<FileContractId>,
    pub confirmed_resolutions: Vec<FileContractId>,
    /// `(contract, revision_number)` pairs seen on chain.
    pub confirmed_revisions: Vec<(FileContractId, u64)>,
}
