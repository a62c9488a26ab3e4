use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use keep_merkle::{meta_root, SECTOR_SIZE};
use keep_store::{Contract, ContractStatus, MetaStore, RootDelta};
use keep_storage::VolumeManager;
use keep_types::{
    FileContractId, FileContractRevision, Hash256, HostKey, PublicKey, Signature, Transaction,
    MAX_REVISION_NUMBER,
};

use crate::error::{ContractError, Result};
use crate::interfaces::{ChainManager, ChainUpdate, SettingsReporter, TransactionPool, Wallet};
use crate::types::{LifecycleAction, SignedRevision};
use crate::validation::{
    validate_clearing_revision, validate_formation, validate_renewal, validate_std_revision,
    RevisionError,
};

/// Cursor name under which the manager stores its chain position.
pub const SUBSCRIBER_NAME: &str = "contracts";

/// Blocks to wait after negotiation before rebroadcasting an unconfirmed
/// formation.
pub const REBROADCAST_STAGGER: u64 = 6;

/// Fee budget, in blocks before window start, for landing the final
/// revision.
pub const FINAL_REVISION_MARGIN: u64 = 6;

/// Cap, in blocks, on the exponential action-retry backoff.
pub const MAX_BACKOFF_BLOCKS: u64 = 144;

/// Tracks every file contract from formation through resolution,
/// coordinating the storage engine, the metadata store, and the injected
/// chain interfaces.
pub struct ContractManager {
    pub(crate) store: Arc<MetaStore>,
    pub(crate) storage: Arc<VolumeManager>,
    pub(crate) chain: Arc<dyn ChainManager>,
    pub(crate) tpool: Arc<dyn TransactionPool>,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) settings: Arc<dyn SettingsReporter>,
    host_key: HostKey,

    /// Per-contract mutexes serializing renter sessions and in-flight
    /// actions.
    contract_locks: Mutex<HashMap<FileContractId, Arc<tokio::sync::Mutex<()>>>>,
    /// Action retry bookkeeping: `(attempts, next eligible height)`.
    pub(crate) retries: Mutex<HashMap<FileContractId, (u32, u64)>>,
}

/// Exclusive access to one contract for the duration of a renter session
/// or lifecycle action. Dropping the lock unlocks the contract.
pub struct ContractLock {
    contract: Contract,
    _guard: OwnedMutexGuard<()>,
}

impl ContractLock {
    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    /// Releases the contract. Equivalent to dropping the lock.
    pub fn unlock(self) {}
}

impl ContractManager {
    /// Creates a manager, loading the host identity key from the store or
    /// generating and persisting one on first run.
    pub fn new(
        store: Arc<MetaStore>,
        storage: Arc<VolumeManager>,
        chain: Arc<dyn ChainManager>,
        tpool: Arc<dyn TransactionPool>,
        wallet: Arc<dyn Wallet>,
        settings: Arc<dyn SettingsReporter>,
    ) -> Result<Self> {
        let host_key = match store.host_key_seed()? {
            Some(seed) => HostKey::from_seed(seed),
            None => {
                let key = HostKey::generate();
                store.set_host_key_seed(&key.seed())?;
                info!(key = %key.public_key(), "generated host identity key");
                key
            }
        };
        Ok(Self {
            store,
            storage,
            chain,
            tpool,
            wallet,
            settings,
            host_key,
            contract_locks: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
        })
    }

    pub fn host_public_key(&self) -> PublicKey {
        self.host_key.public_key()
    }

    /// Signs a revision digest with the host identity key. Used by the
    /// session layer during negotiation.
    pub fn sign_revision(&self, revision: &FileContractRevision) -> Signature {
        self.host_key.sign(&revision.sig_hash())
    }

    pub fn contract(&self, id: &FileContractId) -> Result<Contract> {
        match self.store.contract(id) {
            Err(keep_store::StoreError::ContractNotFound(id)) => {
                Err(ContractError::ContractNotFound(id))
            }
            other => Ok(other?),
        }
    }

    pub fn sector_roots(&self, id: &FileContractId) -> Result<Vec<Hash256>> {
        Ok(self.store.sector_roots(id)?)
    }

    /// The cursor to resume the chain subscription from.
    pub fn chain_cursor(&self) -> Result<Option<keep_types::ChangeId>> {
        Ok(self.store.last_change(SUBSCRIBER_NAME)?)
    }

    fn contract_mutex(&self, id: FileContractId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.contract_locks.lock().expect("contract lock map poisoned");
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Locks a contract for exclusive use. At most one session or action
    /// holds a contract at a time.
    pub async fn lock_contract(&self, id: FileContractId) -> Result<ContractLock> {
        let mutex = self.contract_mutex(id);
        let guard = mutex.lock_owned().await;
        let contract = self.store.contract(&id)?;
        Ok(ContractLock {
            contract,
            _guard: guard,
        })
    }

    /// Validates proposed formation terms against the host's current
    /// settings and chain tip. Called by the session layer before it
    /// signs anything.
    pub async fn validate_formation_terms(
        &self,
        fc: &keep_types::FileContract,
        renter_key: PublicKey,
    ) -> Result<()> {
        let settings = self.settings.settings();
        if !settings.accepting_contracts {
            return Err(ContractError::Invalid(
                "host is not accepting contracts".into(),
            ));
        }
        let tip = self.chain.tip().await?;
        validate_formation(fc, self.host_public_key(), renter_key, tip.height, &settings)?;
        Ok(())
    }

    /// Validates proposed renewal terms against the contract being
    /// replaced and the host's current settings.
    pub async fn validate_renewal_terms(
        &self,
        existing_id: &FileContractId,
        renewal: &keep_types::FileContract,
        renter_key: PublicKey,
        renter_cost: keep_types::Currency,
        host_burn: keep_types::Currency,
    ) -> Result<()> {
        let settings = self.settings.settings();
        if !settings.accepting_contracts {
            return Err(ContractError::Invalid(
                "host is not accepting contracts".into(),
            ));
        }
        let existing = self.store.contract(existing_id)?;
        let tip = self.chain.tip().await?;
        validate_renewal(
            &existing.revision,
            renewal,
            self.host_public_key(),
            renter_key,
            renter_cost,
            host_burn,
            tip.height,
            &settings,
        )?;
        Ok(())
    }

    /// Accepts a freshly negotiated contract. The session layer has
    /// already validated formation against the host's settings; here the
    /// signatures and key set are checked before anything persists.
    pub fn add_contract(
        &self,
        revision: SignedRevision,
        formation_set: Vec<Transaction>,
        locked_collateral: keep_types::Currency,
        negotiation_height: u64,
    ) -> Result<()> {
        self.verify_signed_revision(&revision)?;
        let id = revision.revision.parent_id;
        let contract = Contract {
            id,
            revision: revision.revision,
            renter_signature: revision.renter_signature,
            host_signature: revision.host_signature,
            locked_collateral,
            negotiation_height,
            formation_set,
            confirmed_revision_number: 0u64.to_be_bytes(),
            formation_confirmed: false,
            resolution_confirmed: false,
            renewed_from: None,
            renewed_to: None,
            status: ContractStatus::Pending,
            error: None,
        };
        self.store.add_contract(&contract)?;
        info!(contract = %id, negotiation_height, "added contract");
        Ok(())
    }

    /// Accepts a renewal, linking it to the contract it replaces. The
    /// renewal inherits the replaced contract's sector roots.
    pub fn renew_contract(
        &self,
        renewal: SignedRevision,
        existing_id: &FileContractId,
        formation_set: Vec<Transaction>,
        locked_collateral: keep_types::Currency,
        negotiation_height: u64,
    ) -> Result<()> {
        self.verify_signed_revision(&renewal)?;
        let id = renewal.revision.parent_id;
        let contract = Contract {
            id,
            revision: renewal.revision,
            renter_signature: renewal.renter_signature,
            host_signature: renewal.host_signature,
            locked_collateral,
            negotiation_height,
            formation_set,
            confirmed_revision_number: 0u64.to_be_bytes(),
            formation_confirmed: false,
            resolution_confirmed: false,
            renewed_from: None,
            renewed_to: None,
            status: ContractStatus::Pending,
            error: None,
        };
        self.store.renew_contract(&contract, existing_id)?;
        info!(renewal = %id, existing = %existing_id, "renewed contract");
        Ok(())
    }

    /// Applies a renter-proposed revision together with its sector-root
    /// delta, returning the host's signature. The caller holds the
    /// contract lock; appended roots must already be stored.
    pub fn apply_revision(
        &self,
        lock: &mut ContractLock,
        revision: FileContractRevision,
        renter_signature: Signature,
        delta: RootDelta,
    ) -> Result<Signature> {
        let id = lock.contract.id;
        if lock.contract.status != ContractStatus::Active {
            return Err(ContractError::Invalid(format!(
                "contract {id} is not accepting revisions in state {:?}",
                lock.contract.status
            )));
        }
        if revision.revision_number == MAX_REVISION_NUMBER {
            // The sentinel is reserved for clearing revisions.
            return Err(ContractError::RevisionRejected(
                RevisionError::ReservedRevisionNumber,
            ));
        }
        validate_std_revision(&lock.contract.revision, &revision)?;

        // The revision's file commitment must match the root list it
        // claims to describe.
        let mut roots = self.store.sector_roots(&id)?;
        apply_delta_preview(&mut roots, &delta)?;
        if meta_root(&roots) != revision.file_merkle_root {
            return Err(ContractError::RevisionRejected(
                RevisionError::FileMerkleRootMismatch,
            ));
        }
        if revision.filesize != roots.len() as u64 * SECTOR_SIZE as u64 {
            return Err(ContractError::RevisionRejected(RevisionError::FilesizeMismatch));
        }

        let sig_hash = revision.sig_hash();
        self.renter_key(&revision)?
            .verify(&sig_hash, &renter_signature)
            .map_err(|_| ContractError::SignatureInvalid)?;
        let host_signature = self.host_key.sign(&sig_hash);

        self.store
            .revise_contract(&id, revision, renter_signature, host_signature, &delta)?;
        lock.contract = self.store.contract(&id)?;
        debug!(
            contract = %id,
            revision = lock.contract.revision.revision_number,
            "applied revision"
        );
        Ok(host_signature)
    }

    /// Applies a clearing revision, settling the contract cooperatively.
    pub fn apply_clearing_revision(
        &self,
        lock: &mut ContractLock,
        final_revision: FileContractRevision,
        renter_signature: Signature,
    ) -> Result<Signature> {
        let id = lock.contract.id;
        if lock.contract.status != ContractStatus::Active {
            return Err(ContractError::Invalid(format!(
                "contract {id} is not accepting revisions in state {:?}",
                lock.contract.status
            )));
        }
        validate_clearing_revision(&lock.contract.revision, &final_revision)?;

        let sig_hash = final_revision.sig_hash();
        self.renter_key(&final_revision)?
            .verify(&sig_hash, &renter_signature)
            .map_err(|_| ContractError::SignatureInvalid)?;
        let host_signature = self.host_key.sign(&sig_hash);

        self.store.update_contract_revision(
            &id,
            final_revision,
            renter_signature,
            host_signature,
        )?;
        lock.contract = self.store.contract(&id)?;
        info!(contract = %id, "accepted clearing revision");
        Ok(host_signature)
    }

    fn renter_key(&self, revision: &FileContractRevision) -> Result<PublicKey> {
        revision
            .unlock_conditions
            .public_keys
            .first()
            .copied()
            .ok_or_else(|| ContractError::Invalid("revision carries no renter key".into()))
    }

    fn verify_signed_revision(&self, signed: &SignedRevision) -> Result<()> {
        let keys = &signed.revision.unlock_conditions.public_keys;
        if keys.len() != 2 {
            return Err(ContractError::Invalid(
                "contract must carry exactly a renter and a host key".into(),
            ));
        }
        if keys[1] != self.host_key.public_key() {
            return Err(ContractError::Invalid(
                "contract host key does not match this host".into(),
            ));
        }
        let sig_hash = signed.revision.sig_hash();
        keys[0]
            .verify(&sig_hash, &signed.renter_signature)
            .map_err(|_| ContractError::SignatureInvalid)?;
        keys[1]
            .verify(&sig_hash, &signed.host_signature)
            .map_err(|_| ContractError::SignatureInvalid)?;
        Ok(())
    }

    /// Applies one consensus change: marks confirmations, advances the
    /// per-contract state machines, expires temp storage, and returns the
    /// lifecycle actions due at the new tip. Applying the same change
    /// twice is a no-op.
    pub fn process_chain_update(
        &self,
        update: &ChainUpdate,
    ) -> Result<Vec<(FileContractId, LifecycleAction)>> {
        if self.store.last_change(SUBSCRIBER_NAME)?.as_ref() == Some(&update.change_id) {
            return Ok(Vec::new());
        }
        let height = update.index.height;

        // Confirmations may name contracts this host no longer tracks;
        // those are skipped rather than failing the whole update.
        for id in &update.confirmed_formations {
            match self.store.set_contract_formation_confirmed(id) {
                Ok(()) => {}
                Err(keep_store::StoreError::ContractNotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
            let contract = self.store.contract(id)?;
            if contract.status == ContractStatus::Pending {
                self.store.set_contract_status(id, ContractStatus::Active)?;
            }
        }
        for (id, number) in &update.confirmed_revisions {
            match self.store.set_confirmed_revision_number(id, *number) {
                Ok(()) | Err(keep_store::StoreError::ContractNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        for id in &update.confirmed_resolutions {
            match self.store.set_contract_resolution_confirmed(id) {
                Ok(()) => {}
                Err(keep_store::StoreError::ContractNotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
            let contract = self.store.contract(id)?;
            if contract.status == ContractStatus::Active {
                self.store
                    .set_contract_status(id, ContractStatus::AwaitingProof)?;
            }
            let contract = self.store.contract(id)?;
            if contract.status == ContractStatus::AwaitingProof {
                self.store.set_contract_status(id, ContractStatus::Resolved)?;
            }
        }

        // Open proof windows and expire missed ones.
        for contract in self.store.contracts()? {
            if contract.status == ContractStatus::Active && height >= contract.revision.window_start
            {
                self.store
                    .set_contract_status(&contract.id, ContractStatus::AwaitingProof)?;
            }
        }
        for contract in self.store.contracts()? {
            if !contract.status.is_terminal()
                && !contract.resolution_confirmed
                && height >= contract.revision.window_end
            {
                warn!(contract = %contract.id, "proof window expired without resolution");
                self.store
                    .set_contract_status(&contract.id, ContractStatus::Failed)?;
                self.store.set_contract_error(
                    &contract.id,
                    "proof window expired without resolution".into(),
                )?;
            }
        }

        let mut actions = Vec::new();
        for contract in self
            .store
            .contracts_needing_formation_rebroadcast(height, REBROADCAST_STAGGER)?
        {
            actions.push((contract.id, LifecycleAction::BroadcastFormation));
        }
        for contract in self
            .store
            .contracts_awaiting_final_revision(height, FINAL_REVISION_MARGIN)?
        {
            actions.push((contract.id, LifecycleAction::BroadcastFinalRevision));
        }
        for contract in self.store.contracts_with_expiring_windows(height, height + 1)? {
            actions.push((contract.id, LifecycleAction::BroadcastResolution));
        }

        self.storage.expire_temp_sectors(height)?;
        self.store.set_last_change(SUBSCRIBER_NAME, &update.change_id)?;
        debug!(height, actions = actions.len(), "processed chain update");
        Ok(actions)
    }
}

/// Applies a root delta to a scratch copy of the list, mirroring the
/// store's application order, so the revision can be checked before
/// anything commits.
fn apply_delta_preview(roots: &mut Vec<Hash256>, delta: &RootDelta) -> Result<()> {
    for &(i, j) in &delta.swap {
        let len = roots.len() as u64;
        if i >= len || j >= len {
            return Err(ContractError::Invalid(format!(
                "swap indices ({i}, {j}) out of bounds for {len} roots"
            )));
        }
        roots.swap(i as usize, j as usize);
    }
    if let Some(new_len) = delta.trim {
        if new_len > roots.len() as u64 {
            return Err(ContractError::Invalid(format!(
                "trim to {new_len} exceeds current length {}",
                roots.len()
            )));
        }
        roots.truncate(new_len as usize);
    }
    roots.extend_from_slice(&delta.append);
    Ok(())
}
