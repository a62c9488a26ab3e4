use tracing::debug;

use keep_types::{FileContractId, FileContractRevision, Hash256, Signature, Transaction};

use crate::backend::Batch;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::MetaStore;
use crate::types::{Contract, ContractStatus, RootDelta};

impl MetaStore {
    pub fn contract(&self, id: &FileContractId) -> Result<Contract> {
        self.get_record(&keys::contract_key(id))?
            .ok_or(StoreError::ContractNotFound(*id))
    }

    pub fn contracts(&self) -> Result<Vec<Contract>> {
        let mut contracts = Vec::new();
        self.backend
            .scan_prefix_while(keys::CONTRACT_PREFIX, &mut |_, raw| {
                if let Ok(contract) = bincode::deserialize::<Contract>(raw) {
                    contracts.push(contract);
                }
                true
            })?;
        Ok(contracts)
    }

    /// Persists a newly negotiated contract and its empty root list.
    pub fn add_contract(&self, contract: &Contract) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        if self.backend.get(&keys::contract_key(&contract.id))?.is_some() {
            return Err(StoreError::AlreadyExists(contract.id.to_string()));
        }
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::contract_key(&contract.id), contract)?;
        Self::put_record(&mut batch, keys::roots_key(&contract.id), &Vec::<Hash256>::new())?;
        self.backend.write(batch)?;
        debug!(contract = %contract.id, "added contract");
        Ok(())
    }

    /// Persists a renewal and links it to the contract it replaces.
    pub fn renew_contract(&self, renewal: &Contract, existing_id: &FileContractId) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut existing = self.contract(existing_id)?;
        if self.backend.get(&keys::contract_key(&renewal.id))?.is_some() {
            return Err(StoreError::AlreadyExists(renewal.id.to_string()));
        }
        let existing_roots: Vec<Hash256> = self
            .get_record(&keys::roots_key(existing_id))?
            .unwrap_or_default();

        let mut renewal = renewal.clone();
        renewal.renewed_from = Some(*existing_id);
        existing.renewed_to = Some(renewal.id);

        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::contract_key(&renewal.id), &renewal)?;
        // The renewal carries the existing file; it inherits the root list.
        Self::put_record(&mut batch, keys::roots_key(&renewal.id), &existing_roots)?;
        Self::put_record(&mut batch, keys::contract_key(existing_id), &existing)?;
        self.backend.write(batch)?;
        debug!(renewal = %renewal.id, existing = %existing_id, "renewed contract");
        Ok(())
    }

    /// Commits a revision together with its sector-root delta in one
    /// transaction, so the root list and the file Merkle root a renter
    /// observes can never diverge.
    pub fn revise_contract(
        &self,
        id: &FileContractId,
        revision: FileContractRevision,
        renter_signature: Signature,
        host_signature: Signature,
        delta: &RootDelta,
    ) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut contract = self.contract(id)?;
        let mut roots: Vec<Hash256> = self.get_record(&keys::roots_key(id))?.unwrap_or_default();
        apply_delta(&mut roots, delta)?;

        contract.revision = revision;
        contract.renter_signature = renter_signature;
        contract.host_signature = host_signature;

        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::contract_key(id), &contract)?;
        Self::put_record(&mut batch, keys::roots_key(id), &roots)?;
        self.backend.write(batch)
    }

    /// Revision update with no change to the root list.
    pub fn update_contract_revision(
        &self,
        id: &FileContractId,
        revision: FileContractRevision,
        renter_signature: Signature,
        host_signature: Signature,
    ) -> Result<()> {
        self.revise_contract(id, revision, renter_signature, host_signature, &RootDelta::default())
    }

    pub fn sector_roots(&self, id: &FileContractId) -> Result<Vec<Hash256>> {
        if self.backend.get(&keys::contract_key(id))?.is_none() {
            return Err(StoreError::ContractNotFound(*id));
        }
        Ok(self.get_record(&keys::roots_key(id))?.unwrap_or_default())
    }

    /// Appends roots starting at `from_index`, which must equal the
    /// current list length.
    pub fn append_sector_roots(
        &self,
        id: &FileContractId,
        new_roots: &[Hash256],
        from_index: u64,
    ) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        if self.backend.get(&keys::contract_key(id))?.is_none() {
            return Err(StoreError::ContractNotFound(*id));
        }
        let mut roots: Vec<Hash256> = self.get_record(&keys::roots_key(id))?.unwrap_or_default();
        if from_index != roots.len() as u64 {
            return Err(StoreError::Invalid(format!(
                "append at index {from_index}, expected {}",
                roots.len()
            )));
        }
        roots.extend_from_slice(new_roots);
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::roots_key(id), &roots)?;
        self.backend.write(batch)
    }

    pub fn trim_sector_roots(&self, id: &FileContractId, new_len: u64) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        if self.backend.get(&keys::contract_key(id))?.is_none() {
            return Err(StoreError::ContractNotFound(*id));
        }
        let mut roots: Vec<Hash256> = self.get_record(&keys::roots_key(id))?.unwrap_or_default();
        if new_len > roots.len() as u64 {
            return Err(StoreError::Invalid(format!(
                "trim to {new_len} exceeds current length {}",
                roots.len()
            )));
        }
        roots.truncate(new_len as usize);
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::roots_key(id), &roots)?;
        self.backend.write(batch)
    }

    pub fn swap_sector_roots(&self, id: &FileContractId, i: u64, j: u64) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        if self.backend.get(&keys::contract_key(id))?.is_none() {
            return Err(StoreError::ContractNotFound(*id));
        }
        let mut roots: Vec<Hash256> = self.get_record(&keys::roots_key(id))?.unwrap_or_default();
        swap_roots(&mut roots, i, j)?;
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::roots_key(id), &roots)?;
        self.backend.write(batch)
    }

    /// Advances the contract's lifecycle state, enforcing the state
    /// machine.
    pub fn set_contract_status(&self, id: &FileContractId, status: ContractStatus) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut contract = self.contract(id)?;
        if contract.status == status {
            return Ok(());
        }
        if !contract.status.can_transition_to(&status) {
            return Err(StoreError::Invalid(format!(
                "contract {id} cannot transition from {:?} to {status:?}",
                contract.status
            )));
        }
        debug!(contract = %id, from = ?contract.status, to = ?status, "contract state transition");
        contract.status = status;
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::contract_key(id), &contract)?;
        self.backend.write(batch)
    }

    pub fn set_contract_formation_confirmed(&self, id: &FileContractId) -> Result<()> {
        self.update_contract(id, |contract| {
            contract.formation_confirmed = true;
        })
    }

    pub fn set_contract_resolution_confirmed(&self, id: &FileContractId) -> Result<()> {
        self.update_contract(id, |contract| {
            contract.resolution_confirmed = true;
        })
    }

    pub fn set_confirmed_revision_number(&self, id: &FileContractId, number: u64) -> Result<()> {
        self.update_contract(id, |contract| {
            contract.set_confirmed_revision(number);
        })
    }

    pub fn set_contract_error(&self, id: &FileContractId, error: String) -> Result<()> {
        self.update_contract(id, |contract| {
            contract.error = Some(error);
        })
    }

    fn update_contract(
        &self,
        id: &FileContractId,
        mutate: impl FnOnce(&mut Contract),
    ) -> Result<()> {
        let _guard = self.mutation.lock().expect("mutation lock poisoned");
        let mut contract = self.contract(id)?;
        mutate(&mut contract);
        let mut batch = Batch::new();
        Self::put_record(&mut batch, keys::contract_key(id), &contract)?;
        self.backend.write(batch)
    }

    pub fn contract_formation_set(&self, id: &FileContractId) -> Result<Vec<Transaction>> {
        Ok(self.contract(id)?.formation_set)
    }

    // ===== action queries =====

    /// Unconfirmed formations whose rebroadcast stagger has elapsed and
    /// whose proof window has not yet opened.
    pub fn contracts_needing_formation_rebroadcast(
        &self,
        height: u64,
        stagger: u64,
    ) -> Result<Vec<Contract>> {
        Ok(self
            .contracts()?
            .into_iter()
            .filter(|c| {
                !c.formation_confirmed
                    && !c.status.is_terminal()
                    && c.negotiation_height + stagger <= height
                    && height < c.revision.window_start
            })
            .collect())
    }

    /// Contracts whose latest revision is not yet confirmed and whose
    /// window opens within `margin` blocks.
    pub fn contracts_awaiting_final_revision(
        &self,
        height: u64,
        margin: u64,
    ) -> Result<Vec<Contract>> {
        Ok(self
            .contracts()?
            .into_iter()
            .filter(|c| {
                c.formation_confirmed
                    && !c.resolution_confirmed
                    && !c.status.is_terminal()
                    && c.confirmed_revision() < c.revision.revision_number
                    && height + margin >= c.revision.window_start
            })
            .collect())
    }

    /// Unresolved contracts whose proof window overlaps `[height_lo,
    /// height_hi)`.
    pub fn contracts_with_expiring_windows(
        &self,
        height_lo: u64,
        height_hi: u64,
    ) -> Result<Vec<Contract>> {
        Ok(self
            .contracts()?
            .into_iter()
            .filter(|c| {
                c.formation_confirmed
                    && !c.resolution_confirmed
                    && !c.status.is_terminal()
                    && c.revision.window_start < height_hi
                    && c.revision.window_end > height_lo
            })
            .collect())
    }
}

fn apply_delta(roots: &mut Vec<Hash256>, delta: &RootDelta) -> Result<()> {
    for &(i, j) in &delta.swap {
        swap_roots(roots, i, j)?;
    }
    if let Some(new_len) = delta.trim {
        if new_len > roots.len() as u64 {
            return Err(StoreError::Invalid(format!(
                "trim to {new_len} exceeds current length {}",
                roots.len()
            )));
        }
        roots.truncate(new_len as usize);
    }
    roots.extend_from_slice(&delta.append);
    Ok(())
}

fn swap_roots(roots: &mut [Hash256], i: u64, j: u64) -> Result<()> {
    let len = roots.len() as u64;
    if i >= len || j >= len {
        return Err(StoreError::Invalid(format!(
            "swap indices ({i}, {j}) out of bounds for {len} roots"
        )));
    }
    roots.swap(i as usize, j as usize);
    Ok(())
}
