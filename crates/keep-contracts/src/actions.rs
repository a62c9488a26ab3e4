use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use keep_merkle::{
    build_proof, build_sector_range_proof, convert_proof_ordering, LEAF_SIZE, LEAVES_PER_SECTOR,
};
use keep_store::Contract;
use keep_types::{
    BlockId, CoveredFields, FileContractId, Hash256, Segment, StorageProof, Transaction,
    TransactionSignature, MAX_REVISION_NUMBER,
};

use crate::error::{ContractError, Result};
use crate::manager::{ContractLock, ContractManager, MAX_BACKOFF_BLOCKS};
use crate::types::LifecycleAction;

/// Multiplier applied to the fee estimator's maximum when funding final
/// revisions and resolutions; the only requirement is confirmation before
/// the window closes.
pub const TXN_FEE_MULTIPLIER: u64 = 1000;

/// Deadline for a single action broadcast; timeouts are transient and
/// retried on the next chain tick.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministically selects the leaf index a storage proof must reveal,
/// from the id of the block preceding the proof window and the contract
/// id.
///
/// The reduction is a consensus rule: the 32-byte BLAKE2b-256 digest is
/// consumed as four big-endian 64-bit groups through a running-remainder
/// wide division, bit-for-bit the chain's function.
pub fn storage_proof_segment(block_id: BlockId, contract_id: FileContractId, filesize: u64) -> u64 {
    if filesize == 0 {
        return 0;
    }
    let mut state = blake2b_simd::Params::new().hash_length(32).to_state();
    state.update(block_id.as_bytes());
    state.update(contract_id.as_bytes());
    let seed = state.finalize();
    let seed = seed.as_bytes();

    let num_segments = filesize.div_ceil(LEAF_SIZE as u64);
    let mut remainder: u64 = 0;
    for group in seed.chunks_exact(8).take(4) {
        let word = u64::from_be_bytes(group.try_into().expect("8-byte group"));
        let wide = ((remainder as u128) << 64) | word as u128;
        remainder = (wide % num_segments as u128) as u64;
    }
    remainder
}

impl ContractManager {
    /// Builds the storage proof for `segment_index` of a contract's file:
    /// the intra-sector path concatenated with the sector-range path, in
    /// consensus ordering. An empty file proves with an empty hash set.
    pub fn build_storage_proof(
        &self,
        id: &FileContractId,
        segment_index: u64,
    ) -> Result<StorageProof> {
        let contract = self.store.contract(id)?;
        if contract.revision.filesize == 0 {
            return Ok(StorageProof {
                parent_id: *id,
                segment: Segment::default(),
                hash_set: Vec::new(),
            });
        }

        let roots = self.store.sector_roots(id)?;
        let sector_index = segment_index / LEAVES_PER_SECTOR;
        let leaf_index = segment_index % LEAVES_PER_SECTOR;
        let root = roots.get(sector_index as usize).copied().ok_or_else(|| {
            ContractError::Invalid(format!(
                "segment {segment_index} is beyond the contract's {} sectors",
                roots.len()
            ))
        })?;

        let (sector, release) = self.storage.read_sector(&root)?;
        let mut hash_set = convert_proof_ordering(
            &build_proof(&sector, leaf_index, leaf_index + 1),
            leaf_index,
        );
        hash_set.extend(convert_proof_ordering(
            &build_sector_range_proof(&roots, sector_index, sector_index + 1),
            sector_index,
        ));

        let offset = leaf_index as usize * LEAF_SIZE;
        let mut segment = [0u8; LEAF_SIZE];
        segment.copy_from_slice(&sector[offset..offset + LEAF_SIZE]);
        release.release();

        Ok(StorageProof {
            parent_id: *id,
            segment: Segment::from_bytes(segment),
            hash_set,
        })
    }

    /// Performs one lifecycle action on a locked contract.
    pub async fn handle_contract_action(
        &self,
        lock: &ContractLock,
        action: LifecycleAction,
    ) -> Result<()> {
        let contract = lock.contract();
        match action {
            LifecycleAction::BroadcastFormation => {
                let formation_set = self.store.contract_formation_set(&contract.id)?;
                // A failed rebroadcast leaves the financial records
                // untouched; the action fires again on the next tick.
                self.tpool.accept_transaction_set(formation_set).await?;
                info!(contract = %contract.id, "rebroadcast formation transaction");
            }
            LifecycleAction::BroadcastFinalRevision => {
                self.broadcast_final_revision(contract).await?;
            }
            LifecycleAction::BroadcastResolution => {
                if contract.revision.revision_number == MAX_REVISION_NUMBER {
                    // Cleared cooperatively; the final revision resolves
                    // the contract without a proof.
                    self.broadcast_final_revision(contract).await?;
                } else {
                    self.broadcast_storage_proof(contract).await?;
                }
            }
        }
        Ok(())
    }

    async fn broadcast_final_revision(&self, contract: &Contract) -> Result<()> {
        let parent_id = Hash256::from_bytes(*contract.id.as_bytes());
        let txn = Transaction {
            file_contract_revisions: vec![contract.revision.clone()],
            signatures: vec![
                TransactionSignature {
                    parent_id,
                    covered_fields: CoveredFields::revision(0),
                    signature: contract.renter_signature,
                },
                TransactionSignature {
                    parent_id,
                    covered_fields: CoveredFields::revision(0),
                    signature: contract.host_signature,
                },
            ],
            ..Default::default()
        };
        self.fund_and_broadcast(txn).await?;
        info!(
            contract = %contract.id,
            revision = contract.revision.revision_number,
            "broadcast final revision"
        );
        Ok(())
    }

    async fn broadcast_storage_proof(&self, contract: &Contract) -> Result<()> {
        let window_start = contract.revision.window_start;
        let index = self.chain.index_at_height(window_start - 1).await?;
        let segment_index =
            storage_proof_segment(index.id, contract.id, contract.revision.filesize);
        let proof = self.build_storage_proof(&contract.id, segment_index)?;

        let txn = Transaction {
            storage_proofs: vec![proof],
            ..Default::default()
        };
        self.fund_and_broadcast(txn).await?;
        info!(contract = %contract.id, segment = segment_index, "broadcast storage proof");
        Ok(())
    }

    /// Attaches fees, funds from the wallet, signs, and submits. The
    /// wallet's UTXO reservation is held until the broadcast settles one
    /// way or the other.
    async fn fund_and_broadcast(&self, mut txn: Transaction) -> Result<()> {
        let (_, max_fee) = self.tpool.fee_estimation().await?;
        let fee = max_fee
            .checked_mul_u64(TXN_FEE_MULTIPLIER)
            .ok_or_else(|| ContractError::Invalid("transaction fee overflows".into()))?;
        txn.miner_fees.push(fee);

        let (to_sign, _reservation) = self.wallet.fund_transaction(&mut txn, fee).await?;
        self.wallet
            .sign_transaction(&mut txn, to_sign, CoveredFields::whole())
            .await?;
        self.tpool.accept_transaction_set(vec![txn]).await
    }

    /// Spawns the due actions, one task per contract, skipping contracts
    /// still backing off from an earlier failure.
    pub fn dispatch_actions(
        self: Arc<Self>,
        actions: Vec<(FileContractId, LifecycleAction)>,
        height: u64,
    ) {
        for (id, action) in actions {
            if !self.retry_ready(id, height) {
                continue;
            }
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                manager.run_action(id, action, height).await;
            });
        }
    }

    /// Runs a single action under the contract's lock and the dispatch
    /// deadline, updating the retry schedule.
    pub async fn run_action(&self, id: FileContractId, action: LifecycleAction, height: u64) {
        let lock = match self.lock_contract(id).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!(contract = %id, %err, "failed to lock contract for action");
                return;
            }
        };
        match tokio::time::timeout(ACTION_TIMEOUT, self.handle_contract_action(&lock, action)).await
        {
            Ok(Ok(())) => {
                self.retries.lock().expect("retry map poisoned").remove(&id);
            }
            Ok(Err(err)) => {
                self.record_failure(id, height);
                warn!(contract = %id, ?action, %err, "contract action failed");
            }
            Err(_) => {
                self.record_failure(id, height);
                warn!(contract = %id, ?action, "contract action timed out");
            }
        }
    }

    fn retry_ready(&self, id: FileContractId, height: u64) -> bool {
        let retries = self.retries.lock().expect("retry map poisoned");
        match retries.get(&id) {
            Some((_, next_height)) => height >= *next_height,
            None => true,
        }
    }

    fn record_failure(&self, id: FileContractId, height: u64) {
        let mut retries = self.retries.lock().expect("retry map poisoned");
        let (attempts, _) = retries.get(&id).copied().unwrap_or((0, 0));
        let attempts = attempts.saturating_add(1);
        let delay = (1u64 << attempts.min(16)).min(MAX_BACKOFF_BLOCKS);
        retries.insert(id, (attempts, height + delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_selection_is_deterministic_and_in_range() {
        let bid = BlockId::from_bytes([1u8; 32]);
        let fcid = FileContractId::from_bytes([2u8; 32]);
        let filesize = 3 << 22; // three sectors

        let a = storage_proof_segment(bid, fcid, filesize);
        let b = storage_proof_segment(bid, fcid, filesize);
        assert_eq!(a, b);
        assert!(a < filesize / LEAF_SIZE as u64);

        // Different inputs select different segments.
        let other = storage_proof_segment(BlockId::from_bytes([3u8; 32]), fcid, filesize);
        assert_ne!(a, other);
    }

    #[test]
    fn empty_file_selects_segment_zero() {
        let bid = BlockId::from_bytes([1u8; 32]);
        let fcid = FileContractId::from_bytes([2u8; 32]);
        assert_eq!(storage_proof_segment(bid, fcid, 0), 0);
    }

    #[test]
    fn partial_trailing_leaf_counts() {
        let bid = BlockId::from_bytes([4u8; 32]);
        let fcid = FileContractId::from_bytes([5u8; 32]);
        // 100 bytes is two leaves: one full, one padded.
        let selected = storage_proof_segment(bid, fcid, 100);
        assert!(selected < 2);
    }
}
