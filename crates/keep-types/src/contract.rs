use serde::{Deserialize, Serialize};

use crate::currency::Currency;
use crate::encoding::{Encode, Encoder};
use crate::hash::{Address, FileContractId, Hash256};
use crate::keys::PublicKey;

/// Index of the renter payout in both output lists.
pub const RENTER_OUTPUT: usize = 0;
/// Index of the host payout in both output lists.
pub const HOST_OUTPUT: usize = 1;
/// Index of the burned-collateral output in the missed list.
pub const VOID_OUTPUT: usize = 2;

/// A proof payout: an amount owed to an address when the contract resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub value: Currency,
    pub address: Address,
}

impl Encode for Output {
    fn encode_to(&self, e: &mut Encoder) {
        e.write_u128(self.value.base_units());
        e.write_bytes(self.address.as_bytes());
    }
}

/// The key set required to revise or resolve a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockConditions {
    pub public_keys: Vec<PublicKey>,
    pub signatures_required: u64,
}

impl UnlockConditions {
    /// Digest committing to the full key set. Stored in the contract's
    /// `unlock_hash` field and checked on every revision.
    pub fn unlock_hash(&self) -> Hash256 {
        let mut e = Encoder::new();
        e.write_len(self.public_keys.len());
        for key in &self.public_keys {
            e.write_bytes(key.as_bytes());
        }
        e.write_u64(self.signatures_required);
        e.finalize()
    }
}

/// The standard 2-of-2 unlock set for a renter/host contract. The renter
/// key is always first.
pub fn contract_unlock_conditions(renter_key: PublicKey, host_key: PublicKey) -> UnlockConditions {
    UnlockConditions {
        public_keys: vec![renter_key, host_key],
        signatures_required: 2,
    }
}

/// The contract fields committed on chain at formation or renewal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContract {
    pub filesize: u64,
    pub file_merkle_root: Hash256,
    pub window_start: u64,
    pub window_end: u64,
    pub revision_number: u64,
    pub valid_proof_outputs: Vec<Output>,
    pub missed_proof_outputs: Vec<Output>,
    pub unlock_hash: Hash256,
}

impl Encode for FileContract {
    fn encode_to(&self, e: &mut Encoder) {
        e.write_u64(self.filesize);
        e.write_bytes(self.file_merkle_root.as_bytes());
        e.write_u64(self.window_start);
        e.write_u64(self.window_end);
        e.write_u64(self.revision_number);
        e.write_len(self.valid_proof_outputs.len());
        for o in &self.valid_proof_outputs {
            o.encode_to(e);
        }
        e.write_len(self.missed_proof_outputs.len());
        for o in &self.missed_proof_outputs {
            o.encode_to(e);
        }
        e.write_bytes(self.unlock_hash.as_bytes());
    }
}

/// A signed mutation of a file contract. Both parties sign `sig_hash()`
/// whenever the revision number advances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContractRevision {
    pub parent_id: FileContractId,
    pub unlock_conditions: UnlockConditions,
    pub filesize: u64,
    pub file_merkle_root: Hash256,
    pub window_start: u64,
    pub window_end: u64,
    pub revision_number: u64,
    pub valid_proof_outputs: Vec<Output>,
    pub missed_proof_outputs: Vec<Output>,
    pub unlock_hash: Hash256,
}

impl FileContractRevision {
    /// Digest covered by the renter and host revision signatures.
    pub fn sig_hash(&self) -> Hash256 {
        self.digest()
    }

    pub fn valid_renter_payout(&self) -> Currency {
        self.valid_proof_outputs[RENTER_OUTPUT].value
    }

    pub fn valid_host_payout(&self) -> Currency {
        self.valid_proof_outputs[HOST_OUTPUT].value
    }

    pub fn missed_renter_payout(&self) -> Currency {
        self.missed_proof_outputs[RENTER_OUTPUT].value
    }

    pub fn missed_host_payout(&self) -> Currency {
        self.missed_proof_outputs[HOST_OUTPUT].value
    }
}

impl Encode for FileContractRevision {
    fn encode_to(&self, e: &mut Encoder) {
        e.write_bytes(self.parent_id.as_bytes());
        e.write_len(self.unlock_conditions.public_keys.len());
        for key in &self.unlock_conditions.public_keys {
            e.write_bytes(key.as_bytes());
        }
        e.write_u64(self.unlock_conditions.signatures_required);
        e.write_u64(self.filesize);
        e.write_bytes(self.file_merkle_root.as_bytes());
        e.write_u64(self.window_start);
        e.write_u64(self.window_end);
        e.write_u64(self.revision_number);
        e.write_len(self.valid_proof_outputs.len());
        for o in &self.valid_proof_outputs {
            o.encode_to(e);
        }
        e.write_len(self.missed_proof_outputs.len());
        for o in &self.missed_proof_outputs {
            o.encode_to(e);
        }
        e.write_bytes(self.unlock_hash.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_revision() -> FileContractRevision {
        let uc = contract_unlock_conditions(
            PublicKey::from_bytes([1u8; 32]),
            PublicKey::from_bytes([2u8; 32]),
        );
        FileContractRevision {
            parent_id: FileContractId::from_bytes([3u8; 32]),
            unlock_hash: uc.unlock_hash(),
            unlock_conditions: uc,
            filesize: 1 << 22,
            file_merkle_root: Hash256::from_bytes([4u8; 32]),
            window_start: 100,
            window_end: 200,
            revision_number: 7,
            valid_proof_outputs: vec![
                Output {
                    value: Currency::new(500),
                    address: Address::from_bytes([5u8; 32]),
                },
                Output {
                    value: Currency::new(300),
                    address: Address::from_bytes([6u8; 32]),
                },
            ],
            missed_proof_outputs: vec![
                Output {
                    value: Currency::new(500),
                    address: Address::from_bytes([5u8; 32]),
                },
                Output {
                    value: Currency::new(300),
                    address: Address::from_bytes([6u8; 32]),
                },
                Output {
                    value: Currency::ZERO,
                    address: Address::default(),
                },
            ],
        }
    }

    #[test]
    fn sig_hash_changes_with_revision_number() {
        let rev = sample_revision();
        let mut bumped = rev.clone();
        bumped.revision_number += 1;
        assert_ne!(rev.sig_hash(), bumped.sig_hash());
    }

    #[test]
    fn serde_round_trip() {
        let rev = sample_revision();
        let bytes = bincode::serialize(&rev).unwrap();
        let parsed: FileContractRevision = bincode::deserialize(&bytes).unwrap();
        assert_eq!(rev, parsed);
        assert_eq!(rev.sig_hash(), parsed.sig_hash());
    }

    #[test]
    fn unlock_hash_depends_on_key_order() {
        let a = PublicKey::from_bytes([1u8; 32]);
        let b = PublicKey::from_bytes([2u8; 32]);
        assert_ne!(
            contract_unlock_conditions(a, b).unlock_hash(),
            contract_unlock_conditions(b, a).unlock_hash()
        );
    }
}
