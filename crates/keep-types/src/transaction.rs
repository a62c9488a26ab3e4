use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::contract::{FileContract, FileContractRevision};
use crate::currency::Currency;
use crate::hash::{FileContractId, Hash256};
use crate::keys::Signature;

/// A 64-byte leaf segment revealed by a storage proof.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Segment(pub [u8; 64]);

impl Segment {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({}...)", &hex::encode(&self.0[..4]))
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct SegmentVisitor;

impl<'de> Visitor<'de> for SegmentVisitor {
    type Value = Segment;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("64 segment bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Segment, E> {
        if v.len() != 64 {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(v);
        Ok(Segment(arr))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Segment, A::Error> {
        let mut arr = [0u8; 64];
        for (i, slot) in arr.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Segment(arr))
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(SegmentVisitor)
    }
}

/// A Merkle storage proof over a randomly selected leaf of a contract's
/// file. `hash_set` is ordered from leaf depth outward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProof {
    pub parent_id: FileContractId,
    pub segment: Segment,
    pub hash_set: Vec<Hash256>,
}

/// Which parts of a transaction a signature covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredFields {
    pub whole_transaction: bool,
    pub file_contract_revisions: Vec<u64>,
}

impl CoveredFields {
    /// Covers every field of the transaction.
    pub fn whole() -> Self {
        Self {
            whole_transaction: true,
            file_contract_revisions: Vec::new(),
        }
    }

    /// Covers only the revision at `index`.
    pub fn revision(index: u64) -> Self {
        Self {
            whole_transaction: false,
            file_contract_revisions: vec![index],
        }
    }
}

/// A signature attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub parent_id: Hash256,
    pub covered_fields: CoveredFields,
    pub signature: Signature,
}

/// The subset of the chain's transaction type the host core constructs and
/// rebroadcasts. Inputs and outputs are attached by the wallet when the
/// transaction is funded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub file_contracts: Vec<FileContract>,
    pub file_contract_revisions: Vec<FileContractRevision>,
    pub storage_proofs: Vec<StorageProof>,
    pub miner_fees: Vec<Currency>,
    pub signatures: Vec<TransactionSignature>,
}

impl Transaction {
    /// The id of the file contract at `index` within this transaction.
    pub fn file_contract_id(&self, index: usize) -> FileContractId {
        let mut e = crate::encoding::Encoder::new();
        e.write_bytes(b"file contract");
        e.write_u64(index as u64);
        if let Some(fc) = self.file_contracts.get(index) {
            use crate::encoding::Encode;
            fc.encode_to(&mut e);
        }
        FileContractId(e.finalize().0)
    }
}
