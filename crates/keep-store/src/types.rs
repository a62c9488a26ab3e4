use serde::{Deserialize, Serialize};

use keep_types::{
    Currency, FileContractId, FileContractRevision, Hash256, Signature, Transaction,
};

/// A registered volume: a numbered array of sector slots backed by one
/// local file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u32,
    pub local_path: String,
    pub read_only: bool,
    /// Unavailable volumes are skipped by placement and reads; a volume is
    /// unavailable while its file is being preallocated.
    pub available: bool,
    pub total_sectors: u64,
    pub used_sectors: u64,
}

/// The authoritative location of a stored sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorLocation {
    pub volume: u32,
    pub index: u64,
    pub root: Hash256,
}

/// One planned move during migration: copy the sector at `from` to `to`
/// before the metadata batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMove {
    pub root: Hash256,
    pub from: SectorLocation,
    pub to: SectorLocation,
}

/// Occupancy record for a single slot. Empty slots exist as records so
/// first-fit placement is a prefix scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub root: Option<Hash256>,
}

/// Lifecycle state of a file contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    /// Formation transaction accepted, not yet confirmed on chain.
    Pending,
    /// Formation confirmed; revisions are accepted until the proof window
    /// opens.
    Active,
    /// The proof window has opened; the host must resolve the contract.
    AwaitingProof,
    /// Storage proof or clearing resolution confirmed.
    Resolved,
    /// The window closed without resolution; collateral is forfeit.
    Failed,
}

impl ContractStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    pub fn can_transition_to(&self, next: &Self) -> bool {
        use ContractStatus::*;
        match (self, next) {
            (Pending, Active) => true,
            (Pending, Failed) => true,
            (Active, AwaitingProof) => true,
            (Active, Failed) => true,
            (AwaitingProof, Resolved) => true,
            (AwaitingProof, Failed) => true,
            (Resolved, _) | (Failed, _) => false,
            _ => false,
        }
    }
}

/// Everything the host tracks for one file contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: FileContractId,
    pub revision: FileContractRevision,
    pub renter_signature: Signature,
    pub host_signature: Signature,

    pub locked_collateral: Currency,
    pub negotiation_height: u64,
    pub formation_set: Vec<Transaction>,

    /// Highest revision number seen on chain, stored big-endian so the
    /// `u64::MAX` clearing sentinel compares lexicographically.
    pub confirmed_revision_number: [u8; 8],
    pub formation_confirmed: bool,
    pub resolution_confirmed: bool,

    pub renewed_from: Option<FileContractId>,
    pub renewed_to: Option<FileContractId>,

    pub status: ContractStatus,
    /// Terminal error, set when the contract fails.
    pub error: Option<String>,
}

impl Contract {
    pub fn confirmed_revision(&self) -> u64 {
        u64::from_be_bytes(self.confirmed_revision_number)
    }

    pub fn set_confirmed_revision(&mut self, number: u64) {
        self.confirmed_revision_number = number.to_be_bytes();
    }
}

/// A mutation of a contract's sector-root list, committed in the same
/// transaction as the revision it belongs to. Swaps apply first, then the
/// trim, then the append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootDelta {
    pub swap: Vec<(u64, u64)>,
    pub trim: Option<u64>,
    pub append: Vec<Hash256>,
}

impl RootDelta {
    pub fn is_empty(&self) -> bool {
        self.swap.is_empty() && self.trim.is_none() && self.append.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use ContractStatus::*;
        assert!(Pending.can_transition_to(&Active));
        assert!(Active.can_transition_to(&AwaitingProof));
        assert!(AwaitingProof.can_transition_to(&Resolved));
        assert!(AwaitingProof.can_transition_to(&Failed));

        assert!(!Pending.can_transition_to(&AwaitingProof));
        assert!(!Active.can_transition_to(&Pending));
        assert!(!Resolved.can_transition_to(&Active));
        assert!(!Failed.can_transition_to(&Active));

        assert!(Resolved.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Active.is_terminal());
    }

    #[test]
    fn confirmed_revision_blob_orders_lexicographically() {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&5u64.to_be_bytes());
        b.copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(a < b);
    }
}
