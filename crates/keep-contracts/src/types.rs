use serde::{Deserialize, Serialize};

use keep_types::{FileContractRevision, Signature};

/// A revision together with both parties' signatures over its digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRevision {
    pub revision: FileContractRevision,
    pub renter_signature: Signature,
    pub host_signature: Signature,
}

/// A lifecycle event the host must perform on a contract at some chain
/// height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    /// Rebroadcast the formation transaction set.
    BroadcastFormation,
    /// Broadcast the latest signed revision before the window opens.
    BroadcastFinalRevision,
    /// Resolve the contract: a storage proof, or the final revision for a
    /// cleared contract.
    BroadcastResolution,
}
