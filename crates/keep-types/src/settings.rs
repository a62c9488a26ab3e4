use serde::{Deserialize, Serialize};

use crate::currency::Currency;
use crate::hash::Address;

/// The host's advertised terms. Produced by the settings reporter and
/// consumed by formation/renewal validation and the storage engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    pub accepting_contracts: bool,

    /// Minimum number of blocks between contract end and the close of its
    /// proof window.
    pub window_size: u64,
    /// Maximum number of blocks a contract may run for.
    pub max_duration: u64,

    pub contract_price: Currency,
    pub max_collateral: Currency,
    /// Collateral locked per byte per block of stored data.
    pub collateral: Currency,

    pub storage_price: Currency,
    pub ingress_price: Currency,
    pub egress_price: Currency,

    /// Payout address for the host's contract outputs.
    pub address: Address,

    /// Sector cache capacity, in sectors.
    pub sector_cache_size: usize,
    /// Bandwidth limits in bytes per second; zero disables the limit.
    pub ingress_limit: u64,
    pub egress_limit: u64,
}
