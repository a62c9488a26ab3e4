//! Pure revision validation. Every predicate reports the first violated
//! rule as its own error kind; acceptance is a commitment to sign pending
//! signature verification by the caller.

use thiserror::Error;

use keep_types::{
    contract_unlock_conditions, Currency, FileContract, FileContractRevision, HostSettings,
    PublicKey, Transaction, HOST_OUTPUT, MAX_REVISION_NUMBER, VOID_OUTPUT,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionError {
    // shared rules
    #[error("valid proof output count must not change")]
    ValidOutputCountChanged,
    #[error("missed proof output count must not change")]
    MissedOutputCountChanged,
    #[error("valid proof output address must not change")]
    ValidOutputAddressChanged,
    #[error("missed proof output address must not change")]
    MissedOutputAddressChanged,
    #[error("valid proof output sum must not change")]
    ValidPayoutSumChanged,
    #[error("missed proof output sum must not change")]
    MissedPayoutSumChanged,
    #[error("unlock hash must not change")]
    UnlockHashChanged,
    #[error("unlock conditions must not change")]
    UnlockConditionsChanged,
    #[error("revision number must increase")]
    RevisionNumberNotIncreased,
    #[error("window start must not change")]
    WindowStartChanged,
    #[error("window end must not change")]
    WindowEndChanged,
    #[error("renter valid proof output must not increase")]
    RenterValidPayoutIncreased,
    #[error("renter missed proof output must not increase")]
    RenterMissedPayoutIncreased,
    #[error("payout sum overflows")]
    PayoutOverflow,

    // formation
    #[error("initial filesize must be zero")]
    InitialFilesizeNotZero,
    #[error("initial revision number must be zero")]
    InitialRevisionNumber,
    #[error("initial file Merkle root must be zero")]
    InitialMerkleRootNotZero,
    #[error("window starts too soon to safely broadcast the contract")]
    WindowStartTooSoon,
    #[error("contract duration is too long")]
    WindowStartTooLate,
    #[error("proof window is too small")]
    WindowTooSmall,
    #[error("wrong address for host valid output")]
    InvalidHostValidAddress,
    #[error("wrong address for host missed output")]
    InvalidHostMissedAddress,
    #[error("host valid payout is below the contract price")]
    HostPayoutTooSmall,
    #[error("host valid and missed payouts must be equal")]
    HostValidMissedMismatch,
    #[error("initial collateral is excessive")]
    CollateralTooHigh,
    #[error("incorrect unlock hash")]
    InvalidUnlockHash,

    // payment
    #[error("renter valid proof output is not reduced by the payment amount")]
    RenterValidPaymentDelta,
    #[error("renter missed proof output is not reduced by the payment amount")]
    RenterMissedPaymentDelta,
    #[error("host valid proof output is not increased by the payment amount")]
    HostValidPaymentDelta,
    #[error("host missed proof output is not increased by the payment amount")]
    HostMissedPaymentDelta,

    // program
    #[error("expected burn exceeds the host missed payout")]
    BurnExceedsMissedPayout,
    #[error("host burned more than the expected amount")]
    ExcessiveBurn,

    // clearing
    #[error("filesize must not change")]
    FilesizeChanged,
    #[error("file Merkle root must not change")]
    FileMerkleRootChanged,
    #[error("clearing revision number must be the max value")]
    NotMaxRevisionNumber,
    #[error("clearing valid proof output must not change")]
    ClearingValidOutputChanged,
    #[error("clearing missed proof output must equal the valid output")]
    ClearingMissedMismatch,

    // renewal
    #[error("renewal revision number must be zero")]
    RenewalRevisionNumberNotZero,
    #[error("renewal window must not end before the current window")]
    RenewalWindowEndShrunk,
    #[error("host valid payout is below the renter cost")]
    RenewalHostValidTooSmall,
    #[error("host missed payout is below the renter cost")]
    RenewalHostMissedTooSmall,
    #[error("host missed payout exceeds the host valid payout")]
    RenewalHostMissedExceedsValid,
    #[error("host missed payout is below the burn floor")]
    RenewalHostMissedBelowBurn,
    #[error("void output is below the host burn")]
    RenewalVoidTooSmall,

    // applied revisions
    #[error("file Merkle root does not match the sector roots")]
    FileMerkleRootMismatch,
    #[error("filesize does not match the sector roots")]
    FilesizeMismatch,
    #[error("revision number is reserved for clearing revisions")]
    ReservedRevisionNumber,
}

fn payout_sum(outputs: &[keep_types::Output]) -> Result<Currency, RevisionError> {
    Currency::checked_sum(outputs.iter().map(|o| o.value)).ok_or(RevisionError::PayoutOverflow)
}

/// Rules every proposed revision must satisfy regardless of context: only
/// the revision number and the proof output values may change, payouts are
/// conserved, and the renter's payouts never increase.
pub fn validate_std_revision(
    current: &FileContractRevision,
    proposed: &FileContractRevision,
) -> Result<(), RevisionError> {
    if proposed.valid_proof_outputs.len() != current.valid_proof_outputs.len() {
        return Err(RevisionError::ValidOutputCountChanged);
    }
    if proposed.missed_proof_outputs.len() != current.missed_proof_outputs.len() {
        return Err(RevisionError::MissedOutputCountChanged);
    }
    for (proposed_out, current_out) in proposed
        .valid_proof_outputs
        .iter()
        .zip(&current.valid_proof_outputs)
    {
        if proposed_out.address != current_out.address {
            return Err(RevisionError::ValidOutputAddressChanged);
        }
    }
    for (proposed_out, current_out) in proposed
        .missed_proof_outputs
        .iter()
        .zip(&current.missed_proof_outputs)
    {
        if proposed_out.address != current_out.address {
            return Err(RevisionError::MissedOutputAddressChanged);
        }
    }

    if payout_sum(&proposed.valid_proof_outputs)? != payout_sum(&current.valid_proof_outputs)? {
        return Err(RevisionError::ValidPayoutSumChanged);
    }
    if payout_sum(&proposed.missed_proof_outputs)? != payout_sum(&current.missed_proof_outputs)? {
        return Err(RevisionError::MissedPayoutSumChanged);
    }
    if proposed.unlock_hash != current.unlock_hash {
        return Err(RevisionError::UnlockHashChanged);
    }
    if proposed.unlock_conditions.unlock_hash() != current.unlock_conditions.unlock_hash() {
        return Err(RevisionError::UnlockConditionsChanged);
    }
    if proposed.revision_number <= current.revision_number {
        return Err(RevisionError::RevisionNumberNotIncreased);
    }
    if proposed.window_start != current.window_start {
        return Err(RevisionError::WindowStartChanged);
    }
    if proposed.window_end != current.window_end {
        return Err(RevisionError::WindowEndChanged);
    }
    if proposed.valid_renter_payout() > current.valid_renter_payout() {
        return Err(RevisionError::RenterValidPayoutIncreased);
    }
    if proposed.missed_renter_payout() > current.missed_renter_payout() {
        return Err(RevisionError::RenterMissedPayoutIncreased);
    }
    Ok(())
}

/// Validates a newly formed contract against the host's advertised terms.
pub fn validate_formation(
    fc: &FileContract,
    host_key: PublicKey,
    renter_key: PublicKey,
    current_height: u64,
    settings: &HostSettings,
) -> Result<(), RevisionError> {
    if fc.filesize != 0 {
        return Err(RevisionError::InitialFilesizeNotZero);
    }
    if fc.revision_number != 0 {
        return Err(RevisionError::InitialRevisionNumber);
    }
    if !fc.file_merkle_root.is_zero() {
        return Err(RevisionError::InitialMerkleRootNotZero);
    }
    if fc.window_start < current_height + settings.window_size {
        return Err(RevisionError::WindowStartTooSoon);
    }
    if fc.window_start > current_height + settings.max_duration {
        return Err(RevisionError::WindowStartTooLate);
    }
    if fc.window_end < fc.window_start + settings.window_size {
        return Err(RevisionError::WindowTooSmall);
    }
    if fc.valid_proof_outputs.len() != 2 {
        return Err(RevisionError::ValidOutputCountChanged);
    }
    if fc.missed_proof_outputs.len() != 3 {
        return Err(RevisionError::MissedOutputCountChanged);
    }
    if fc.valid_proof_outputs[HOST_OUTPUT].address != settings.address {
        return Err(RevisionError::InvalidHostValidAddress);
    }
    if fc.missed_proof_outputs[HOST_OUTPUT].address != settings.address {
        return Err(RevisionError::InvalidHostMissedAddress);
    }
    if fc.valid_proof_outputs[HOST_OUTPUT].value < settings.contract_price {
        return Err(RevisionError::HostPayoutTooSmall);
    }
    if fc.valid_proof_outputs[HOST_OUTPUT].value != fc.missed_proof_outputs[HOST_OUTPUT].value {
        return Err(RevisionError::HostValidMissedMismatch);
    }
    if fc.valid_proof_outputs[HOST_OUTPUT].value > settings.max_collateral {
        return Err(RevisionError::CollateralTooHigh);
    }
    if fc.unlock_hash != contract_unlock_conditions(renter_key, host_key).unlock_hash() {
        return Err(RevisionError::InvalidUnlockHash);
    }
    Ok(())
}

/// Validates a revision that moves exactly `payment` from both renter
/// payouts to both host payouts.
pub fn validate_payment_revision(
    current: &FileContractRevision,
    proposed: &FileContractRevision,
    payment: Currency,
) -> Result<(), RevisionError> {
    validate_std_revision(current, proposed)?;

    let renter_valid = current
        .valid_renter_payout()
        .checked_sub(payment)
        .ok_or(RevisionError::RenterValidPaymentDelta)?;
    if proposed.valid_renter_payout() != renter_valid {
        return Err(RevisionError::RenterValidPaymentDelta);
    }
    let renter_missed = current
        .missed_renter_payout()
        .checked_sub(payment)
        .ok_or(RevisionError::RenterMissedPaymentDelta)?;
    if proposed.missed_renter_payout() != renter_missed {
        return Err(RevisionError::RenterMissedPaymentDelta);
    }
    let host_valid = current
        .valid_host_payout()
        .checked_add(payment)
        .ok_or(RevisionError::PayoutOverflow)?;
    if proposed.valid_host_payout() != host_valid {
        return Err(RevisionError::HostValidPaymentDelta);
    }
    let host_missed = current
        .missed_host_payout()
        .checked_add(payment)
        .ok_or(RevisionError::PayoutOverflow)?;
    if proposed.missed_host_payout() != host_missed {
        return Err(RevisionError::HostMissedPaymentDelta);
    }
    Ok(())
}

/// Validates a program revision: the host's missed payout may decrease by
/// at most `storage_cost + collateral`, the burn flowing to the void
/// output. Everything else is covered by the shared rules.
pub fn validate_program_revision(
    current: &FileContractRevision,
    proposed: &FileContractRevision,
    storage_cost: Currency,
    collateral: Currency,
) -> Result<(), RevisionError> {
    validate_std_revision(current, proposed)?;

    let expected_burn = storage_cost
        .checked_add(collateral)
        .ok_or(RevisionError::PayoutOverflow)?;
    let missed_floor = current
        .missed_host_payout()
        .checked_sub(expected_burn)
        .ok_or(RevisionError::BurnExceedsMissedPayout)?;
    if proposed.missed_host_payout() < missed_floor {
        return Err(RevisionError::ExcessiveBurn);
    }
    Ok(())
}

/// Validates a clearing revision: the sentinel revision number, missed
/// outputs equal to valid outputs, and everything else frozen.
pub fn validate_clearing_revision(
    current: &FileContractRevision,
    final_revision: &FileContractRevision,
) -> Result<(), RevisionError> {
    if final_revision.filesize != current.filesize {
        return Err(RevisionError::FilesizeChanged);
    }
    if final_revision.file_merkle_root != current.file_merkle_root {
        return Err(RevisionError::FileMerkleRootChanged);
    }
    if final_revision.window_start != current.window_start {
        return Err(RevisionError::WindowStartChanged);
    }
    if final_revision.window_end != current.window_end {
        return Err(RevisionError::WindowEndChanged);
    }
    if final_revision.valid_proof_outputs.len() != current.valid_proof_outputs.len() {
        return Err(RevisionError::ValidOutputCountChanged);
    }
    if final_revision.missed_proof_outputs.len() != final_revision.valid_proof_outputs.len() {
        return Err(RevisionError::MissedOutputCountChanged);
    }
    if final_revision.revision_number != MAX_REVISION_NUMBER {
        return Err(RevisionError::NotMaxRevisionNumber);
    }
    if final_revision.unlock_hash != current.unlock_hash {
        return Err(RevisionError::UnlockHashChanged);
    }
    if final_revision.unlock_conditions.unlock_hash() != current.unlock_conditions.unlock_hash() {
        return Err(RevisionError::UnlockConditionsChanged);
    }

    for i in 0..final_revision.valid_proof_outputs.len() {
        let current_out = &current.valid_proof_outputs[i];
        let valid = &final_revision.valid_proof_outputs[i];
        let missed = &final_revision.missed_proof_outputs[i];
        if valid.value != current_out.value || valid.address != current_out.address {
            return Err(RevisionError::ClearingValidOutputChanged);
        }
        if missed.value != valid.value || missed.address != valid.address {
            return Err(RevisionError::ClearingMissedMismatch);
        }
    }
    Ok(())
}

/// Validates a renewal against the contract it replaces: the file carries
/// over, the new window extends the old one, and the host's payouts cover
/// the renter's cost without over-collateralizing.
#[allow(clippy::too_many_arguments)]
pub fn validate_renewal(
    existing: &FileContractRevision,
    renewal: &FileContract,
    host_key: PublicKey,
    renter_key: PublicKey,
    renter_cost: Currency,
    host_burn: Currency,
    current_height: u64,
    settings: &HostSettings,
) -> Result<(), RevisionError> {
    if renewal.revision_number != 0 {
        return Err(RevisionError::RenewalRevisionNumberNotZero);
    }
    if renewal.filesize != existing.filesize {
        return Err(RevisionError::FilesizeChanged);
    }
    if renewal.file_merkle_root != existing.file_merkle_root {
        return Err(RevisionError::FileMerkleRootChanged);
    }
    if renewal.window_end < existing.window_end {
        return Err(RevisionError::RenewalWindowEndShrunk);
    }
    if renewal.window_start < current_height + settings.window_size {
        return Err(RevisionError::WindowStartTooSoon);
    }
    if renewal.window_start > current_height + settings.max_duration {
        return Err(RevisionError::WindowStartTooLate);
    }
    if renewal.window_end < renewal.window_start + settings.window_size {
        return Err(RevisionError::WindowTooSmall);
    }
    if renewal.valid_proof_outputs.len() != 2 {
        return Err(RevisionError::ValidOutputCountChanged);
    }
    if renewal.missed_proof_outputs.len() != 3 {
        return Err(RevisionError::MissedOutputCountChanged);
    }
    if renewal.valid_proof_outputs[HOST_OUTPUT].address != settings.address {
        return Err(RevisionError::InvalidHostValidAddress);
    }

    let host_valid = renewal.valid_proof_outputs[HOST_OUTPUT].value;
    let host_missed = renewal.missed_proof_outputs[HOST_OUTPUT].value;
    if host_valid < renter_cost {
        return Err(RevisionError::RenewalHostValidTooSmall);
    }
    if host_missed < renter_cost {
        return Err(RevisionError::RenewalHostMissedTooSmall);
    }
    let collateral = host_valid
        .checked_sub(renter_cost)
        .ok_or(RevisionError::RenewalHostValidTooSmall)?;
    if collateral > settings.max_collateral {
        return Err(RevisionError::CollateralTooHigh);
    }
    if host_missed > host_valid {
        return Err(RevisionError::RenewalHostMissedExceedsValid);
    }
    if host_missed < host_valid.saturating_sub(host_burn) {
        return Err(RevisionError::RenewalHostMissedBelowBurn);
    }
    if renewal.missed_proof_outputs[VOID_OUTPUT].value < host_burn {
        return Err(RevisionError::RenewalVoidTooSmall);
    }
    if renewal.unlock_hash != contract_unlock_conditions(renter_key, host_key).unlock_hash() {
        return Err(RevisionError::InvalidUnlockHash);
    }
    Ok(())
}

/// Builds the first revision of a formation transaction's contract.
pub fn initial_revision(
    formation_txn: &Transaction,
    renter_key: PublicKey,
    host_key: PublicKey,
) -> FileContractRevision {
    let fc = &formation_txn.file_contracts[0];
    let unlock_conditions = contract_unlock_conditions(renter_key, host_key);
    FileContractRevision {
        parent_id: formation_txn.file_contract_id(0),
        unlock_conditions,
        filesize: fc.filesize,
        file_merkle_root: fc.file_merkle_root,
        window_start: fc.window_start,
        window_end: fc.window_end,
        revision_number: 1,
        valid_proof_outputs: fc.valid_proof_outputs.clone(),
        missed_proof_outputs: fc.missed_proof_outputs.clone(),
        unlock_hash: fc.unlock_hash,
    }
}

/// Returns `revision` updated with a new revision number and payout
/// values; addresses are carried over.
pub fn revise(
    revision: &FileContractRevision,
    revision_number: u64,
    valid_values: &[Currency],
    missed_values: &[Currency],
) -> Result<FileContractRevision, RevisionError> {
    if valid_values.len() != revision.valid_proof_outputs.len() {
        return Err(RevisionError::ValidOutputCountChanged);
    }
    if missed_values.len() != revision.missed_proof_outputs.len() {
        return Err(RevisionError::MissedOutputCountChanged);
    }
    if revision_number <= revision.revision_number {
        return Err(RevisionError::RevisionNumberNotIncreased);
    }
    let mut revised = revision.clone();
    revised.revision_number = revision_number;
    for (output, &value) in revised.valid_proof_outputs.iter_mut().zip(valid_values) {
        output.value = value;
    }
    for (output, &value) in revised.missed_proof_outputs.iter_mut().zip(missed_values) {
        output.value = value;
    }
    Ok(revised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keep_types::{Address, Hash256, Output};

    const RENTER: usize = keep_types::RENTER_OUTPUT;
    const HOST: usize = HOST_OUTPUT;

    fn settings() -> HostSettings {
        HostSettings {
            accepting_contracts: true,
            window_size: 10,
            max_duration: 1000,
            contract_price: Currency::new(50),
            max_collateral: Currency::new(10_000),
            address: Address::from_bytes([0xaa; 32]),
            ..Default::default()
        }
    }

    fn keys() -> (PublicKey, PublicKey) {
        (
            PublicKey::from_bytes([1u8; 32]),
            PublicKey::from_bytes([2u8; 32]),
        )
    }

    fn formation_contract() -> FileContract {
        let (renter_key, host_key) = keys();
        let settings = settings();
        FileContract {
            filesize: 0,
            file_merkle_root: Hash256::default(),
            window_start: 100,
            window_end: 120,
            revision_number: 0,
            valid_proof_outputs: vec![
                Output {
                    value: Currency::new(1000),
                    address: Address::from_bytes([3u8; 32]),
                },
                Output {
                    value: Currency::new(100),
                    address: settings.address,
                },
            ],
            missed_proof_outputs: vec![
                Output {
                    value: Currency::new(1000),
                    address: Address::from_bytes([3u8; 32]),
                },
                Output {
                    value: Currency::new(100),
                    address: settings.address,
                },
                Output {
                    value: Currency::ZERO,
                    address: Address::default(),
                },
            ],
            unlock_hash: contract_unlock_conditions(renter_key, host_key).unlock_hash(),
        }
    }

    fn active_revision() -> FileContractRevision {
        let fc = formation_contract();
        let (renter_key, host_key) = keys();
        FileContractRevision {
            parent_id: keep_types::FileContractId::from_bytes([9u8; 32]),
            unlock_conditions: contract_unlock_conditions(renter_key, host_key),
            filesize: fc.filesize,
            file_merkle_root: fc.file_merkle_root,
            window_start: fc.window_start,
            window_end: fc.window_end,
            revision_number: 1,
            valid_proof_outputs: fc.valid_proof_outputs,
            missed_proof_outputs: fc.missed_proof_outputs,
            unlock_hash: fc.unlock_hash,
        }
    }

    #[test]
    fn formation_accepts_valid_contract() {
        let (renter_key, host_key) = keys();
        validate_formation(&formation_contract(), host_key, renter_key, 50, &settings()).unwrap();
    }

    #[test]
    fn formation_rejects_nonzero_revision_number() {
        let (renter_key, host_key) = keys();
        let mut fc = formation_contract();
        fc.revision_number = 1;
        assert_eq!(
            validate_formation(&fc, host_key, renter_key, 50, &settings()),
            Err(RevisionError::InitialRevisionNumber)
        );
    }

    #[test]
    fn formation_rejects_bad_windows() {
        let (renter_key, host_key) = keys();
        let settings = settings();

        let mut fc = formation_contract();
        fc.window_start = 55; // height 50 + window_size 10 = 60
        assert_eq!(
            validate_formation(&fc, host_key, renter_key, 50, &settings),
            Err(RevisionError::WindowStartTooSoon)
        );

        let mut fc = formation_contract();
        fc.window_start = 2000;
        fc.window_end = 2020;
        assert_eq!(
            validate_formation(&fc, host_key, renter_key, 50, &settings),
            Err(RevisionError::WindowStartTooLate)
        );

        let mut fc = formation_contract();
        fc.window_end = fc.window_start + 5;
        assert_eq!(
            validate_formation(&fc, host_key, renter_key, 50, &settings),
            Err(RevisionError::WindowTooSmall)
        );
    }

    #[test]
    fn formation_rejects_low_host_payout_and_collateral() {
        let (renter_key, host_key) = keys();
        let mut fc = formation_contract();
        fc.valid_proof_outputs[HOST].value = Currency::new(10);
        fc.missed_proof_outputs[HOST].value = Currency::new(10);
        assert_eq!(
            validate_formation(&fc, host_key, renter_key, 50, &settings()),
            Err(RevisionError::HostPayoutTooSmall)
        );

        let mut fc = formation_contract();
        fc.valid_proof_outputs[HOST].value = Currency::new(100_000);
        fc.missed_proof_outputs[HOST].value = Currency::new(100_000);
        assert_eq!(
            validate_formation(&fc, host_key, renter_key, 50, &settings()),
            Err(RevisionError::CollateralTooHigh)
        );
    }

    #[test]
    fn payment_revision_moves_exact_amount() {
        let current = active_revision();
        let payment = Currency::new(100);

        let proposed = revise(
            &current,
            2,
            &[Currency::new(900), Currency::new(200)],
            &[Currency::new(900), Currency::new(200), Currency::ZERO],
        )
        .unwrap();
        validate_payment_revision(&current, &proposed, payment).unwrap();
    }

    #[test]
    fn payment_revision_rejects_short_missed_payout() {
        let current = active_revision();
        let payment = Currency::new(100);

        // One base unit short on the renter's missed output.
        let proposed = revise(
            &current,
            2,
            &[Currency::new(900), Currency::new(200)],
            &[Currency::new(901), Currency::new(199), Currency::ZERO],
        )
        .unwrap();
        assert_eq!(
            validate_payment_revision(&current, &proposed, payment),
            Err(RevisionError::RenterMissedPaymentDelta)
        );
    }

    #[test]
    fn std_revision_rejects_stale_number() {
        let current = active_revision();
        let proposed = current.clone();
        assert_eq!(
            validate_std_revision(&current, &proposed),
            Err(RevisionError::RevisionNumberNotIncreased)
        );
    }

    #[test]
    fn std_revision_rejects_payout_inflation() {
        let current = active_revision();
        let mut proposed = current.clone();
        proposed.revision_number = 2;
        proposed.valid_proof_outputs[RENTER].value = Currency::new(2000);
        assert_eq!(
            validate_std_revision(&current, &proposed),
            Err(RevisionError::ValidPayoutSumChanged)
        );
    }

    #[test]
    fn program_revision_burn_bounds() {
        let current = active_revision();
        // Burn 30 from the host missed output into the void.
        let proposed = revise(
            &current,
            2,
            &[Currency::new(1000), Currency::new(100)],
            &[Currency::new(1000), Currency::new(70), Currency::new(30)],
        )
        .unwrap();
        validate_program_revision(&current, &proposed, Currency::new(20), Currency::new(10))
            .unwrap();

        // Burning more than storage + collateral is rejected.
        assert_eq!(
            validate_program_revision(&current, &proposed, Currency::new(10), Currency::new(10)),
            Err(RevisionError::ExcessiveBurn)
        );

        // A burn larger than the host missed payout is rejected outright.
        assert_eq!(
            validate_program_revision(
                &current,
                &proposed,
                Currency::new(200),
                Currency::new(10)
            ),
            Err(RevisionError::BurnExceedsMissedPayout)
        );
    }

    #[test]
    fn clearing_revision_requires_sentinel_and_mirrored_outputs() {
        let current = active_revision();
        // A clearing revision mirrors the valid outputs onto the missed
        // side, dropping the void output.
        let mut cleared = current.clone();
        cleared.revision_number = MAX_REVISION_NUMBER;
        cleared.missed_proof_outputs = vec![
            current.valid_proof_outputs[RENTER],
            current.valid_proof_outputs[HOST],
        ];
        validate_clearing_revision(&current, &cleared).unwrap();

        // The sentinel is mandatory.
        let mut not_final = cleared.clone();
        not_final.revision_number = 7;
        assert_eq!(
            validate_clearing_revision(&current, &not_final),
            Err(RevisionError::NotMaxRevisionNumber)
        );

        // Missed must mirror valid.
        let mut skewed = cleared.clone();
        skewed.missed_proof_outputs[RENTER].value = Currency::new(1);
        assert_eq!(
            validate_clearing_revision(&current, &skewed),
            Err(RevisionError::ClearingMissedMismatch)
        );
    }

    #[test]
    fn renewal_carries_file_and_bounds_collateral() {
        let (renter_key, host_key) = keys();
        let settings = settings();
        let mut existing = active_revision();
        existing.filesize = 1 << 22;
        existing.file_merkle_root = Hash256::from_bytes([7u8; 32]);

        let renter_cost = Currency::new(200);
        let host_burn = Currency::new(50);
        let mut renewal = formation_contract();
        renewal.filesize = existing.filesize;
        renewal.file_merkle_root = existing.file_merkle_root;
        renewal.window_start = 200;
        renewal.window_end = 250;
        renewal.valid_proof_outputs[HOST].value = Currency::new(500);
        renewal.missed_proof_outputs[HOST].value = Currency::new(480);
        renewal.missed_proof_outputs[VOID_OUTPUT].value = Currency::new(60);

        validate_renewal(
            &existing,
            &renewal,
            host_key,
            renter_key,
            renter_cost,
            host_burn,
            150,
            &settings,
        )
        .unwrap();

        // The file must carry over.
        let mut wrong_root = renewal.clone();
        wrong_root.file_merkle_root = Hash256::default();
        assert_eq!(
            validate_renewal(
                &existing,
                &wrong_root,
                host_key,
                renter_key,
                renter_cost,
                host_burn,
                150,
                &settings,
            ),
            Err(RevisionError::FileMerkleRootChanged)
        );

        // Missed cannot exceed valid.
        let mut inflated = renewal.clone();
        inflated.missed_proof_outputs[HOST].value = Currency::new(600);
        assert_eq!(
            validate_renewal(
                &existing,
                &inflated,
                host_key,
                renter_key,
                renter_cost,
                host_burn,
                150,
                &settings,
            ),
            Err(RevisionError::RenewalHostMissedExceedsValid)
        );

        // Missed cannot dip below valid minus the agreed burn.
        let mut starved = renewal.clone();
        starved.missed_proof_outputs[HOST].value = Currency::new(400);
        assert_eq!(
            validate_renewal(
                &existing,
                &starved,
                host_key,
                renter_key,
                renter_cost,
                host_burn,
                150,
                &settings,
            ),
            Err(RevisionError::RenewalHostMissedBelowBurn)
        );

        // The void output must cover the burn.
        let mut small_void = renewal.clone();
        small_void.missed_proof_outputs[VOID_OUTPUT].value = Currency::new(10);
        assert_eq!(
            validate_renewal(
                &existing,
                &small_void,
                host_key,
                renter_key,
                renter_cost,
                host_burn,
                150,
                &settings,
            ),
            Err(RevisionError::RenewalVoidTooSmall)
        );
    }
}
