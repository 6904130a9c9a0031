use crate::config::ChainParams;
use crate::crypto::Address;
use crate::economics::{RewardCalculator, MAX_SUPPLY_PALS, VALIDATOR_DEPOSIT_PALS, WITHDRAWAL_DELAY_BLOCKS};
use crate::error::ValidationError;
use crate::transaction::{Transaction, TxPayload};
use rayon::prelude::*;
use std::collections::BTreeSet;

use super::chain::{Block, BlockHeader};
use super::state::{DepositStatus, LedgerState, StateDelta, StateOverlay, ValidatorRegistration};

/// What a block is checked against besides the committed state.
pub struct BlockContext<'a> {
    pub parent: &'a BlockHeader,
    /// Proposer queue for the block's height, rank 0 first. Empty when nobody is eligible.
    pub proposers: &'a [Address],
    pub params: &'a ChainParams,
    pub now_ms: u64,
}

/// Check `block` against `state` and return the changes it makes. Pure: `state` is
/// never modified.
///
/// Order: height, previous hash, proposer rank, hash/merkle/signature, block limits and
/// the rank's fallback window, every transaction in block order, then the emission cap
/// on the declared reward.
pub fn validate_block(block: &Block, state: &LedgerState, ctx: &BlockContext) -> Result<StateDelta, ValidationError> {
    let header = &block.header;
    let height = state.chain.height + 1;

    if header.height != height {
        return Err(ValidationError::HeightConflict {
            expected: height,
            got: header.height,
        });
    }
    if header.previous_hash != state.chain.last_block_hash {
        return Err(ValidationError::PreviousHashMismatch);
    }

    if ctx.proposers.is_empty() {
        return Err(ValidationError::NoEligibleProposer(height));
    }
    let rank = header.proposer_rank;
    match ctx.proposers.get(rank as usize) {
        Some(expected) if *expected == header.proposer => {}
        Some(expected) => {
            return Err(ValidationError::WrongProposer {
                expected: hex::encode(expected),
                got: hex::encode(header.proposer),
            })
        }
        None => {
            return Err(ValidationError::WrongProposer {
                expected: format!("rank < {}", ctx.proposers.len()),
                got: format!("rank {}", rank),
            })
        }
    }

    block.verify_integrity()?;
    if !block.verify_proposer_signature() {
        return Err(ValidationError::InvalidSignature);
    }

    if block.transactions.len() > ctx.params.max_txs_per_block {
        return Err(ValidationError::TooManyTransactions {
            count: block.transactions.len(),
            max: ctx.params.max_txs_per_block,
        });
    }
    if header.timestamp < ctx.parent.timestamp {
        return Err(ValidationError::TimestampOutOfRange(format!(
            "{} is before parent timestamp {}",
            header.timestamp, ctx.parent.timestamp
        )));
    }
    let opens_at = ctx.params.fallback_opens_at(ctx.parent.timestamp, rank);
    if header.timestamp < opens_at {
        return Err(ValidationError::ProposerWindowNotOpen { rank, opens_at });
    }
    let latest_allowed = ctx.now_ms.saturating_add(ctx.params.max_future_drift_secs * 1_000);
    if header.timestamp > latest_allowed {
        return Err(ValidationError::TimestampOutOfRange(format!(
            "{} is more than {}s in the future",
            header.timestamp, ctx.params.max_future_drift_secs
        )));
    }

    // Signatures are independent of state, so check them all up front.
    let signatures_ok: Vec<bool> = block
        .transactions
        .par_iter()
        .map(Transaction::verify_signature)
        .collect();

    let mut overlay = StateOverlay::new(state);
    let mut fees: u64 = 0;
    for (tx, signature_ok) in block.transactions.iter().zip(signatures_ok) {
        if !signature_ok {
            return Err(ValidationError::InvalidSignature);
        }
        apply_transaction(&mut overlay, tx, height)?;
        fees = fees.checked_add(tx.fee).ok_or(ValidationError::Overflow)?;
    }

    let eligible = overlay.eligible_validators();
    let rewards = RewardCalculator::compute(&eligible, fees, overlay.chain.total_emitted);

    let remaining = MAX_SUPPLY_PALS.saturating_sub(overlay.chain.total_emitted);
    if header.block_reward > remaining {
        return Err(ValidationError::EmissionExceeded {
            claimed: header.block_reward,
            remaining,
        });
    }
    if header.block_reward != rewards.block_reward {
        return Err(ValidationError::RewardMismatch {
            expected: rewards.block_reward,
            got: header.block_reward,
        });
    }

    if rewards.per_validator > 0 {
        for address in &eligible {
            let mut account = overlay.account(address);
            account.credit(rewards.per_validator)?;
            overlay.set_account(*address, account);
        }
    }
    overlay.chain.total_emitted = overlay
        .chain
        .total_emitted
        .checked_add(rewards.minted())
        .filter(|total| *total <= MAX_SUPPLY_PALS)
        .ok_or(ValidationError::EmissionExceeded {
            claimed: rewards.minted(),
            remaining,
        })?;
    overlay.chain.total_burned = overlay
        .chain
        .total_burned
        .checked_add(rewards.burned())
        .ok_or(ValidationError::Overflow)?;

    if !overlay.chain.transition_applied && height >= ctx.params.transition_height {
        apply_deposit_transition(&mut overlay)?;
        overlay.chain.transition_applied = true;
    }

    overlay.chain.height = height;
    overlay.chain.last_block_hash = block.hash();

    let rewarded = if rewards.per_validator > 0 { eligible } else { Vec::new() };
    let included = block.transactions.iter().map(Transaction::hash).collect();
    Ok(overlay.into_delta(rewards, rewarded, included))
}

/// Apply one transaction whose signature has already been checked.
pub fn apply_transaction(overlay: &mut StateOverlay, tx: &Transaction, height: u64) -> Result<(), ValidationError> {
    tx.check_shape()?;
    let mut sender = overlay.account(&tx.sender);
    tx.check_against(&sender)?;

    sender.nonce = tx.nonce;
    sender.debit(tx.fee)?;

    match &tx.payload {
        TxPayload::Transfer { recipient, amount } => {
            sender.debit(*amount)?;
            overlay.set_account(tx.sender, sender);
            let mut receiver = overlay.account(recipient);
            receiver.credit(*amount)?;
            overlay.set_account(*recipient, receiver);
            return Ok(());
        }
        TxPayload::RegisterValidator { device_fingerprint } => {
            if sender.is_validator {
                return Err(ValidationError::AlreadyRegistered);
            }
            if overlay.fingerprint_seen(device_fingerprint) {
                return Err(ValidationError::DuplicateDeviceFingerprint);
            }
            sender.is_validator = true;
            overlay.claim_fingerprint(*device_fingerprint, tx.sender);
            overlay.set_registration(ValidatorRegistration {
                address: tx.sender,
                device_fingerprint: *device_fingerprint,
                registration_height: height,
                active: true,
            });
        }
        TxPayload::LockDeposit => {
            if !sender.is_validator {
                return Err(ValidationError::NotAValidator);
            }
            if matches!(
                sender.deposit_status,
                DepositStatus::Active | DepositStatus::PendingWithdrawal
            ) {
                return Err(ValidationError::DepositAlreadyLocked);
            }
            sender.debit(VALIDATOR_DEPOSIT_PALS)?;
            sender.deposit_amount = VALIDATOR_DEPOSIT_PALS;
            sender.deposit_status = DepositStatus::Active;
        }
        TxPayload::RequestWithdrawal => {
            if !sender.is_validator {
                return Err(ValidationError::NotAValidator);
            }
            if sender.deposit_status != DepositStatus::Active {
                return Err(ValidationError::NoActiveDeposit);
            }
            sender.deposit_status = DepositStatus::PendingWithdrawal;
            sender.withdrawal_request_height = Some(height);
        }
        TxPayload::ProcessWithdrawal => {
            let requested_at = match (sender.deposit_status, sender.withdrawal_request_height) {
                (DepositStatus::PendingWithdrawal, Some(requested_at)) => requested_at,
                _ => return Err(ValidationError::WithdrawalNotRequested),
            };
            let ready_at = requested_at.saturating_add(WITHDRAWAL_DELAY_BLOCKS);
            if height < ready_at {
                return Err(ValidationError::WithdrawalDelayPending { ready_at });
            }
            sender.credit(sender.deposit_amount)?;
            sender.deposit_amount = 0;
            sender.deposit_status = DepositStatus::None;
            sender.withdrawal_request_height = None;
            sender.is_validator = false;
            if let Some(mut registration) = overlay.registration(&tx.sender) {
                registration.active = false;
                overlay.set_registration(registration);
            }
        }
    }

    overlay.set_account(tx.sender, sender);
    Ok(())
}

/// One-time switch from bootstrap to deposit-backed validation.
///
/// Registered validators that can afford the deposit get it locked automatically; the
/// rest wait in `InactivePendingDeposit`. A device backs at most one validator; the
/// earliest registration keeps it.
fn apply_deposit_transition(overlay: &mut StateOverlay) -> Result<(), ValidationError> {
    let mut registrations: Vec<ValidatorRegistration> = overlay
        .registered_addresses()
        .into_iter()
        .filter_map(|address| overlay.registration(&address))
        .filter(|r| r.active)
        .collect();
    registrations.sort_by_key(|r| (r.registration_height, r.address));

    let mut devices = BTreeSet::new();
    for mut registration in registrations {
        let mut account = overlay.account(&registration.address);
        if !account.is_validator {
            continue;
        }

        if !devices.insert(registration.device_fingerprint) {
            account.is_validator = false;
            registration.active = false;
            overlay.set_account(registration.address, account);
            overlay.set_registration(registration);
            continue;
        }

        match account.deposit_status {
            DepositStatus::Active | DepositStatus::PendingWithdrawal => continue,
            DepositStatus::None | DepositStatus::InactivePendingDeposit => {
                if account.balance >= VALIDATOR_DEPOSIT_PALS {
                    account.debit(VALIDATOR_DEPOSIT_PALS)?;
                    account.deposit_amount = VALIDATOR_DEPOSIT_PALS;
                    account.deposit_status = DepositStatus::Active;
                } else {
                    account.deposit_status = DepositStatus::InactivePendingDeposit;
                }
            }
        }
        overlay.set_account(registration.address, account);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, KeyPair};
    use crate::transaction::DeviceFingerprint;

    fn state_with(address: Address, balance: u64) -> LedgerState {
        let mut state = LedgerState::default();
        state.accounts.insert(
            address,
            super::super::state::Account {
                balance,
                ..Default::default()
            },
        );
        state
    }

    fn run(state: &mut LedgerState, tx: &Transaction, height: u64) -> Result<(), ValidationError> {
        let delta = {
            let mut overlay = StateOverlay::new(state);
            apply_transaction(&mut overlay, tx, height)?;
            overlay.into_delta(Default::default(), vec![], vec![])
        };
        state.apply_delta(&delta);
        Ok(())
    }

    #[test]
    fn test_validator_lifecycle() {
        let keypair = KeyPair::generate().unwrap();
        let me = keypair.address();
        let mut state = state_with(me, 150 * crate::economics::PALS_PER_TMPL);
        let fp = DeviceFingerprint(sha256(b"phone"));

        run(&mut state, &Transaction::register_validator(me, fp, 1), 10).unwrap();
        assert!(state.account(&me).is_validator);
        assert_eq!(
            run(&mut state, &Transaction::register_validator(me, fp, 2), 11),
            Err(ValidationError::AlreadyRegistered)
        );

        run(&mut state, &Transaction::lock_deposit(me, 2), 11).unwrap();
        let account = state.account(&me);
        assert_eq!(account.deposit_amount, VALIDATOR_DEPOSIT_PALS);
        assert_eq!(account.balance, 50 * crate::economics::PALS_PER_TMPL);
        assert_eq!(
            run(&mut state, &Transaction::lock_deposit(me, 3), 12),
            Err(ValidationError::DepositAlreadyLocked)
        );

        run(&mut state, &Transaction::request_withdrawal(me, 3), 20).unwrap();
        assert_eq!(state.account(&me).withdrawal_request_height, Some(20));
        assert!(state.eligible_validators().is_empty());

        assert_eq!(
            run(&mut state, &Transaction::process_withdrawal(me, 4), 70),
            Err(ValidationError::WithdrawalDelayPending { ready_at: 120 })
        );
        run(&mut state, &Transaction::process_withdrawal(me, 4), 120).unwrap();
        let account = state.account(&me);
        assert_eq!(account.balance, 150 * crate::economics::PALS_PER_TMPL);
        assert!(!account.is_validator);
        assert!(!state.registry.get(&me).unwrap().active);
    }

    #[test]
    fn test_fingerprint_never_reused() {
        let alice = sha256(b"alice");
        let bob = sha256(b"bob");
        let mut state = state_with(alice, 0);
        let fp = DeviceFingerprint(sha256(b"shared-device"));

        run(&mut state, &Transaction::register_validator(alice, fp, 1), 1).unwrap();
        assert_eq!(
            run(&mut state, &Transaction::register_validator(bob, fp, 1), 2),
            Err(ValidationError::DuplicateDeviceFingerprint)
        );
    }

    #[test]
    fn test_lifecycle_preconditions() {
        let me = sha256(b"me");
        let mut state = state_with(me, VALIDATOR_DEPOSIT_PALS);

        assert_eq!(
            run(&mut state, &Transaction::lock_deposit(me, 1), 1),
            Err(ValidationError::NotAValidator)
        );
        assert_eq!(
            run(&mut state, &Transaction::process_withdrawal(me, 1), 1),
            Err(ValidationError::WithdrawalNotRequested)
        );

        run(&mut state, &Transaction::register_validator(me, DeviceFingerprint([1u8; 32]), 1), 1).unwrap();
        assert_eq!(
            run(&mut state, &Transaction::request_withdrawal(me, 2), 2),
            Err(ValidationError::NoActiveDeposit)
        );
        if let Some(account) = state.accounts.get_mut(&me) {
            account.balance = VALIDATOR_DEPOSIT_PALS - 1;
        }
        assert!(matches!(
            run(&mut state, &Transaction::lock_deposit(me, 2), 2),
            Err(ValidationError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_transition_locks_or_parks_validators() {
        let rich = sha256(b"rich");
        let poor = sha256(b"poor");
        let mut state = state_with(rich, 300 * crate::economics::PALS_PER_TMPL);
        state.accounts.insert(poor, Default::default());
        run(&mut state, &Transaction::register_validator(rich, DeviceFingerprint([1u8; 32]), 1), 1).unwrap();
        run(&mut state, &Transaction::register_validator(poor, DeviceFingerprint([2u8; 32]), 1), 2).unwrap();

        let delta = {
            let mut overlay = StateOverlay::new(&state);
            apply_deposit_transition(&mut overlay).unwrap();
            overlay.chain.transition_applied = true;
            overlay.into_delta(Default::default(), vec![], vec![])
        };
        state.apply_delta(&delta);

        let rich_account = state.account(&rich);
        assert_eq!(rich_account.deposit_status, DepositStatus::Active);
        assert_eq!(rich_account.balance, 200 * crate::economics::PALS_PER_TMPL);
        assert_eq!(state.account(&poor).deposit_status, DepositStatus::InactivePendingDeposit);
        assert_eq!(state.eligible_validators(), vec![rich]);
    }

    #[test]
    fn test_reward_capped_by_remaining_supply() {
        let keypair = KeyPair::generate().unwrap();
        let me = keypair.address();
        let mut state = state_with(me, 0);
        run(&mut state, &Transaction::register_validator(me, DeviceFingerprint([7u8; 32]), 1), 1).unwrap();

        let parent = Block::new(0, [0u8; 32], 1_000, [0u8; 32], 0, vec![]);
        state.chain.last_block_hash = parent.hash();
        state.chain.total_emitted = MAX_SUPPLY_PALS - 1_960;

        let params = ChainParams::default();
        let ctx = BlockContext {
            parent: &parent.header,
            proposers: &[me],
            params: &params,
            now_ms: 10_000,
        };
        let claim = |reward: u64| {
            let mut block = Block::new(1, parent.hash(), 4_000, me, reward, vec![]);
            block.sign(&keypair).unwrap();
            validate_block(&block, &state, &ctx)
        };

        assert_eq!(
            claim(crate::economics::EMISSION_PER_BLOCK_PALS).unwrap_err(),
            ValidationError::EmissionExceeded {
                claimed: crate::economics::EMISSION_PER_BLOCK_PALS,
                remaining: 1_960
            }
        );
        assert_eq!(
            claim(1_000).unwrap_err(),
            ValidationError::RewardMismatch { expected: 1_960, got: 1_000 }
        );
        let delta = claim(1_960).unwrap();
        assert_eq!(delta.chain.total_emitted, MAX_SUPPLY_PALS);
    }
}
