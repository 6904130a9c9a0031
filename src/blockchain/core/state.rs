use crate::crypto::Address;
use crate::economics::RewardOutcome;
use crate::error::{ChainError, ValidationError};
use crate::transaction::DeviceFingerprint;
use std::collections::{BTreeMap, BTreeSet};

use super::chain::{GenesisSpec, Sha256Hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum DepositStatus {
    #[default]
    None,
    Active,
    PendingWithdrawal,
    /// Registered before the transition without enough balance to auto-lock.
    InactivePendingDeposit,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
    pub is_validator: bool,
    pub deposit_amount: u64,
    pub deposit_status: DepositStatus,
    pub withdrawal_request_height: Option<u64>,
}

impl Account {
    pub fn credit(&mut self, amount: u64) -> Result<(), ValidationError> {
        self.balance = self.balance.checked_add(amount).ok_or(ValidationError::Overflow)?;
        Ok(())
    }

    pub fn debit(&mut self, amount: u64) -> Result<(), ValidationError> {
        self.balance = self
            .balance
            .checked_sub(amount)
            .ok_or(ValidationError::InsufficientBalance {
                required: amount,
                available: self.balance,
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ChainState {
    pub height: u64,
    pub total_emitted: u64,
    /// Fees that were collected but not redistributed (no eligible validators).
    pub total_burned: u64,
    pub last_block_hash: Sha256Hash,
    pub transition_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidatorRegistration {
    pub address: Address,
    pub device_fingerprint: DeviceFingerprint,
    pub registration_height: u64,
    pub active: bool,
}

/// Registrations are never removed. `fingerprints` remembers every device ever
/// registered, including ones whose validator has since left.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ValidatorRegistry {
    pub registrations: BTreeMap<Address, ValidatorRegistration>,
    pub fingerprints: BTreeMap<DeviceFingerprint, Address>,
}

impl ValidatorRegistry {
    pub fn get(&self, address: &Address) -> Option<&ValidatorRegistration> {
        self.registrations.get(address)
    }

    pub fn active(&self) -> impl Iterator<Item = &ValidatorRegistration> {
        self.registrations.values().filter(|r| r.active)
    }
}

/// Whether a validator takes part in proposing and rewards.
///
/// Before the transition any registered, non-withdrawing validator counts; afterwards
/// only those with an active deposit.
pub fn is_eligible(
    account: &Account,
    registration: Option<&ValidatorRegistration>,
    transition_applied: bool,
) -> bool {
    if !account.is_validator || !registration.is_some_and(|r| r.active) {
        return false;
    }
    if transition_applied {
        account.deposit_status == DepositStatus::Active
    } else {
        account.deposit_status != DepositStatus::PendingWithdrawal
    }
}

/// Everything the ledger commits: chain metadata, accounts and the validator registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct LedgerState {
    pub chain: ChainState,
    pub accounts: BTreeMap<Address, Account>,
    pub registry: ValidatorRegistry,
    pub genesis_allocation: u64,
}

impl LedgerState {
    pub fn from_genesis(spec: &GenesisSpec, genesis_hash: Sha256Hash) -> Result<Self, ChainError> {
        let mut state = LedgerState {
            chain: ChainState {
                last_block_hash: genesis_hash,
                ..ChainState::default()
            },
            genesis_allocation: spec.total_allocation()?,
            ..LedgerState::default()
        };

        for (address, amount) in &spec.allocations {
            state
                .accounts
                .entry(*address)
                .or_default()
                .credit(*amount)
                .map_err(ChainError::from)?;
        }
        for (address, fingerprint) in &spec.validators {
            if state.registry.fingerprints.contains_key(fingerprint) || state.registry.get(address).is_some() {
                return Err(ChainError::ConfigError(format!(
                    "Genesis validator {} duplicates an address or device fingerprint",
                    hex::encode(address)
                )));
            }
            state.accounts.entry(*address).or_default().is_validator = true;
            state.registry.fingerprints.insert(*fingerprint, *address);
            state.registry.registrations.insert(
                *address,
                ValidatorRegistration {
                    address: *address,
                    device_fingerprint: *fingerprint,
                    registration_height: 0,
                    active: true,
                },
            );
        }
        Ok(state)
    }

    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    /// Validators allowed to propose and earn at the current height, in address order.
    pub fn eligible_validators(&self) -> Vec<Address> {
        self.registry
            .active()
            .filter(|r| {
                self.accounts
                    .get(&r.address)
                    .is_some_and(|a| is_eligible(a, Some(r), self.chain.transition_applied))
            })
            .map(|r| r.address)
            .collect()
    }

    /// Σ balances + Σ locked deposits.
    pub fn circulating(&self) -> u128 {
        self.accounts
            .values()
            .map(|a| a.balance as u128 + a.deposit_amount as u128)
            .sum()
    }

    /// Σ balances + Σ deposits + burned == emitted + genesis allocation.
    pub fn supply_is_conserved(&self) -> bool {
        self.circulating() + self.chain.total_burned as u128
            == self.chain.total_emitted as u128 + self.genesis_allocation as u128
    }

    pub fn apply_delta(&mut self, delta: &StateDelta) {
        for (address, account) in &delta.accounts {
            self.accounts.insert(*address, account.clone());
        }
        for (address, registration) in &delta.registrations {
            self.registry.registrations.insert(*address, registration.clone());
        }
        for (fingerprint, address) in &delta.fingerprints {
            self.registry.fingerprints.insert(*fingerprint, *address);
        }
        self.chain = delta.chain.clone();
    }

    /// Apply `delta` and return what it overwrote, so the block can be rolled back
    /// with [`LedgerState::revert`].
    pub fn apply_recording(&mut self, delta: &StateDelta) -> StateUndo {
        let undo = StateUndo {
            accounts: delta
                .accounts
                .keys()
                .map(|address| (*address, self.accounts.get(address).cloned()))
                .collect(),
            registrations: delta
                .registrations
                .keys()
                .map(|address| (*address, self.registry.registrations.get(address).cloned()))
                .collect(),
            fingerprints: delta
                .fingerprints
                .keys()
                .map(|fingerprint| (*fingerprint, self.registry.fingerprints.get(fingerprint).copied()))
                .collect(),
            chain: self.chain.clone(),
        };
        self.apply_delta(delta);
        undo
    }

    /// Undo one [`LedgerState::apply_recording`]. Undos must be reverted newest first.
    pub fn revert(&mut self, undo: &StateUndo) {
        for (address, previous) in &undo.accounts {
            match previous {
                Some(account) => self.accounts.insert(*address, account.clone()),
                None => self.accounts.remove(address),
            };
        }
        for (address, previous) in &undo.registrations {
            match previous {
                Some(registration) => self.registry.registrations.insert(*address, registration.clone()),
                None => self.registry.registrations.remove(address),
            };
        }
        for (fingerprint, previous) in &undo.fingerprints {
            match previous {
                Some(address) => self.registry.fingerprints.insert(*fingerprint, *address),
                None => self.registry.fingerprints.remove(fingerprint),
            };
        }
        self.chain = undo.chain.clone();
    }
}

/// Values one block's [`StateDelta`] replaced. `None` means the key did not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUndo {
    accounts: Vec<(Address, Option<Account>)>,
    registrations: Vec<(Address, Option<ValidatorRegistration>)>,
    fingerprints: Vec<(DeviceFingerprint, Option<Address>)>,
    chain: ChainState,
}

/// Result of validating one block: every change it makes, ready to commit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateDelta {
    pub accounts: BTreeMap<Address, Account>,
    pub registrations: BTreeMap<Address, ValidatorRegistration>,
    pub fingerprints: BTreeMap<DeviceFingerprint, Address>,
    pub chain: ChainState,
    pub rewards: RewardOutcome,
    pub rewarded: Vec<Address>,
    pub included: Vec<Sha256Hash>,
}

/// Copy-on-write view over a committed [`LedgerState`]. Validation writes here; the
/// base is only touched when the resulting [`StateDelta`] is committed.
pub struct StateOverlay<'a> {
    base: &'a LedgerState,
    accounts: BTreeMap<Address, Account>,
    registrations: BTreeMap<Address, ValidatorRegistration>,
    fingerprints: BTreeMap<DeviceFingerprint, Address>,
    pub chain: ChainState,
}

impl<'a> StateOverlay<'a> {
    pub fn new(base: &'a LedgerState) -> Self {
        StateOverlay {
            base,
            accounts: BTreeMap::new(),
            registrations: BTreeMap::new(),
            fingerprints: BTreeMap::new(),
            chain: base.chain.clone(),
        }
    }

    pub fn account(&self, address: &Address) -> Account {
        match self.accounts.get(address) {
            Some(account) => account.clone(),
            None => self.base.account(address),
        }
    }

    pub fn set_account(&mut self, address: Address, account: Account) {
        self.accounts.insert(address, account);
    }

    pub fn registration(&self, address: &Address) -> Option<ValidatorRegistration> {
        self.registrations
            .get(address)
            .or_else(|| self.base.registry.get(address))
            .cloned()
    }

    pub fn set_registration(&mut self, registration: ValidatorRegistration) {
        self.registrations.insert(registration.address, registration);
    }

    pub fn fingerprint_seen(&self, fingerprint: &DeviceFingerprint) -> bool {
        self.fingerprints.contains_key(fingerprint) || self.base.registry.fingerprints.contains_key(fingerprint)
    }

    pub fn claim_fingerprint(&mut self, fingerprint: DeviceFingerprint, address: Address) {
        self.fingerprints.insert(fingerprint, address);
    }

    /// Every address that has ever registered, committed or staged.
    pub fn registered_addresses(&self) -> BTreeSet<Address> {
        self.base
            .registry
            .registrations
            .keys()
            .chain(self.registrations.keys())
            .copied()
            .collect()
    }

    pub fn eligible_validators(&self) -> Vec<Address> {
        self.registered_addresses()
            .into_iter()
            .filter(|address| {
                let registration = self.registration(address);
                is_eligible(&self.account(address), registration.as_ref(), self.chain.transition_applied)
            })
            .collect()
    }

    pub fn into_delta(self, rewards: RewardOutcome, rewarded: Vec<Address>, included: Vec<Sha256Hash>) -> StateDelta {
        StateDelta {
            accounts: self.accounts,
            registrations: self.registrations,
            fingerprints: self.fingerprints,
            chain: self.chain,
            rewards,
            rewarded,
            included,
        }
    }
}

/// Read-only view published after every commit. Mempool admission and queries use it
/// without touching the ledger lock.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub chain: ChainState,
    pub accounts: BTreeMap<Address, Account>,
    pub validator_count: usize,
}

impl LedgerSnapshot {
    pub fn from_state(state: &LedgerState) -> Self {
        LedgerSnapshot {
            chain: state.chain.clone(),
            accounts: state.accounts.clone(),
            validator_count: state.eligible_validators().len(),
        }
    }

    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn genesis() -> GenesisSpec {
        GenesisSpec {
            timestamp: 0,
            allocations: vec![(sha256(b"a"), 1_000), (sha256(b"b"), 500)],
            validators: vec![
                (sha256(b"a"), DeviceFingerprint(sha256(b"dev-a"))),
                (sha256(b"c"), DeviceFingerprint(sha256(b"dev-c"))),
            ],
        }
    }

    #[test]
    fn test_genesis_state() {
        let state = LedgerState::from_genesis(&genesis(), [1u8; 32]).unwrap();
        assert_eq!(state.genesis_allocation, 1_500);
        assert_eq!(state.account(&sha256(b"a")).balance, 1_000);
        assert!(state.account(&sha256(b"c")).is_validator);
        assert_eq!(state.eligible_validators().len(), 2);
        assert!(state.supply_is_conserved());
    }

    #[test]
    fn test_duplicate_genesis_fingerprint_rejected() {
        let mut spec = genesis();
        spec.validators.push((sha256(b"d"), DeviceFingerprint(sha256(b"dev-a"))));
        assert!(LedgerState::from_genesis(&spec, [1u8; 32]).is_err());
    }

    #[test]
    fn test_eligibility_by_phase() {
        let registration = ValidatorRegistration {
            address: sha256(b"v"),
            device_fingerprint: DeviceFingerprint([9u8; 32]),
            registration_height: 1,
            active: true,
        };
        let mut account = Account {
            is_validator: true,
            ..Account::default()
        };
        assert!(is_eligible(&account, Some(&registration), false));
        assert!(!is_eligible(&account, Some(&registration), true));

        account.deposit_status = DepositStatus::Active;
        assert!(is_eligible(&account, Some(&registration), true));

        account.deposit_status = DepositStatus::PendingWithdrawal;
        assert!(!is_eligible(&account, Some(&registration), false));
        assert!(!is_eligible(&account, None, false));
    }

    #[test]
    fn test_overlay_leaves_base_untouched_until_commit() {
        let mut state = LedgerState::from_genesis(&genesis(), [1u8; 32]).unwrap();
        let a = sha256(b"a");

        let delta = {
            let mut overlay = StateOverlay::new(&state);
            let mut account = overlay.account(&a);
            account.debit(400).unwrap();
            overlay.set_account(a, account);
            overlay.chain.height = 1;
            assert_eq!(overlay.account(&a).balance, 600);
            overlay.into_delta(RewardOutcome::default(), vec![], vec![])
        };
        assert_eq!(state.account(&a).balance, 1_000);

        state.apply_delta(&delta);
        assert_eq!(state.account(&a).balance, 600);
        assert_eq!(state.chain.height, 1);
    }

    #[test]
    fn test_revert_restores_previous_state_exactly() {
        let mut state = LedgerState::from_genesis(&genesis(), [1u8; 32]).unwrap();
        let before = state.clone();
        let a = sha256(b"a");
        let newcomer = sha256(b"newcomer");

        let delta = {
            let mut overlay = StateOverlay::new(&state);
            let mut account = overlay.account(&a);
            account.debit(250).unwrap();
            overlay.set_account(a, account);
            overlay.set_account(newcomer, Account { balance: 250, ..Account::default() });
            overlay.set_registration(ValidatorRegistration {
                address: newcomer,
                device_fingerprint: DeviceFingerprint([5u8; 32]),
                registration_height: 1,
                active: true,
            });
            overlay.claim_fingerprint(DeviceFingerprint([5u8; 32]), newcomer);
            overlay.chain.height = 1;
            overlay.chain.last_block_hash = [2u8; 32];
            overlay.into_delta(RewardOutcome::default(), vec![], vec![])
        };
        let undo = state.apply_recording(&delta);
        assert_eq!(state.account(&newcomer).balance, 250);
        assert_ne!(state, before);

        state.revert(&undo);
        assert_eq!(state, before);
        assert!(!state.accounts.contains_key(&newcomer));
        assert!(state.registry.get(&newcomer).is_none());
    }

    #[test]
    fn test_debit_below_zero_fails() {
        let mut account = Account {
            balance: 10,
            ..Account::default()
        };
        assert_eq!(
            account.debit(11),
            Err(ValidationError::InsufficientBalance {
                required: 11,
                available: 10
            })
        );
        assert_eq!(account.balance, 10);
    }
}
