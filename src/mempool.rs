//! Pending transaction pool
//!
//! Admission re-checks signature, nonce and balance against the last committed
//! snapshot, never against in-flight state. At most one entry is kept per
//! (sender, nonce); a newer transaction for the same slot replaces the old one.

use crate::blockchain::{SharedSnapshot, Sha256Hash};
use crate::crypto::Address;
use crate::error::ChainError;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_MAX_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub hash: Sha256Hash,
    pub arrival: u64,
    pub received_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Added,
    /// Took the slot of an earlier transaction with the same sender and nonce.
    Replaced,
    Duplicate,
}

impl AdmitOutcome {
    /// Whether peers should hear about it.
    pub fn is_new(&self) -> bool {
        !matches!(self, AdmitOutcome::Duplicate)
    }
}

#[derive(Default)]
struct MempoolInner {
    entries: HashMap<Sha256Hash, MempoolEntry>,
    slots: BTreeMap<(Address, u64), Sha256Hash>,
    next_arrival: u64,
}

impl MempoolInner {
    fn remove(&mut self, hash: &Sha256Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;
        self.slots.remove(&(entry.tx.sender, entry.tx.nonce));
        Some(entry)
    }
}

pub struct Mempool {
    inner: RwLock<MempoolInner>,
    snapshot: SharedSnapshot,
    max_size: usize,
    retention: Duration,
}

impl Mempool {
    pub fn new(snapshot: SharedSnapshot, max_size: usize, retention: Duration) -> Self {
        Mempool {
            inner: RwLock::new(MempoolInner::default()),
            snapshot,
            max_size,
            retention,
        }
    }

    pub fn admit(&self, tx: Transaction) -> Result<AdmitOutcome, ChainError> {
        let snapshot = self.snapshot.read().clone();
        if let Err(e) = tx.validate(&snapshot.account(&tx.sender)) {
            debug!("Mempool refused {}: {}", tx.hash_str(), e.kind());
            return Err(e.into());
        }

        let hash = tx.hash();
        let now = Instant::now();
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&hash) {
            return Ok(AdmitOutcome::Duplicate);
        }
        Self::expire(&mut inner, now, self.retention);

        let slot = (tx.sender, tx.nonce);
        let outcome = match inner.slots.get(&slot).copied() {
            Some(previous) => {
                inner.remove(&previous);
                AdmitOutcome::Replaced
            }
            None if inner.entries.len() >= self.max_size => return Err(ChainError::MempoolFull),
            None => AdmitOutcome::Added,
        };

        let arrival = inner.next_arrival;
        inner.next_arrival += 1;
        inner.slots.insert(slot, hash);
        inner.entries.insert(
            hash,
            MempoolEntry {
                tx,
                hash,
                arrival,
                received_at: now,
            },
        );
        Ok(outcome)
    }

    /// Oldest arrivals first.
    pub fn select_for_block(&self, max_count: usize) -> Vec<Transaction> {
        let mut inner = self.inner.write();
        Self::expire(&mut inner, Instant::now(), self.retention);
        let mut entries: Vec<&MempoolEntry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.arrival);
        entries.into_iter().take(max_count).map(|e| e.tx.clone()).collect()
    }

    /// Drop what a committed block included, plus anything whose nonce is now stale.
    pub fn on_commit(&self, included: &[Sha256Hash]) -> usize {
        let snapshot = self.snapshot.read().clone();
        let mut inner = self.inner.write();
        let mut removed = 0;
        for hash in included {
            if inner.remove(hash).is_some() {
                removed += 1;
            }
        }
        let stale: Vec<Sha256Hash> = inner
            .entries
            .values()
            .filter(|e| e.tx.nonce <= snapshot.account(&e.tx.sender).nonce)
            .map(|e| e.hash)
            .collect();
        for hash in &stale {
            inner.remove(hash);
        }
        removed + stale.len()
    }

    /// Offer transactions from orphaned blocks again. Returns how many were taken back.
    pub fn readmit(&self, txs: impl IntoIterator<Item = Transaction>) -> usize {
        txs.into_iter()
            .filter(|tx| matches!(self.admit(tx.clone()), Ok(outcome) if outcome.is_new()))
            .count()
    }

    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write();
        Self::expire(&mut inner, Instant::now(), self.retention)
    }

    fn expire(inner: &mut MempoolInner, now: Instant, retention: Duration) -> usize {
        let expired: Vec<Sha256Hash> = inner
            .entries
            .values()
            .filter(|e| now.duration_since(e.received_at) > retention)
            .map(|e| e.hash)
            .collect();
        for hash in &expired {
            inner.remove(hash);
        }
        expired.len()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.inner.read().entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Account, LedgerSnapshot};
    use crate::crypto::{sha256, KeyPair};
    use crate::error::ValidationError;
    use std::sync::Arc;

    fn pool_for(accounts: &[(Address, Account)], max_size: usize) -> (Mempool, SharedSnapshot) {
        let snapshot = LedgerSnapshot {
            accounts: accounts.iter().cloned().collect(),
            ..LedgerSnapshot::default()
        };
        let shared: SharedSnapshot = Arc::new(RwLock::new(Arc::new(snapshot)));
        (
            Mempool::new(Arc::clone(&shared), max_size, Duration::from_secs(3_600)),
            shared,
        )
    }

    fn rich(keypair: &KeyPair) -> (Address, Account) {
        (
            keypair.address(),
            Account {
                balance: 10_000_000,
                ..Account::default()
            },
        )
    }

    fn transfer(keypair: &KeyPair, amount: u64, nonce: u64) -> Transaction {
        Transaction::transfer(keypair.address(), sha256(b"bob"), amount, nonce)
            .signed_by(keypair)
            .unwrap()
    }

    #[test]
    fn test_admit_and_select_fifo() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (pool, _) = pool_for(&[rich(&a), rich(&b)], 10);

        let first = transfer(&b, 1, 1);
        let second = transfer(&a, 2, 1);
        assert_eq!(pool.admit(first.clone()).unwrap(), AdmitOutcome::Added);
        assert_eq!(pool.admit(second.clone()).unwrap(), AdmitOutcome::Added);
        assert_eq!(pool.admit(first.clone()).unwrap(), AdmitOutcome::Duplicate);

        assert_eq!(pool.select_for_block(10), vec![first.clone(), second]);
        assert_eq!(pool.select_for_block(1), vec![first]);
    }

    #[test]
    fn test_rejects_against_committed_snapshot() {
        let a = KeyPair::generate().unwrap();
        let (pool, _) = pool_for(&[rich(&a)], 10);

        let err = pool.admit(transfer(&a, 1, 2)).unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationError::NonceMismatch { expected: 1, got: 2 })
        );
        let err = pool.admit(transfer(&a, 20_000_000, 1)).unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(ValidationError::InsufficientBalance { .. })
        ));

        let unsigned = Transaction::transfer(a.address(), sha256(b"bob"), 1, 1);
        assert_eq!(
            pool.admit(unsigned).unwrap_err().validation(),
            Some(&ValidationError::InvalidSignature)
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_same_slot_replaces() {
        let a = KeyPair::generate().unwrap();
        let (pool, _) = pool_for(&[rich(&a)], 10);
        let old = transfer(&a, 1, 1);
        let new = transfer(&a, 2, 1);
        pool.admit(old.clone()).unwrap();
        assert_eq!(pool.admit(new.clone()).unwrap(), AdmitOutcome::Replaced);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&new.hash()));
        assert!(!pool.contains(&old.hash()));
    }

    #[test]
    fn test_full_pool_refuses() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (pool, _) = pool_for(&[rich(&a), rich(&b)], 1);
        pool.admit(transfer(&a, 1, 1)).unwrap();
        assert!(matches!(pool.admit(transfer(&b, 1, 1)), Err(ChainError::MempoolFull)));
        // Replacing an existing slot does not need room.
        assert_eq!(pool.admit(transfer(&a, 5, 1)).unwrap(), AdmitOutcome::Replaced);
    }

    #[test]
    fn test_commit_evicts_included_and_stale() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (pool, shared) = pool_for(&[rich(&a), rich(&b)], 10);
        let included = transfer(&a, 1, 1);
        let stale = transfer(&b, 1, 1);
        pool.admit(included.clone()).unwrap();
        pool.admit(stale.clone()).unwrap();

        // b's nonce 1 was consumed by a different transaction in the block.
        let mut next = (**shared.read()).clone();
        next.accounts.get_mut(&a.address()).unwrap().nonce = 1;
        next.accounts.get_mut(&b.address()).unwrap().nonce = 1;
        *shared.write() = Arc::new(next);

        assert_eq!(pool.on_commit(&[included.hash()]), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_retention_window() {
        let a = KeyPair::generate().unwrap();
        let snapshot = LedgerSnapshot {
            accounts: [rich(&a)].into_iter().collect(),
            ..LedgerSnapshot::default()
        };
        let pool = Mempool::new(Arc::new(RwLock::new(Arc::new(snapshot))), 10, Duration::ZERO);
        pool.admit(transfer(&a, 1, 1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.purge_expired(), 1);
        assert!(pool.is_empty());
    }
}
