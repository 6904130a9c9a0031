//! Shared fixtures: a small validator set and helpers to grow chains from it.

#![allow(dead_code)]

use timpal::blockchain::{Block, GenesisSpec, Ledger};
use timpal::config::ChainParams;
use timpal::crypto::{sha256, Address, KeyPair};
use timpal::economics;
use timpal::persistence::{InMemoryPersistence, Persistence};
use timpal::transaction::{DeviceFingerprint, Transaction};

pub const GENESIS_TS: u64 = 1_700_000_000_000;

pub struct TestNet {
    pub validators: Vec<KeyPair>,
    pub genesis: GenesisSpec,
    pub params: ChainParams,
}

impl TestNet {
    /// `balances[i]` is the genesis allocation of validator `i`.
    pub fn new(balances: &[u64]) -> Self {
        let validators: Vec<KeyPair> = balances.iter().map(|_| KeyPair::generate().unwrap()).collect();
        let genesis = GenesisSpec {
            timestamp: GENESIS_TS,
            allocations: validators
                .iter()
                .zip(balances)
                .map(|(k, b)| (k.address(), *b))
                .collect(),
            validators: validators
                .iter()
                .enumerate()
                .map(|(i, k)| (k.address(), DeviceFingerprint(sha256(format!("device-{i}").as_bytes()))))
                .collect(),
        };
        TestNet {
            validators,
            genesis,
            params: ChainParams {
                chain_id: "timpal-test".to_string(),
                ..ChainParams::default()
            },
        }
    }

    /// Fund a non-validator account at genesis.
    pub fn with_account(mut self, address: Address, balance: u64) -> Self {
        self.genesis.allocations.push((address, balance));
        self
    }

    pub fn ledger(&self) -> Ledger {
        self.ledger_on(Box::new(InMemoryPersistence::new()))
    }

    pub fn ledger_on(&self, store: Box<dyn Persistence>) -> Ledger {
        Ledger::open(self.params.clone(), &self.genesis, store).unwrap()
    }

    pub fn proposer_key(&self, ledger: &Ledger) -> &KeyPair {
        let proposer = ledger.expected_proposer().expect("an eligible proposer");
        self.key_for(&proposer)
    }

    pub fn key_for(&self, address: &Address) -> &KeyPair {
        self.validators
            .iter()
            .find(|k| &k.address() == address)
            .expect("address is a test validator")
    }

    /// Empty next block from the rank-`rank` proposer, stamped `ts`.
    pub fn ranked_block(&self, ledger: &Ledger, rank: u32, ts: u64) -> Block {
        let (proposer, _) = ledger.proposer_queue()[rank as usize];
        let mut block = Block::new(
            ledger.height() + 1,
            ledger.tip_hash(),
            ts,
            proposer,
            economics::block_reward(ledger.state().chain.total_emitted),
            vec![],
        )
        .with_proposer_rank(rank);
        block.sign(self.key_for(&proposer)).unwrap();
        block
    }

    /// Next block from the expected proposer. `ts_offset` shifts the timestamp so
    /// two chains grown from the same genesis diverge.
    pub fn next_block(&self, ledger: &Ledger, txs: Vec<Transaction>, ts_offset: u64) -> Block {
        let ts = GENESIS_TS + (ledger.height() + 1) * 3_000 + ts_offset;
        ledger.build_block(self.proposer_key(ledger), txs, ts).unwrap()
    }

    /// Next block with exactly `txs`, valid or not.
    pub fn forced_block(&self, ledger: &Ledger, txs: Vec<Transaction>) -> Block {
        let key = self.proposer_key(ledger);
        let mut block = Block::new(
            ledger.height() + 1,
            ledger.tip_hash(),
            GENESIS_TS + (ledger.height() + 1) * 3_000,
            key.address(),
            economics::block_reward(ledger.state().chain.total_emitted),
            txs,
        );
        block.sign(key).unwrap();
        block
    }

    pub fn grow(&self, ledger: &mut Ledger, count: u64, ts_offset: u64) {
        for _ in 0..count {
            let block = self.next_block(ledger, vec![], ts_offset);
            ledger.apply_block(block).unwrap();
        }
    }

    /// Blocks above `fork_height` of a fresh chain grown to `tip` with `ts_offset`.
    pub fn branch(&self, fork_height: u64, tip: u64, ts_offset: u64) -> Vec<Block> {
        let mut other = self.ledger();
        self.grow(&mut other, fork_height, 0);
        self.grow(&mut other, tip - fork_height, ts_offset);
        other.blocks_from(fork_height + 1, usize::MAX)
    }
}

pub fn transfer(from: &KeyPair, to: Address, amount: u64, nonce: u64) -> Transaction {
    Transaction::transfer(from.address(), to, amount, nonce)
        .signed_by(from)
        .unwrap()
}
