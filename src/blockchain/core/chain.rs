use crate::crypto::{double_sha256, sha256, verify_signed_by, Address, KeyPair};
use crate::error::{ChainError, ValidationError};
use crate::transaction::{DeviceFingerprint, Transaction};
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: Sha256Hash,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub merkle_root: Sha256Hash,
    pub proposer: Address,
    /// Position of `proposer` in the height's proposer queue. Rank `k > 0` may only
    /// propose once the fallback windows of ranks `0..k` have passed.
    pub proposer_rank: u32,
    /// Emission claimed by this block, already clipped to the cap.
    pub block_reward: u64,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 32 + 8 + 32 + 32 + 4 + 8);
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.previous_hash);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.proposer);
        out.extend_from_slice(&self.proposer_rank.to_le_bytes());
        out.extend_from_slice(&self.block_reward.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Sha256Hash {
        double_sha256(&self.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub block_hash: Sha256Hash,
    pub proposer_public_key: Vec<u8>,
    pub proposer_signature: Vec<u8>,
}

impl Block {
    /// Unsigned block; `block_hash` is filled in from the header.
    pub fn new(
        height: u64,
        previous_hash: Sha256Hash,
        timestamp: u64,
        proposer: Address,
        block_reward: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let merkle_root = Block::calculate_merkle_root(&transactions);
        let header = BlockHeader {
            height,
            previous_hash,
            timestamp,
            merkle_root,
            proposer,
            proposer_rank: 0,
            block_reward,
        };
        Block {
            block_hash: header.hash(),
            header,
            transactions,
            proposer_public_key: Vec::new(),
            proposer_signature: Vec::new(),
        }
    }

    /// Claim a fallback slot. Must be called before [`Block::sign`].
    pub fn with_proposer_rank(mut self, rank: u32) -> Self {
        self.header.proposer_rank = rank;
        self.block_hash = self.header.hash();
        self
    }

    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        self.proposer_signature = keypair.sign(&self.block_hash)?.to_vec();
        self.proposer_public_key = keypair.public_key_bytes().to_vec();
        Ok(())
    }

    pub fn hash(&self) -> Sha256Hash {
        self.block_hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Pairwise SHA-256 tree over transaction ids; an odd node is paired with itself.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Sha256Hash {
        let hashes: Vec<Sha256Hash> = transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root_hashes(&hashes)
    }

    /// Header hash and merkle root both match the block contents.
    pub fn verify_integrity(&self) -> Result<(), ValidationError> {
        if self.header.hash() != self.block_hash {
            return Err(ValidationError::BadBlockHash);
        }
        if Block::calculate_merkle_root(&self.transactions) != self.header.merkle_root {
            return Err(ValidationError::BadMerkleRoot);
        }
        Ok(())
    }

    /// Signed over `block_hash` by the key that hashes to `header.proposer`.
    pub fn verify_proposer_signature(&self) -> bool {
        verify_signed_by(
            &self.header.proposer,
            &self.proposer_public_key,
            &self.block_hash,
            &self.proposer_signature,
        )
    }

    pub fn collected_fees(&self) -> Result<u64, ValidationError> {
        self.transactions
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.fee).ok_or(ValidationError::Overflow))
    }
}

pub fn merkle_root_hashes(hashes: &[Sha256Hash]) -> Sha256Hash {
    if hashes.is_empty() {
        return sha256(b"");
    }
    let mut level: Vec<Sha256Hash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next: Vec<Sha256Hash> = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let a = pair[0];
            let b = pair.get(1).copied().unwrap_or(a);
            let mut hasher = Sha256::new();
            hasher.update(a);
            hasher.update(b);
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    level[0]
}

/// The height-0 state every node on a network agrees on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GenesisSpec {
    pub timestamp: u64,
    pub allocations: Vec<(Address, u64)>,
    pub validators: Vec<(Address, DeviceFingerprint)>,
}

impl GenesisSpec {
    pub fn total_allocation(&self) -> Result<u64, ChainError> {
        self.allocations
            .iter()
            .try_fold(0u64, |acc, (_, amount)| acc.checked_add(*amount))
            .ok_or_else(|| ChainError::ConfigError("Genesis allocation overflows u64".to_string()))
    }

    /// Deterministic genesis block. Allocations and validators are committed through the
    /// merkle root, so a node started with a different genesis config gets a different hash.
    pub fn block(&self) -> Block {
        let mut allocations = self.allocations.clone();
        allocations.sort();
        let mut validators = self.validators.clone();
        validators.sort();

        let mut leaves = Vec::with_capacity(allocations.len() + validators.len());
        for (address, amount) in &allocations {
            let mut hasher = Sha256::new();
            hasher.update(b"allocation");
            hasher.update(address);
            hasher.update(amount.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (address, fingerprint) in &validators {
            let mut hasher = Sha256::new();
            hasher.update(b"validator");
            hasher.update(address);
            hasher.update(fingerprint.0);
            leaves.push(hasher.finalize().into());
        }

        let header = BlockHeader {
            height: 0,
            previous_hash: [0u8; 32],
            timestamp: self.timestamp,
            merkle_root: merkle_root_hashes(&leaves),
            proposer: [0u8; 32],
            proposer_rank: 0,
            block_reward: 0,
        };
        Block {
            block_hash: header.hash(),
            header,
            transactions: Vec::new(),
            proposer_public_key: Vec::new(),
            proposer_signature: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_shapes() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");
        assert_eq!(merkle_root_hashes(&[]), sha256(b""));
        assert_eq!(merkle_root_hashes(&[a]), a);

        let ab = {
            let mut h = Sha256::new();
            h.update(a);
            h.update(b);
            let out: Sha256Hash = h.finalize().into();
            out
        };
        assert_eq!(merkle_root_hashes(&[a, b]), ab);
        // Order matters.
        assert_ne!(merkle_root_hashes(&[b, a]), ab);
        // Odd leaf is duplicated.
        let cc = merkle_root_hashes(&[c, c]);
        assert_eq!(merkle_root_hashes(&[a, b, c]), merkle_root_hashes(&[ab, cc]));
    }

    #[test]
    fn test_signed_block_verifies() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(keypair.address(), sha256(b"bob"), 5, 1)
            .signed_by(&keypair)
            .unwrap();
        let mut block = Block::new(1, [7u8; 32], 1_000, keypair.address(), 63_450_000, vec![tx]);
        block.sign(&keypair).unwrap();

        assert!(block.verify_integrity().is_ok());
        assert!(block.verify_proposer_signature());
        assert_eq!(block.collected_fees().unwrap(), 50_000);
    }

    #[test]
    fn test_tampering_is_detected() {
        let keypair = KeyPair::generate().unwrap();
        let mut block = Block::new(1, [7u8; 32], 1_000, keypair.address(), 10, vec![]);
        block.sign(&keypair).unwrap();

        let mut reward_bumped = block.clone();
        reward_bumped.header.block_reward = 11;
        assert_eq!(reward_bumped.verify_integrity(), Err(ValidationError::BadBlockHash));

        let mut rank_bumped = block.clone();
        rank_bumped.header.proposer_rank = 1;
        assert_eq!(rank_bumped.verify_integrity(), Err(ValidationError::BadBlockHash));
        let ranked = block.clone().with_proposer_rank(1);
        assert_ne!(ranked.hash(), block.hash());
        assert_eq!(ranked.verify_integrity(), Ok(()));

        let mut extra_tx = block.clone();
        extra_tx
            .transactions
            .push(Transaction::lock_deposit(keypair.address(), 1));
        assert_eq!(extra_tx.verify_integrity(), Err(ValidationError::BadMerkleRoot));

        let other = KeyPair::generate().unwrap();
        let mut stolen = block.clone();
        stolen.sign(&other).unwrap();
        assert!(!stolen.verify_proposer_signature());
    }

    #[test]
    fn test_genesis_is_order_independent() {
        let fp = DeviceFingerprint(sha256(b"dev"));
        let spec = GenesisSpec {
            timestamp: 1_700_000_000_000,
            allocations: vec![(sha256(b"a"), 5), (sha256(b"b"), 7)],
            validators: vec![(sha256(b"a"), fp)],
        };
        let mut reordered = spec.clone();
        reordered.allocations.reverse();
        assert_eq!(spec.block().hash(), reordered.block().hash());
        assert_eq!(spec.total_allocation().unwrap(), 12);

        let mut changed = spec.clone();
        changed.allocations[0].1 = 6;
        assert_ne!(spec.block().hash(), changed.block().hash());
    }
}
