//! Durable storage for blocks and committed ledger state
//!
//! Layout under the data directory:
//! - `blocks/<height>-<hash>.bin`: one bincode-encoded block per file, never rewritten
//! - `state.bin`: chain state, accounts and validator registry as of the tip
//!
//! Every file is written to a temporary path, synced and renamed into place. A block
//! file is always written before the `state.bin` that references it, so a crash leaves
//! either the old tip or the new one. Loading walks back from the tip hash in
//! `state.bin`; block files that are not on that chain are garbage.

use crate::blockchain::{Block, LedgerState, Sha256Hash};
use crate::error::{ChainError, FatalError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BLOCKS_DIR: &str = "blocks";
const STATE_FILE: &str = "state.bin";

/// Abstraction for persistence backends. Implementations must make each write atomic.
pub trait Persistence: Send + Sync {
    fn save_block(&self, block: &Block) -> Result<(), ChainError>;
    fn save_state(&self, state: &LedgerState) -> Result<(), ChainError>;
    fn load_state(&self) -> Result<Option<LedgerState>, ChainError>;
    /// `Ok(None)` when no such block was stored; a corrupt file is a [`FatalError`].
    fn load_block(&self, height: u64, hash: &Sha256Hash) -> Result<Option<Block>, ChainError>;
    /// Delete every stored block whose hash is not in `keep`. Returns how many went.
    fn retain_blocks(&self, keep: &BTreeSet<Sha256Hash>) -> Result<usize, ChainError>;
}

/// File-per-block store on the local filesystem.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ChainError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOCKS_DIR)).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create data directory {}: {}", root.display(), e))
        })?;
        Ok(FileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_path(&self, height: u64, hash: &Sha256Hash) -> PathBuf {
        self.root
            .join(BLOCKS_DIR)
            .join(format!("{:012}-{}.bin", height, hex::encode(hash)))
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// tmp file, fsync, rename, then fsync the directory so the rename is durable.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ChainError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to create temp file: {}", e)))?;
        file.write_all(bytes)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to write {}: {}", temp_path.display(), e)))?;
        file.sync_all()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to sync file: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to finalize write: {}", e)))?;

        if let Some(dir) = path.parent() {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| ChainError::DatabaseError(format!("Failed to sync directory: {}", e)))?;
        }
        Ok(())
    }

    /// `(height, hash)` parsed from a block file name.
    fn parse_block_name(name: &str) -> Option<(u64, Sha256Hash)> {
        let stem = name.strip_suffix(".bin")?;
        let (height, hash) = stem.split_once('-')?;
        let height = height.parse().ok()?;
        let hash: Sha256Hash = hex::decode(hash).ok()?.try_into().ok()?;
        Some((height, hash))
    }
}

impl Persistence for FileStore {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let path = self.block_path(block.height(), &block.hash());
        if path.exists() {
            return Ok(());
        }
        let bytes = bincode::serialize(block)?;
        Self::write_atomic(&path, &bytes)
    }

    fn save_state(&self, state: &LedgerState) -> Result<(), ChainError> {
        let bytes = bincode::serialize(state)?;
        Self::write_atomic(&self.state_path(), &bytes)
    }

    fn load_state(&self) -> Result<Option<LedgerState>, ChainError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let state = bincode::deserialize(&bytes)
            .map_err(|e| FatalError::StateMismatch(format!("state.bin is unreadable: {}", e)))?;
        Ok(Some(state))
    }

    fn load_block(&self, height: u64, hash: &Sha256Hash) -> Result<Option<Block>, ChainError> {
        let path = self.block_path(height, hash);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let block: Block = bincode::deserialize(&bytes).map_err(|e| FatalError::CorruptBlock {
            height,
            reason: e.to_string(),
        })?;
        Ok(Some(block))
    }

    fn retain_blocks(&self, keep: &BTreeSet<Sha256Hash>) -> Result<usize, ChainError> {
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join(BLOCKS_DIR))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stale = match Self::parse_block_name(&name) {
                Some((_, hash)) => !keep.contains(&hash),
                None => name.ends_with(".tmp"),
            };
            if stale {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        let state_tmp = self.state_path().with_extension("tmp");
        if state_tmp.exists() {
            fs::remove_file(state_tmp)?;
        }
        Ok(removed)
    }
}

/// In-memory backend for tests. Clones share storage, so a test can keep a handle and
/// reopen a ledger on the same data.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub blocks: Arc<Mutex<BTreeMap<Sha256Hash, Block>>>,
    pub state: Arc<Mutex<Option<LedgerState>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        self.blocks.lock().insert(block.hash(), block.clone());
        Ok(())
    }

    fn save_state(&self, state: &LedgerState) -> Result<(), ChainError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<LedgerState>, ChainError> {
        Ok(self.state.lock().clone())
    }

    fn load_block(&self, height: u64, hash: &Sha256Hash) -> Result<Option<Block>, ChainError> {
        Ok(self
            .blocks
            .lock()
            .get(hash)
            .filter(|b| b.height() == height)
            .cloned())
    }

    fn retain_blocks(&self, keep: &BTreeSet<Sha256Hash>) -> Result<usize, ChainError> {
        let mut blocks = self.blocks.lock();
        let before = blocks.len();
        blocks.retain(|hash, _| keep.contains(hash));
        Ok(before - blocks.len())
    }
}
