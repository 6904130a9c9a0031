//! Error types for the TIMPAL node
//!
//! Three families matter to callers:
//! - [`ValidationError`]: a block or transaction is rejected locally. Never fatal.
//! - [`NetworkError`]: a peer misbehaved or went away. The peer is dropped or retried.
//! - [`FatalError`]: persisted state failed re-verification. The node must not start.

use crate::blockchain::Sha256Hash;
use thiserror::Error;

/// Why a block or transaction was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },
    #[error("height conflict: expected {expected}, got {got}")]
    HeightConflict { expected: u64, got: u64 },
    #[error("merkle root does not match transactions")]
    BadMerkleRoot,
    #[error("device fingerprint already registered")]
    DuplicateDeviceFingerprint,
    #[error("emission exceeded: block claims {claimed}, only {remaining} left under the cap")]
    EmissionExceeded { claimed: u64, remaining: u64 },
    #[error("previous hash does not match the canonical tip")]
    PreviousHashMismatch,
    #[error("proposer {got} is not the selected proposer {expected}")]
    WrongProposer { expected: String, got: String },
    #[error("rank {rank} fallback window opens at {opens_at}")]
    ProposerWindowNotOpen { rank: u32, opens_at: u64 },
    #[error("no eligible proposer for height {0}")]
    NoEligibleProposer(u64),
    #[error("block hash does not match header")]
    BadBlockHash,
    #[error("invalid fee: expected {expected}, got {got}")]
    InvalidFee { expected: u64, got: u64 },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("block reward mismatch: expected {expected}, got {got}")]
    RewardMismatch { expected: u64, got: u64 },
    #[error("too many transactions: {count} (max {max})")]
    TooManyTransactions { count: usize, max: usize },
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),
    #[error("address is already a registered validator")]
    AlreadyRegistered,
    #[error("address is not a registered validator")]
    NotAValidator,
    #[error("deposit already locked")]
    DepositAlreadyLocked,
    #[error("no active deposit")]
    NoActiveDeposit,
    #[error("withdrawal was not requested")]
    WithdrawalNotRequested,
    #[error("withdrawal delay pending until height {ready_at}")]
    WithdrawalDelayPending { ready_at: u64 },
    #[error("arithmetic overflow")]
    Overflow,
}

impl ValidationError {
    /// Short, stable name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::InvalidSignature => "InvalidSignature",
            ValidationError::NonceMismatch { .. } => "NonceMismatch",
            ValidationError::InsufficientBalance { .. } => "InsufficientBalance",
            ValidationError::HeightConflict { .. } => "HeightConflict",
            ValidationError::BadMerkleRoot => "BadMerkleRoot",
            ValidationError::DuplicateDeviceFingerprint => "DuplicateDeviceFingerprint",
            ValidationError::EmissionExceeded { .. } => "EmissionExceeded",
            ValidationError::PreviousHashMismatch => "PreviousHashMismatch",
            ValidationError::WrongProposer { .. } => "WrongProposer",
            ValidationError::ProposerWindowNotOpen { .. } => "ProposerWindowNotOpen",
            ValidationError::NoEligibleProposer(_) => "NoEligibleProposer",
            ValidationError::BadBlockHash => "BadBlockHash",
            ValidationError::InvalidFee { .. } => "InvalidFee",
            ValidationError::InvalidAmount(_) => "InvalidAmount",
            ValidationError::RewardMismatch { .. } => "RewardMismatch",
            ValidationError::TooManyTransactions { .. } => "TooManyTransactions",
            ValidationError::TimestampOutOfRange(_) => "TimestampOutOfRange",
            ValidationError::AlreadyRegistered => "AlreadyRegistered",
            ValidationError::NotAValidator => "NotAValidator",
            ValidationError::DepositAlreadyLocked => "DepositAlreadyLocked",
            ValidationError::NoActiveDeposit => "NoActiveDeposit",
            ValidationError::WithdrawalNotRequested => "WithdrawalNotRequested",
            ValidationError::WithdrawalDelayPending { .. } => "WithdrawalDelayPending",
            ValidationError::Overflow => "Overflow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("peer timed out")]
    Timeout,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("envelope authentication failed: {0}")]
    BadEnvelope(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Persisted state that cannot be trusted. Startup must halt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("stored block at height {height} is corrupt: {reason}")]
    CorruptBlock { height: u64, reason: String },
    #[error("stored chain is broken at height {height}")]
    BrokenChain { height: u64 },
    #[error("missing block at height {height} (hash {hash})")]
    MissingBlock { height: u64, hash: String },
    #[error("persisted state does not match replayed chain: {0}")]
    StateMismatch(String),
    #[error("stored genesis block does not match configured genesis")]
    GenesisMismatch,
}

impl FatalError {
    pub fn missing(height: u64, hash: &Sha256Hash) -> Self {
        FatalError::MissingBlock {
            height,
            hash: hex::encode(hash),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Fatal error: {0}")]
    Fatal(#[from] FatalError),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Mempool is full")]
    MempoolFull,
    #[error("Fork rejected: {0}")]
    ForkRejected(String),
}

impl ChainError {
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            ChainError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
