//! TIMPAL - a permissionless blockchain node with VRF-selected proposers, a hard
//! emission cap and equal validator rewards
//!
//! # Architecture
//!
//! ## Ledger
//! - [`blockchain`] - Blocks, committed state, block validation and the ledger itself
//! - [`transaction`] - Transaction types and stateless checks
//! - [`mempool`] - Pending transactions admitted against the committed snapshot
//!
//! ## Consensus
//! - [`consensus`] - Epoch seeds and proposer selection
//! - [`economics`] - Emission schedule, fees and reward distribution
//! - [`fork_choice`] - Checkpoints, reorg depth and coin-weighted fork resolution
//!
//! ## Cryptography
//! - [`crypto`] - secp256k1 keys, signatures and addresses
//!
//! ## Storage
//! - [`persistence`] - Atomic file-per-block store
//!
//! ## Networking
//! - [`network`] - Signed WebSocket envelopes between peers
//! - [`sync`] - Catch-up, gossip handling and fork fetching
//! - [`node`] - Wires the components together and runs the proposer loop
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;
pub mod economics;
pub mod fork_choice;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Storage
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
