// Thin re-export module: implementation is in `blockchain/core.rs` so the ledger,
// validator and state types can be used through one path.

pub mod core;
pub use self::core::*;
