// core.rs splits responsibilities into submodules: block structure, committed state,
// per-block validation, and the ledger that owns the canonical chain.
pub mod chain;
pub mod ledger;
pub mod state;
pub mod validation;

pub use chain::*;
pub use ledger::*;
pub use state::*;
pub use validation::*;
