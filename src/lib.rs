// ============================================================================
// pgplan Library
// ============================================================================

pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod ledger;
pub mod plan;
pub mod registry;

// Re-export main types for convenience
pub use config::Config;
pub use core::{Change, ChangeId, Direction, MigrateError, Result};
pub use engine::{Engine, NullReporter, Reporter};
pub use ledger::{Ledger, MemoryLedger, PgAdmin, PgLedger};
pub use plan::PlanFile;
pub use registry::ScriptRegistry;
