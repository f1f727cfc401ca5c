pub mod change;
pub mod error;

pub use change::{AppliedChange, Change, ChangeId, Direction, TagEntry};
pub use error::{MigrateError, Result};
