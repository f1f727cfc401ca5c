//! Ledger Store: the server-side durable record of which changes are
//! planned and applied, plus tags.
//!
//! The ledger lives in a dedicated metadata schema next to the schema it
//! describes, so other clients and environments can query deployment state
//! without access to the plan file. `sync` mirrors the plan into it.

pub mod memory;
pub mod pg;

pub use memory::MemoryLedger;
pub use pg::{PgAdmin, PgLedger};

use crate::core::{AppliedChange, Change, ChangeId, Result, TagEntry};

/// Metadata operations against a target database.
///
/// Every method is a single round-trip; there are no cross-call
/// transactions. `run_script` is the one exception: it executes a whole
/// change script inside its own transaction, committing on success and
/// rolling back on failure.
pub trait Ledger {
    /// Create the metadata schema and its three tables if absent.
    /// Safe to re-run.
    fn ensure_schema(&mut self) -> Result<()>;

    /// Upsert a plan entry into the planned mirror. No-op when the
    /// changeid is already present, so `sync` can always be re-run.
    fn record_planned(&mut self, change: &Change) -> Result<()>;

    /// Record a change as applied, stamped now. Idempotent.
    fn record_applied(&mut self, changeid: ChangeId, name: &str) -> Result<()>;

    /// Delete the applied record of a change. Quietly does nothing when
    /// the change was never applied.
    fn record_reverted(&mut self, changeid: ChangeId) -> Result<()>;

    /// Is this change currently deployed?
    fn is_applied(&mut self, changeid: ChangeId) -> Result<bool>;

    /// Look up a changeid by name in the planned mirror.
    fn planned_changeid(&mut self, name: &str) -> Result<Option<ChangeId>>;

    /// Look up a changeid by name among applied changes.
    fn applied_changeid(&mut self, name: &str) -> Result<Option<ChangeId>>;

    /// Resolve a tag to the name of the change it marks.
    fn change_by_tag(&mut self, tag: &str) -> Result<Option<String>>;

    /// Applied changes, most recently applied first.
    fn list_applied(
        &mut self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<AppliedChange>>;

    /// The most recently applied change, if any.
    fn last_applied(&mut self) -> Result<Option<AppliedChange>>;

    /// Attach a tag to a change: at most one tag row per changeid, and the
    /// planned-mirror tag columns are kept in step.
    fn apply_tag(&mut self, changeid: ChangeId, tag: &str, msg: &str) -> Result<()>;

    /// Clear the tag of the named change.
    fn remove_tag(&mut self, name: &str) -> Result<()>;

    /// All tags with their messages and marked changes, ordered by tag.
    fn list_tags(&mut self) -> Result<Vec<TagEntry>>;

    /// Rename a change, keyed by changeid. Name-keyed rows cascade.
    fn rename_change(&mut self, changeid: ChangeId, new_name: &str) -> Result<()>;

    /// Remove a change from the planned mirror.
    fn remove_planned(&mut self, changeid: ChangeId) -> Result<()>;

    /// Execute one change script in its own transaction.
    fn run_script(&mut self, sql: &str) -> Result<()>;
}
