//! Reconciliation Engine: reconciles the plan file, the server-side ledger
//! and the change-script directory into one consistent deployment order,
//! and walks it forward (deploy) or backward (revert).
//!
//! Deploy scans the plan in insertion order and skips changes the ledger
//! already records as applied. Revert walks the ledger's applied list
//! newest-first, because apply order and plan order diverge once
//! `deploy --to` has been used non-monotonically. Both scans are
//! fail-fast: the first script failure stops the walk, and everything
//! recorded before it stays recorded.

use tracing::{debug, error};

use crate::config::valid_identifier;
use crate::core::{AppliedChange, Change, Direction, MigrateError, Result, TagEntry};
use crate::ledger::Ledger;
use crate::plan::PlanFile;
use crate::registry::ScriptRegistry;

/// Per-change progress reporting during a scan.
///
/// The CLI prints `+ name ..... ok` lines through this; tests collect the
/// calls instead.
pub trait Reporter {
    fn begin_change(&mut self, _direction: Direction, _name: &str) {}
    fn finish_change(&mut self, _ok: bool) {}
    fn info(&mut self, _msg: &str) {}
}

/// Reporter that swallows everything.
pub struct NullReporter;

impl Reporter for NullReporter {}

#[derive(Debug)]
pub enum AddOutcome {
    Added(Change),
    AlreadyExists,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    NotFound,
}

#[derive(Debug)]
pub enum TagAddOutcome {
    Applied { change: String },
    TagInUse { change: String },
    Declined,
}

#[derive(Debug)]
pub enum TagRemoveOutcome {
    Removed { change: String },
    NotFound,
    Declined,
}

/// What a deploy scan did. `failed` carries the change that stopped the
/// scan together with the underlying error.
#[derive(Debug, Default)]
pub struct DeployReport {
    pub applied: Vec<String>,
    pub skipped: usize,
    pub failed: Option<(String, MigrateError)>,
}

#[derive(Debug, Default)]
pub struct RevertReport {
    pub reverted: Vec<String>,
    pub failed: Option<(String, MigrateError)>,
}

#[derive(Debug)]
pub struct StatusReport {
    pub last_applied: Option<AppliedChange>,
    pub pending: Vec<Change>,
    pub plan_len: usize,
}

pub struct Engine<L: Ledger> {
    project: String,
    plan: PlanFile,
    registry: ScriptRegistry,
    ledger: L,
}

impl<L: Ledger> Engine<L> {
    pub fn new(project: &str, plan: PlanFile, registry: ScriptRegistry, ledger: L) -> Self {
        Self {
            project: project.to_string(),
            plan,
            registry,
            ledger,
        }
    }

    pub fn plan(&self) -> &PlanFile {
        &self.plan
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    // ---- deploy -----------------------------------------------------------

    /// Apply pending changes in plan order, up to `to` inclusive.
    pub fn deploy(&mut self, to: Option<&str>, reporter: &mut dyn Reporter) -> Result<DeployReport> {
        let entries = self.plan.list_entries()?;
        let target = self.resolve_deploy_target(to, &entries, reporter)?;

        let mut report = DeployReport::default();
        for entry in &entries {
            let is_target = target.as_deref() == Some(entry.name.as_str());

            if self.ledger.is_applied(entry.changeid)? {
                debug!(change = %entry.name, "already applied, skipping");
                report.skipped += 1;
                if is_target {
                    break;
                }
                continue;
            }

            reporter.begin_change(Direction::Deploy, &entry.name);
            match self.run_change(Direction::Deploy, &entry.name) {
                Ok(()) => {
                    self.ledger.record_applied(entry.changeid, &entry.name)?;
                    if let Some(tag) = &entry.tag {
                        self.ledger.apply_tag(
                            entry.changeid,
                            tag,
                            entry.tagmsg.as_deref().unwrap_or(""),
                        )?;
                    }
                    reporter.finish_change(true);
                    report.applied.push(entry.name.clone());
                }
                Err(err) => {
                    reporter.finish_change(false);
                    error!(change = %entry.name, error = %err, "deploy failed, stopping scan");
                    report.failed = Some((entry.name.clone(), err));
                    break;
                }
            }

            if is_target {
                break;
            }
        }
        Ok(report)
    }

    /// Resolve a deploy target: a tag, then a plan entry name.
    fn resolve_deploy_target(
        &mut self,
        to: Option<&str>,
        entries: &[Change],
        reporter: &mut dyn Reporter,
    ) -> Result<Option<String>> {
        let Some(to) = to else {
            reporter.info(&format!(
                "Deploying all pending changes to '{}'",
                self.project
            ));
            return Ok(None);
        };

        if let Some(name) = self.ledger.change_by_tag(to)? {
            reporter.info(&format!(
                "Deploying pending changes to '{}'. Last tag to deploy: '{}'",
                self.project, to
            ));
            return Ok(Some(name));
        }

        if entries.iter().any(|e| e.name == to) {
            reporter.info(&format!(
                "Deploying pending changes to '{}'. Last change to deploy: '{}'",
                self.project, to
            ));
            return Ok(Some(to.to_string()));
        }

        Err(MigrateError::TargetNotFound(to.to_string()))
    }

    // ---- revert -----------------------------------------------------------

    /// Undo applied changes in reverse apply order, down to `upto` inclusive.
    pub fn revert(
        &mut self,
        upto: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> Result<RevertReport> {
        let entries = self.plan.list_entries()?;
        let target = self.resolve_revert_target(upto, &entries, reporter)?;

        let applied = self.ledger.list_applied(0, None)?;
        let mut report = RevertReport::default();
        for change in &applied {
            reporter.begin_change(Direction::Revert, &change.name);
            match self.run_change(Direction::Revert, &change.name) {
                Ok(()) => {
                    self.ledger.record_reverted(change.changeid)?;
                    reporter.finish_change(true);
                    report.reverted.push(change.name.clone());
                }
                Err(err) => {
                    reporter.finish_change(false);
                    error!(change = %change.name, error = %err, "revert failed, stopping scan");
                    report.failed = Some((change.name.clone(), err));
                    break;
                }
            }

            if target.as_deref() == Some(change.name.as_str()) {
                break;
            }
        }
        Ok(report)
    }

    /// Resolve a revert target: a tag, `HEAD`, `HEAD~N`, then a plan entry
    /// name. `HEAD~N` past the oldest applied change means "revert all".
    fn resolve_revert_target(
        &mut self,
        upto: Option<&str>,
        entries: &[Change],
        reporter: &mut dyn Reporter,
    ) -> Result<Option<String>> {
        let all_msg = format!("Reverting all deployed changes from '{}'", self.project);

        let Some(upto) = upto else {
            reporter.info(&all_msg);
            return Ok(None);
        };

        if let Some(name) = self.ledger.change_by_tag(upto)? {
            reporter.info(&format!(
                "Reverting deployed changes from '{}'. Last tag to revert: '{}'",
                self.project, upto
            ));
            return Ok(Some(name));
        }

        let offset = if upto == "HEAD" {
            Some(0)
        } else {
            upto.strip_prefix("HEAD~").and_then(|n| n.parse::<usize>().ok())
        };
        if let Some(offset) = offset {
            return match self.ledger.list_applied(offset, Some(1))?.into_iter().next() {
                Some(change) => {
                    reporter.info(&format!(
                        "Reverting deployed changes from '{}'. Last change to revert: '{}'",
                        self.project, change.name
                    ));
                    Ok(Some(change.name))
                }
                None => {
                    reporter.info(&all_msg);
                    Ok(None)
                }
            };
        }

        if entries.iter().any(|e| e.name == upto) {
            reporter.info(&format!(
                "Reverting deployed changes from '{}'. Last change to revert: '{}'",
                self.project, upto
            ));
            return Ok(Some(upto.to_string()));
        }

        Err(MigrateError::TargetNotFound(upto.to_string()))
    }

    /// Load and execute one change script, in its own transaction.
    fn run_change(&mut self, direction: Direction, name: &str) -> Result<()> {
        let sql = self.registry.load(direction, name)?;
        self.ledger
            .run_script(&sql)
            .map_err(|err| MigrateError::ScriptExecution {
                change: name.to_string(),
                direction,
                detail: err.to_string(),
            })
    }

    // ---- plan maintenance ---------------------------------------------------

    /// Add a change: fresh changeid, plan append, ledger upsert, script
    /// skeletons. Re-adding an existing name is a no-op.
    pub fn add(&mut self, name: &str, msg: &str) -> Result<AddOutcome> {
        if !valid_identifier(name) {
            return Err(MigrateError::Config(format!(
                "change name '{}' is not a valid identifier",
                name
            )));
        }

        if self.ledger.planned_changeid(name)?.is_some() {
            return Ok(AddOutcome::AlreadyExists);
        }

        let change = Change::new(name, msg);
        self.plan.append_entry(&change)?;
        self.ledger.record_planned(&change)?;

        for direction in [Direction::Deploy, Direction::Revert] {
            self.registry
                .create_skeleton(direction, &self.project, name, msg)?;
        }
        Ok(AddOutcome::Added(change))
    }

    /// Remove an undeployed change from plan, ledger and disk.
    pub fn remove(&mut self, name: &str) -> Result<RemoveOutcome> {
        let Some(changeid) = self.ledger.planned_changeid(name)? else {
            return Ok(RemoveOutcome::NotFound);
        };

        if self.ledger.is_applied(changeid)? {
            return Err(MigrateError::DeployedChangeRemoval(name.to_string()));
        }

        self.plan.remove_entry(name)?;
        self.ledger.remove_planned(changeid)?;
        for direction in [Direction::Deploy, Direction::Revert] {
            self.registry.remove_script(direction, name)?;
        }
        Ok(RemoveOutcome::Removed)
    }

    /// Rename a change everywhere: plan (by changeid), ledger (cascading)
    /// and both script files.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<RenameOutcome> {
        if !valid_identifier(new_name) {
            return Err(MigrateError::Config(format!(
                "change name '{}' is not a valid identifier",
                new_name
            )));
        }

        let Some(changeid) = self.ledger.planned_changeid(old_name)? else {
            return Ok(RenameOutcome::NotFound);
        };

        let entries = self.plan.list_entries()?;
        if entries.iter().any(|e| e.name == new_name) {
            return Err(MigrateError::DuplicateName(new_name.to_string()));
        }

        self.plan.rename_entry(changeid, new_name)?;
        self.ledger.rename_change(changeid, new_name)?;
        for direction in [Direction::Deploy, Direction::Revert] {
            self.registry.rename_script(direction, old_name, new_name)?;
        }
        Ok(RenameOutcome::Renamed)
    }

    // ---- tags ---------------------------------------------------------------

    /// Attach a tag to a change (the last planned one by default).
    ///
    /// A tag already bound to another change is rejected outright; a tag
    /// already on the selected change is replaced only when `confirm`
    /// agrees.
    pub fn tag_add(
        &mut self,
        tag: &str,
        msg: &str,
        change: Option<&str>,
        confirm: &mut dyn FnMut(&str) -> bool,
    ) -> Result<TagAddOutcome> {
        let (entries, ind) = self.plan.find_entry(change)?;
        let Some(ind) = ind else {
            return Err(MigrateError::TargetNotFound(
                change.unwrap_or("<empty plan>").to_string(),
            ));
        };
        let entry = &entries[ind];

        if let Some(other) = entries
            .iter()
            .find(|e| e.tag.as_deref() == Some(tag) && e.changeid != entry.changeid)
        {
            return Ok(TagAddOutcome::TagInUse {
                change: other.name.clone(),
            });
        }

        if let Some(existing) = &entry.tag {
            let prompt = format!(
                "Tag '{}' already applied to change '{}'. Replace it with tag '{}'?",
                existing, entry.name, tag
            );
            if !confirm(&prompt) {
                return Ok(TagAddOutcome::Declined);
            }
        }

        let tagged = self.plan.set_tag(Some(&entry.name), tag, msg)?;
        self.ledger.apply_tag(tagged.changeid, tag, msg)?;
        Ok(TagAddOutcome::Applied {
            change: tagged.name,
        })
    }

    /// Remove a tag, clearing it from the plan entry and the ledger.
    pub fn tag_remove(
        &mut self,
        tag: &str,
        confirm: &mut dyn FnMut(&str) -> bool,
    ) -> Result<TagRemoveOutcome> {
        let Some(change) = self.ledger.change_by_tag(tag)? else {
            return Ok(TagRemoveOutcome::NotFound);
        };

        let prompt = format!("Remove tag '{}' applied to change '{}'?", tag, change);
        if !confirm(&prompt) {
            return Ok(TagRemoveOutcome::Declined);
        }

        self.plan.clear_tag(&change)?;
        self.ledger.remove_tag(&change)?;
        Ok(TagRemoveOutcome::Removed { change })
    }

    pub fn tag_list(&mut self) -> Result<Vec<TagEntry>> {
        self.ledger.list_tags()
    }

    // ---- status / sync --------------------------------------------------------

    /// Last applied change plus the plan entries still pending.
    pub fn status(&mut self) -> Result<StatusReport> {
        let last_applied = self.ledger.last_applied()?;
        let entries = self.plan.list_entries()?;
        let plan_len = entries.len();

        let mut pending = Vec::new();
        for entry in entries {
            if !self.ledger.is_applied(entry.changeid)? {
                pending.push(entry);
            }
        }

        Ok(StatusReport {
            last_applied,
            pending,
            plan_len,
        })
    }

    /// Mirror the plan file into the ledger's planned table. Safe to re-run.
    pub fn sync(&mut self, reporter: &mut dyn Reporter) -> Result<usize> {
        self.ledger.ensure_schema()?;
        let entries = self.plan.list_entries()?;
        for entry in &entries {
            reporter.begin_change(Direction::Deploy, &entry.name);
            self.ledger.record_planned(entry)?;
            reporter.finish_change(true);
        }
        Ok(entries.len())
    }
}
