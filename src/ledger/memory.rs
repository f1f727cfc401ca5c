//! In-memory ledger backend.
//!
//! Mirrors the PostgreSQL backend's semantics in process memory: planned
//! rows, applied rows in apply order, and at most one tag row per applied
//! change. Every script handed to [`Ledger::run_script`] is recorded in
//! execution order, and a failure can be injected by substring match, so
//! the reconciliation engine is fully testable without a server.

use std::collections::HashMap;

use chrono::Utc;

use crate::core::{AppliedChange, Change, ChangeId, MigrateError, Result, TagEntry};
use crate::ledger::Ledger;

#[derive(Default)]
pub struct MemoryLedger {
    plan: Vec<Change>,
    applied: Vec<AppliedChange>,
    tags: HashMap<ChangeId, (String, String)>,
    executed: Vec<String>,
    fail_on: Option<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts executed so far, in execution order.
    pub fn executed_scripts(&self) -> &[String] {
        &self.executed
    }

    /// Make `run_script` fail whenever the script contains `pattern`.
    pub fn fail_when_contains(&mut self, pattern: &str) {
        self.fail_on = Some(pattern.to_string());
    }

    /// Names of currently applied changes, oldest first.
    pub fn applied_names(&self) -> Vec<String> {
        self.applied.iter().map(|c| c.name.clone()).collect()
    }

    /// Names in the planned mirror, in planned order.
    pub fn planned_names(&self) -> Vec<String> {
        self.plan.iter().map(|c| c.name.clone()).collect()
    }
}

impl Ledger for MemoryLedger {
    fn ensure_schema(&mut self) -> Result<()> {
        Ok(())
    }

    fn record_planned(&mut self, change: &Change) -> Result<()> {
        if !self.plan.iter().any(|c| c.changeid == change.changeid) {
            self.plan.push(change.clone());
        }
        Ok(())
    }

    fn record_applied(&mut self, changeid: ChangeId, name: &str) -> Result<()> {
        if !self.applied.iter().any(|c| c.changeid == changeid) {
            self.applied.push(AppliedChange {
                changeid,
                name: name.to_string(),
                applied: Utc::now().naive_utc(),
            });
        }
        Ok(())
    }

    fn record_reverted(&mut self, changeid: ChangeId) -> Result<()> {
        self.applied.retain(|c| c.changeid != changeid);
        // tags cascade on delete, like the SQL schema
        self.tags.remove(&changeid);
        Ok(())
    }

    fn is_applied(&mut self, changeid: ChangeId) -> Result<bool> {
        Ok(self.applied.iter().any(|c| c.changeid == changeid))
    }

    fn planned_changeid(&mut self, name: &str) -> Result<Option<ChangeId>> {
        Ok(self
            .plan
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.changeid))
    }

    fn applied_changeid(&mut self, name: &str) -> Result<Option<ChangeId>> {
        Ok(self
            .applied
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.changeid))
    }

    fn change_by_tag(&mut self, tag: &str) -> Result<Option<String>> {
        Ok(self
            .plan
            .iter()
            .find(|c| c.tag.as_deref() == Some(tag))
            .map(|c| c.name.clone()))
    }

    fn list_applied(
        &mut self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<AppliedChange>> {
        Ok(self
            .applied
            .iter()
            .rev()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn last_applied(&mut self) -> Result<Option<AppliedChange>> {
        Ok(self.applied.last().cloned())
    }

    fn apply_tag(&mut self, changeid: ChangeId, tag: &str, msg: &str) -> Result<()> {
        if let Some(entry) = self.plan.iter_mut().find(|c| c.changeid == changeid) {
            entry.tag = Some(tag.to_string());
            entry.tagmsg = Some(msg.to_string());
        }
        if self.applied.iter().any(|c| c.changeid == changeid) {
            self.tags
                .insert(changeid, (tag.to_string(), msg.to_string()));
        }
        Ok(())
    }

    fn remove_tag(&mut self, name: &str) -> Result<()> {
        if let Some(entry) = self.plan.iter_mut().find(|c| c.name == name) {
            entry.tag = None;
            entry.tagmsg = None;
            let changeid = entry.changeid;
            self.tags.remove(&changeid);
        }
        Ok(())
    }

    fn list_tags(&mut self) -> Result<Vec<TagEntry>> {
        let mut tags: Vec<TagEntry> = self
            .plan
            .iter()
            .filter_map(|c| {
                c.tag.as_ref().map(|tag| TagEntry {
                    tag: tag.clone(),
                    msg: c.tagmsg.clone().unwrap_or_default(),
                    change: c.name.clone(),
                })
            })
            .collect();
        tags.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(tags)
    }

    fn rename_change(&mut self, changeid: ChangeId, new_name: &str) -> Result<()> {
        if let Some(entry) = self.plan.iter_mut().find(|c| c.changeid == changeid) {
            entry.name = new_name.to_string();
        }
        if let Some(entry) = self.applied.iter_mut().find(|c| c.changeid == changeid) {
            entry.name = new_name.to_string();
        }
        Ok(())
    }

    fn remove_planned(&mut self, changeid: ChangeId) -> Result<()> {
        self.plan.retain(|c| c.changeid != changeid);
        Ok(())
    }

    fn run_script(&mut self, sql: &str) -> Result<()> {
        if let Some(pattern) = &self.fail_on {
            if sql.contains(pattern.as_str()) {
                return Err(MigrateError::SchemaViolation(format!(
                    "script execution failed near '{}'",
                    pattern
                )));
            }
        }
        self.executed.push(sql.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_applied_is_idempotent() {
        let mut ledger = MemoryLedger::new();
        let change = Change::new("alpha", "first");
        ledger.record_planned(&change).unwrap();
        ledger.record_applied(change.changeid, &change.name).unwrap();
        ledger.record_applied(change.changeid, &change.name).unwrap();

        assert_eq!(ledger.list_applied(0, None).unwrap().len(), 1);
        assert!(ledger.is_applied(change.changeid).unwrap());
    }

    #[test]
    fn test_list_applied_is_newest_first() {
        let mut ledger = MemoryLedger::new();
        for name in ["alpha", "beta", "gamma"] {
            let change = Change::new(name, "msg");
            ledger.record_planned(&change).unwrap();
            ledger.record_applied(change.changeid, name).unwrap();
        }

        let names: Vec<_> = ledger
            .list_applied(0, None)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["gamma", "beta", "alpha"]);

        let offset_one: Vec<_> = ledger
            .list_applied(1, Some(1))
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(offset_one, vec!["beta"]);
    }

    #[test]
    fn test_revert_cascades_tag_row() {
        let mut ledger = MemoryLedger::new();
        let change = Change::new("alpha", "first");
        ledger.record_planned(&change).unwrap();
        ledger.record_applied(change.changeid, &change.name).unwrap();
        ledger.apply_tag(change.changeid, "v1.0", "rel").unwrap();

        ledger.record_reverted(change.changeid).unwrap();
        assert!(!ledger.is_applied(change.changeid).unwrap());
        assert!(ledger.tags.is_empty());
        // The plan-mirror tag columns survive a revert, as in SQL.
        assert_eq!(
            ledger.change_by_tag("v1.0").unwrap().as_deref(),
            Some("alpha")
        );
    }

    #[test]
    fn test_rename_cascades_to_applied_rows() {
        let mut ledger = MemoryLedger::new();
        let change = Change::new("alpha", "first");
        ledger.record_planned(&change).unwrap();
        ledger.record_applied(change.changeid, &change.name).unwrap();

        ledger.rename_change(change.changeid, "alpha_v2").unwrap();
        assert_eq!(
            ledger.planned_changeid("alpha_v2").unwrap(),
            Some(change.changeid)
        );
        assert_eq!(
            ledger.applied_changeid("alpha_v2").unwrap(),
            Some(change.changeid)
        );
        assert_eq!(ledger.planned_changeid("alpha").unwrap(), None);
    }

    #[test]
    fn test_injected_script_failure() {
        let mut ledger = MemoryLedger::new();
        ledger.fail_when_contains("beta");

        assert!(ledger.run_script("-- alpha").is_ok());
        assert!(ledger.run_script("-- beta").is_err());
        assert_eq!(ledger.executed_scripts().len(), 1);
    }
}
