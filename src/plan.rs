//! Plan Store: the ordered, client-local list of all known changes.
//!
//! The plan is a line-delimited JSON file, one record per change, insertion
//! order = intended deploy order. Appends go straight to the end of the
//! file; every other mutation is read-all, mutate in memory, then an atomic
//! full-file rewrite so a concurrent reader never sees a half-written plan.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::core::{Change, ChangeId, MigrateError, Result};

pub struct PlanFile {
    path: PathBuf,
}

impl PlanFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create an empty plan file. Used by `init`; leaves an existing plan alone.
    pub fn create_empty(&self) -> Result<()> {
        if !self.exists() {
            File::create(&self.path)?;
        }
        Ok(())
    }

    /// Read the full plan in insertion order.
    ///
    /// A malformed line is reported with the plan path and 1-based line
    /// number rather than silently skipped.
    pub fn list_entries(&self) -> Result<Vec<Change>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (ind, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let change =
                serde_json::from_str(&line).map_err(|source| MigrateError::PlanParse {
                    path: self.path.clone(),
                    line: ind + 1,
                    source,
                })?;
            entries.push(change);
        }
        Ok(entries)
    }

    /// Append a change to the end of the plan.
    pub fn append_entry(&self, change: &Change) -> Result<()> {
        let entries = self.list_entries()?;
        if entries.iter().any(|e| e.name == change.name) {
            return Err(MigrateError::DuplicateName(change.name.clone()));
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let line = serde_json::to_string(change).expect("plan entry serializes");
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read the full plan plus the position of the matching entry.
    ///
    /// A `None` name resolves to the last entry (tag and rename default to
    /// the most recently planned change). An unknown name yields a `None`
    /// index so the caller decides whether that is an error.
    pub fn find_entry(&self, name: Option<&str>) -> Result<(Vec<Change>, Option<usize>)> {
        let entries = self.list_entries()?;
        let ind = match name {
            Some(name) => entries.iter().position(|e| e.name == name),
            None => entries.len().checked_sub(1),
        };
        Ok((entries, ind))
    }

    /// Atomically replace the entire plan.
    ///
    /// Writes to a temp file in the same directory, fsyncs, then renames
    /// over the plan, so readers see either the old or the new full content.
    pub fn rewrite_entries(&self, entries: &[Change]) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        for change in entries {
            let line = serde_json::to_string(change).expect("plan entry serializes");
            writeln!(tmp, "{}", line)?;
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| MigrateError::Io(e.error))?;
        Ok(())
    }

    /// Remove the named entry and rewrite the plan.
    pub fn remove_entry(&self, name: &str) -> Result<()> {
        let (mut entries, ind) = self.find_entry(Some(name))?;
        let ind = ind.ok_or_else(|| MigrateError::TargetNotFound(name.to_string()))?;
        entries.remove(ind);
        self.rewrite_entries(&entries)
    }

    /// Rename an entry, keyed by its immutable changeid.
    pub fn rename_entry(&self, changeid: ChangeId, new_name: &str) -> Result<()> {
        let mut entries = self.list_entries()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.changeid == changeid)
            .ok_or_else(|| MigrateError::TargetNotFound(changeid.to_string()))?;
        entry.name = new_name.to_string();
        self.rewrite_entries(&entries)
    }

    /// Set the tag fields of the named entry (or the last entry when `None`)
    /// and return the updated change.
    pub fn set_tag(&self, name: Option<&str>, tag: &str, msg: &str) -> Result<Change> {
        let (mut entries, ind) = self.find_entry(name)?;
        let ind = ind.ok_or_else(|| {
            MigrateError::TargetNotFound(name.unwrap_or("<last>").to_string())
        })?;
        entries[ind].tag = Some(tag.to_string());
        entries[ind].tagmsg = Some(msg.to_string());
        let change = entries[ind].clone();
        self.rewrite_entries(&entries)?;
        Ok(change)
    }

    /// Clear the tag fields of the named entry and return the updated change.
    pub fn clear_tag(&self, name: &str) -> Result<Change> {
        let (mut entries, ind) = self.find_entry(Some(name))?;
        let ind = ind.ok_or_else(|| MigrateError::TargetNotFound(name.to_string()))?;
        entries[ind].tag = None;
        entries[ind].tagmsg = None;
        let change = entries[ind].clone();
        self.rewrite_entries(&entries)?;
        Ok(change)
    }
}
