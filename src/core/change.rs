use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique, immutable identifier of a planned change.
///
/// Assigned once when the change is added to the plan and never reassigned,
/// so renaming a change leaves every ledger row keyed by it intact.
pub type ChangeId = Uuid;

/// One planned unit of schema evolution, as recorded in the plan file.
///
/// Serialized as a single JSON object per plan line; `tag`/`tagmsg` are
/// omitted while the change carries no tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub changeid: ChangeId,
    pub name: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagmsg: Option<String>,
}

impl Change {
    pub fn new(name: &str, msg: &str) -> Self {
        Self {
            changeid: Uuid::new_v4(),
            name: name.to_string(),
            msg: msg.to_string(),
            tag: None,
            tagmsg: None,
        }
    }
}

/// A change as recorded in the ledger's applied table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub changeid: ChangeId,
    pub name: String,
    pub applied: NaiveDateTime,
}

/// One row of `tag list`: the tag, its message and the change it marks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub tag: String,
    pub msg: String,
    pub change: String,
}

/// Which action of a change script is being resolved or executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Deploy,
    Revert,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deploy => "deploy",
            Direction::Revert => "revert",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_ids_are_unique() {
        let a = Change::new("alpha", "first");
        let b = Change::new("alpha", "first");
        assert_ne!(a.changeid, b.changeid);
    }

    #[test]
    fn test_untagged_change_serializes_without_tag_fields() {
        let change = Change::new("alpha", "first");
        let line = serde_json::to_string(&change).unwrap();
        assert!(!line.contains("tag"));
    }

    #[test]
    fn test_tagged_change_round_trips() {
        let mut change = Change::new("alpha", "first");
        change.tag = Some("v1.0".to_string());
        change.tagmsg = Some("first release".to_string());

        let line = serde_json::to_string(&change).unwrap();
        let parsed: Change = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, change);
    }
}
