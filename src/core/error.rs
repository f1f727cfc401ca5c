use std::path::PathBuf;
use thiserror::Error;

use crate::core::change::Direction;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed plan entry in {path} at line {line}: {source}")]
    PlanParse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("change '{0}' already present in plan")]
    DuplicateName(String),

    #[error("change or tag '{0}' not found")]
    TargetNotFound(String),

    #[error("change '{0}' already exists")]
    AlreadyExists(String),

    #[error("cannot remove deployed change '{0}'; revert it first")]
    DeployedChangeRemoval(String),

    #[error("{direction} script for change '{change}' failed: {detail}")]
    ScriptExecution {
        change: String,
        direction: Direction,
        detail: String,
    },

    #[error("{direction} script for change '{change}' not found")]
    ScriptMissing { change: String, direction: Direction },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MigrateError>;
