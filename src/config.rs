use std::env;
use std::path::{Path, PathBuf};

use crate::core::{MigrateError, Result};

/// Maintenance database used for CREATE/DROP DATABASE.
const ADMIN_DATABASE: &str = "template1";

/// Per-invocation configuration: target project, credentials and the
/// on-disk layout of the migrations directory.
///
/// Created once per command and threaded explicitly through the engine;
/// there is no global configuration state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project name; doubles as the target database name.
    pub project: String,

    /// Database role owning the project database.
    pub project_user: String,

    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Optional password; omitted from URLs when absent.
    pub password: Option<String>,

    /// Directory containing the `migrations/` tree.
    pub root: PathBuf,
}

impl Config {
    /// Create a configuration for a project, picking host/port/password
    /// from the conventional `PGHOST`/`PGPORT`/`PGPASSWORD` variables.
    pub fn new(project: &str, project_user: &str) -> Self {
        let host = env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("PGPORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432);
        let password = env::var("PGPASSWORD").ok();

        Self {
            project: project.to_string(),
            project_user: project_user.to_string(),
            host,
            port,
            password,
            root: PathBuf::from("."),
        }
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the password
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Set the project root directory
    pub fn root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    /// Validate configuration
    ///
    /// The project name is interpolated into schema-qualified SQL and into
    /// CREATE DATABASE statements, so it must be a plain identifier.
    pub fn validate(&self) -> Result<()> {
        if !valid_identifier(&self.project) {
            return Err(MigrateError::Config(format!(
                "project name '{}' is not a valid identifier",
                self.project
            )));
        }

        if !valid_identifier(&self.project_user) {
            return Err(MigrateError::Config(format!(
                "project user '{}' is not a valid identifier",
                self.project_user
            )));
        }

        Ok(())
    }

    /// Connection URL for the project database.
    pub fn database_url(&self) -> String {
        self.url_for(&self.project)
    }

    /// Connection URL for the maintenance database, used by admin
    /// operations that cannot run inside the target database.
    pub fn admin_url(&self) -> String {
        self.url_for(ADMIN_DATABASE)
    }

    fn url_for(&self, dbname: &str) -> String {
        match &self.password {
            Some(password) => format!(
                "postgresql://{}:{}@{}:{}/{}",
                self.project_user, password, self.host, self.port, dbname
            ),
            None => format!(
                "postgresql://{}@{}:{}/{}",
                self.project_user, self.host, self.port, dbname
            ),
        }
    }

    /// Name of the dedicated metadata schema inside the project database.
    pub fn meta_schema(&self) -> String {
        format!("pgplan_{}", self.project)
    }

    /// Directory holding the plan file and the change scripts.
    pub fn migrations_dir(&self) -> PathBuf {
        self.root.join("migrations")
    }

    /// Path of the plan file.
    pub fn plan_path(&self) -> PathBuf {
        self.migrations_dir().join("plan.jsonl")
    }
}

/// True when `s` can be used verbatim as an SQL identifier and a file stem.
pub fn valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
