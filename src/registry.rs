//! Change Script Registry: resolves a change name to its deploy and revert
//! SQL scripts.
//!
//! Scripts live under `migrations/deploy/<name>.sql` and
//! `migrations/revert/<name>.sql`. The registry is populated once at
//! startup by enumerating both directories; resolution afterwards is a
//! pure map lookup with no reflection or late directory probing.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::{Direction, MigrateError, Result};

#[derive(Debug, Default, Clone)]
struct ScriptPair {
    deploy: Option<PathBuf>,
    revert: Option<PathBuf>,
}

pub struct ScriptRegistry {
    migrations_dir: PathBuf,
    scripts: BTreeMap<String, ScriptPair>,
}

impl ScriptRegistry {
    /// Build the registry by enumerating the deploy and revert directories.
    ///
    /// A missing directory yields an empty side; `ensure_layout` creates both.
    pub fn scan<P: AsRef<Path>>(migrations_dir: P) -> Result<Self> {
        let migrations_dir = migrations_dir.as_ref().to_path_buf();
        let mut scripts: BTreeMap<String, ScriptPair> = BTreeMap::new();

        for direction in [Direction::Deploy, Direction::Revert] {
            let dir = migrations_dir.join(direction.as_str());
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let pair = scripts.entry(name.to_string()).or_default();
                match direction {
                    Direction::Deploy => pair.deploy = Some(path),
                    Direction::Revert => pair.revert = Some(path),
                }
            }
        }

        Ok(Self {
            migrations_dir,
            scripts,
        })
    }

    /// Create the `deploy/` and `revert/` directories.
    pub fn ensure_layout(&self) -> Result<()> {
        for direction in [Direction::Deploy, Direction::Revert] {
            fs::create_dir_all(self.migrations_dir.join(direction.as_str()))?;
        }
        Ok(())
    }

    /// Where the script for `name` in `direction` lives (whether or not it
    /// exists yet).
    pub fn script_path(&self, direction: Direction, name: &str) -> PathBuf {
        self.migrations_dir
            .join(direction.as_str())
            .join(format!("{}.sql", name))
    }

    /// Load the SQL for a registered change script.
    pub fn load(&self, direction: Direction, name: &str) -> Result<String> {
        let path = self
            .scripts
            .get(name)
            .and_then(|pair| match direction {
                Direction::Deploy => pair.deploy.as_ref(),
                Direction::Revert => pair.revert.as_ref(),
            })
            .ok_or_else(|| MigrateError::ScriptMissing {
                change: name.to_string(),
                direction,
            })?;
        Ok(fs::read_to_string(path)?)
    }

    /// Write a skeleton script for a new change.
    ///
    /// Returns `false` (and leaves the file alone) when the script already
    /// exists, so re-running `add` never clobbers edited SQL.
    pub fn create_skeleton(
        &mut self,
        direction: Direction,
        project: &str,
        name: &str,
        msg: &str,
    ) -> Result<bool> {
        let path = self.script_path(direction, name);
        if path.exists() {
            self.register(direction, name, path);
            return Ok(false);
        }

        let heading = match direction {
            Direction::Deploy => "Deploy",
            Direction::Revert => "Revert",
        };
        let mut file = fs::File::create(&path)?;
        writeln!(file, "-- {} {}:{}", heading, project, name)?;
        writeln!(file, "-- {}", msg)?;
        writeln!(file)?;
        writeln!(file, "-- XXX Add {} statements here.", direction)?;

        self.register(direction, name, path);
        Ok(true)
    }

    /// Delete the script file for a removed change, if present.
    pub fn remove_script(&mut self, direction: Direction, name: &str) -> Result<bool> {
        let path = self.script_path(direction, name);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        if let Some(pair) = self.scripts.get_mut(name) {
            match direction {
                Direction::Deploy => pair.deploy = None,
                Direction::Revert => pair.revert = None,
            }
        }
        Ok(true)
    }

    /// Rename the script file of a renamed change, if present.
    pub fn rename_script(
        &mut self,
        direction: Direction,
        old_name: &str,
        new_name: &str,
    ) -> Result<bool> {
        let old_path = self.script_path(direction, old_name);
        if !old_path.exists() {
            return Ok(false);
        }
        let new_path = self.script_path(direction, new_name);
        fs::rename(&old_path, &new_path)?;
        if let Some(pair) = self.scripts.get_mut(old_name) {
            match direction {
                Direction::Deploy => pair.deploy = None,
                Direction::Revert => pair.revert = None,
            }
        }
        self.register(direction, new_name, new_path);
        Ok(true)
    }

    fn register(&mut self, direction: Direction, name: &str, path: PathBuf) {
        let pair = self.scripts.entry(name.to_string()).or_default();
        match direction {
            Direction::Deploy => pair.deploy = Some(path),
            Direction::Revert => pair.revert = Some(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> ScriptRegistry {
        let registry = ScriptRegistry::scan(dir.path().join("migrations")).unwrap();
        registry.ensure_layout().unwrap();
        registry
    }

    #[test]
    fn test_skeleton_create_and_load() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let created = registry
            .create_skeleton(Direction::Deploy, "inventory", "widgets", "add widgets")
            .unwrap();
        assert!(created);

        let sql = registry.load(Direction::Deploy, "widgets").unwrap();
        assert!(sql.starts_with("-- Deploy inventory:widgets"));
        assert!(sql.contains("add widgets"));
    }

    #[test]
    fn test_skeleton_never_clobbers_existing_script() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let path = registry.script_path(Direction::Deploy, "widgets");
        fs::write(&path, "CREATE TABLE widgets (id int);").unwrap();

        let created = registry
            .create_skeleton(Direction::Deploy, "inventory", "widgets", "add widgets")
            .unwrap();
        assert!(!created);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "CREATE TABLE widgets (id int);"
        );
    }

    #[test]
    fn test_scan_picks_up_existing_scripts() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        registry
            .create_skeleton(Direction::Deploy, "inventory", "widgets", "m")
            .unwrap();
        registry
            .create_skeleton(Direction::Revert, "inventory", "widgets", "m")
            .unwrap();

        // A fresh scan of the same tree resolves both directions.
        let rescanned = ScriptRegistry::scan(dir.path().join("migrations")).unwrap();
        assert!(rescanned.load(Direction::Deploy, "widgets").is_ok());
        assert!(rescanned.load(Direction::Revert, "widgets").is_ok());
    }

    #[test]
    fn test_missing_script_is_an_error() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let err = registry.load(Direction::Revert, "ghost").unwrap_err();
        assert!(matches!(
            err,
            MigrateError::ScriptMissing {
                direction: Direction::Revert,
                ..
            }
        ));
    }

    #[test]
    fn test_rename_and_remove_scripts() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        registry
            .create_skeleton(Direction::Deploy, "inventory", "widgets", "m")
            .unwrap();

        assert!(registry
            .rename_script(Direction::Deploy, "widgets", "gadgets")
            .unwrap());
        assert!(registry.load(Direction::Deploy, "gadgets").is_ok());
        assert!(registry.load(Direction::Deploy, "widgets").is_err());

        assert!(registry.remove_script(Direction::Deploy, "gadgets").unwrap());
        assert!(!registry.script_path(Direction::Deploy, "gadgets").exists());
        // Removing again is a quiet no-op.
        assert!(!registry.remove_script(Direction::Deploy, "gadgets").unwrap());
    }
}
