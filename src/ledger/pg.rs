//! PostgreSQL ledger backend.
//!
//! One short-lived synchronous connection per command invocation; the
//! connection closes when the ledger is dropped, on every exit path.
//! The metadata schema name is interpolated into statements (identifiers
//! cannot be bound as parameters), which is why `Config::validate`
//! restricts project names to plain identifiers.

use chrono::Utc;
use postgres::error::SqlState;
use postgres::{Client, NoTls};
use tracing::debug;

use crate::config::Config;
use crate::core::{AppliedChange, Change, ChangeId, MigrateError, Result, TagEntry};
use crate::ledger::Ledger;

pub struct PgLedger {
    client: Client,
    schema: String,
}

impl PgLedger {
    /// Connect to the project database.
    pub fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = Client::connect(&config.database_url(), NoTls)
            .map_err(|e| MigrateError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            schema: config.meta_schema(),
        })
    }
}

fn map_pg_err(e: postgres::Error) -> MigrateError {
    match e.as_db_error() {
        Some(db) => MigrateError::SchemaViolation(db.message().to_string()),
        None => MigrateError::Connection(e.to_string()),
    }
}

impl Ledger for PgLedger {
    fn ensure_schema(&mut self) -> Result<()> {
        debug!(schema = %self.schema, "creating metadata schema if absent");
        let ddl = format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS {s};

            CREATE TABLE IF NOT EXISTS {s}.plan (
                changeid uuid PRIMARY KEY,
                name VARCHAR(256) UNIQUE,
                planned TIMESTAMP WITHOUT TIME ZONE DEFAULT NULL,
                msg TEXT,
                tag VARCHAR(100) UNIQUE,
                tagmsg TEXT,
                tagged TIMESTAMP WITHOUT TIME ZONE DEFAULT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.changes (
                changeid uuid PRIMARY KEY REFERENCES {s}.plan(changeid),
                name VARCHAR(256) UNIQUE REFERENCES {s}.plan(name) ON UPDATE CASCADE,
                applied TIMESTAMP WITHOUT TIME ZONE DEFAULT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.tags (
                changeid uuid PRIMARY KEY REFERENCES {s}.changes(changeid) ON DELETE CASCADE,
                tag VARCHAR(100) UNIQUE,
                msg TEXT,
                tagged TIMESTAMP WITHOUT TIME ZONE DEFAULT NULL
            );
            "#,
            s = self.schema
        );
        self.client.batch_execute(&ddl).map_err(map_pg_err)
    }

    fn record_planned(&mut self, change: &Change) -> Result<()> {
        let query = format!(
            "INSERT INTO {s}.plan (changeid, name, planned, msg)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (changeid) DO NOTHING",
            s = self.schema
        );
        self.client
            .execute(
                query.as_str(),
                &[
                    &change.changeid,
                    &change.name,
                    &Utc::now().naive_utc(),
                    &change.msg,
                ],
            )
            .map_err(map_pg_err)?;
        Ok(())
    }

    fn record_applied(&mut self, changeid: ChangeId, name: &str) -> Result<()> {
        let query = format!(
            "INSERT INTO {s}.changes (changeid, name, applied)
             VALUES ($1, $2, $3)
             ON CONFLICT (changeid) DO NOTHING",
            s = self.schema
        );
        self.client
            .execute(query.as_str(), &[&changeid, &name, &Utc::now().naive_utc()])
            .map_err(map_pg_err)?;
        Ok(())
    }

    fn record_reverted(&mut self, changeid: ChangeId) -> Result<()> {
        let query = format!("DELETE FROM {s}.changes WHERE changeid = $1", s = self.schema);
        self.client.execute(query.as_str(), &[&changeid]).map_err(map_pg_err)?;
        Ok(())
    }

    fn is_applied(&mut self, changeid: ChangeId) -> Result<bool> {
        let query = format!(
            "SELECT 1 FROM {s}.changes WHERE changeid = $1",
            s = self.schema
        );
        let row = self
            .client
            .query_opt(query.as_str(), &[&changeid])
            .map_err(map_pg_err)?;
        Ok(row.is_some())
    }

    fn planned_changeid(&mut self, name: &str) -> Result<Option<ChangeId>> {
        let query = format!(
            "SELECT changeid FROM {s}.plan WHERE name = $1",
            s = self.schema
        );
        let row = self.client.query_opt(query.as_str(), &[&name]).map_err(map_pg_err)?;
        Ok(row.map(|r| r.get(0)))
    }

    fn applied_changeid(&mut self, name: &str) -> Result<Option<ChangeId>> {
        let query = format!(
            "SELECT changeid FROM {s}.changes WHERE name = $1",
            s = self.schema
        );
        let row = self.client.query_opt(query.as_str(), &[&name]).map_err(map_pg_err)?;
        Ok(row.map(|r| r.get(0)))
    }

    fn change_by_tag(&mut self, tag: &str) -> Result<Option<String>> {
        let query = format!(
            "SELECT name FROM {s}.plan WHERE tag = $1",
            s = self.schema
        );
        let row = self.client.query_opt(query.as_str(), &[&tag]).map_err(map_pg_err)?;
        Ok(row.map(|r| r.get(0)))
    }

    fn list_applied(
        &mut self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<AppliedChange>> {
        let base = format!(
            "SELECT changeid, name, applied FROM {s}.changes
             ORDER BY applied DESC OFFSET $1",
            s = self.schema
        );
        let offset = offset as i64;
        let rows = match limit {
            Some(limit) => {
                let query = format!("{base} LIMIT $2");
                self.client
                    .query(query.as_str(), &[&offset, &(limit as i64)])
                    .map_err(map_pg_err)?
            }
            None => self.client.query(base.as_str(), &[&offset]).map_err(map_pg_err)?,
        };
        Ok(rows
            .into_iter()
            .map(|row| AppliedChange {
                changeid: row.get(0),
                name: row.get(1),
                applied: row.get(2),
            })
            .collect())
    }

    fn last_applied(&mut self) -> Result<Option<AppliedChange>> {
        Ok(self.list_applied(0, Some(1))?.into_iter().next())
    }

    fn apply_tag(&mut self, changeid: ChangeId, tag: &str, msg: &str) -> Result<()> {
        let now = Utc::now().naive_utc();
        let query = format!(
            "UPDATE {s}.plan
             SET tag = $2, tagmsg = $3, tagged = $4
             WHERE changeid = $1",
            s = self.schema
        );
        self.client
            .execute(query.as_str(), &[&changeid, &tag, &msg, &now])
            .map_err(map_pg_err)?;

        // The tags table is keyed by applied changes; before deploy only
        // the plan columns carry the tag.
        let query = format!(
            "INSERT INTO {s}.tags (changeid, tag, msg, tagged)
             SELECT $1, $2, $3, $4
             WHERE EXISTS (SELECT 1 FROM {s}.changes WHERE changeid = $1)
             ON CONFLICT (changeid)
             DO UPDATE SET tag = excluded.tag, msg = excluded.msg, tagged = excluded.tagged",
            s = self.schema
        );
        self.client
            .execute(query.as_str(), &[&changeid, &tag, &msg, &now])
            .map_err(map_pg_err)?;
        Ok(())
    }

    fn remove_tag(&mut self, name: &str) -> Result<()> {
        let query = format!(
            "DELETE FROM {s}.tags
             WHERE changeid = (SELECT changeid FROM {s}.plan WHERE name = $1)",
            s = self.schema
        );
        self.client.execute(query.as_str(), &[&name]).map_err(map_pg_err)?;

        let query = format!(
            "UPDATE {s}.plan
             SET tag = NULL, tagmsg = NULL, tagged = NULL
             WHERE name = $1",
            s = self.schema
        );
        self.client.execute(query.as_str(), &[&name]).map_err(map_pg_err)?;
        Ok(())
    }

    fn list_tags(&mut self) -> Result<Vec<TagEntry>> {
        let query = format!(
            "SELECT tag, tagmsg, name FROM {s}.plan
             WHERE tag IS NOT NULL
             ORDER BY tag",
            s = self.schema
        );
        let rows = self.client.query(query.as_str(), &[]).map_err(map_pg_err)?;
        Ok(rows
            .into_iter()
            .map(|row| TagEntry {
                tag: row.get(0),
                msg: row.get::<_, Option<String>>(1).unwrap_or_default(),
                change: row.get(2),
            })
            .collect())
    }

    fn rename_change(&mut self, changeid: ChangeId, new_name: &str) -> Result<()> {
        // changes.name references plan(name) ON UPDATE CASCADE, so the
        // applied row follows automatically.
        let query = format!(
            "UPDATE {s}.plan SET name = $2 WHERE changeid = $1",
            s = self.schema
        );
        self.client
            .execute(query.as_str(), &[&changeid, &new_name])
            .map_err(map_pg_err)?;
        Ok(())
    }

    fn remove_planned(&mut self, changeid: ChangeId) -> Result<()> {
        let query = format!("DELETE FROM {s}.plan WHERE changeid = $1", s = self.schema);
        self.client.execute(query.as_str(), &[&changeid]).map_err(map_pg_err)?;
        Ok(())
    }

    fn run_script(&mut self, sql: &str) -> Result<()> {
        let mut tx = self.client.transaction().map_err(map_pg_err)?;
        tx.batch_execute(sql).map_err(map_pg_err)?;
        tx.commit().map_err(map_pg_err)?;
        Ok(())
    }
}

/// Administrative operations that must run outside the project database.
pub struct PgAdmin {
    client: Client,
}

impl PgAdmin {
    /// Connect to the maintenance database.
    pub fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = Client::connect(&config.admin_url(), NoTls)
            .map_err(|e| MigrateError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Create the project database. "Already exists" is benign.
    pub fn create_database(&mut self, dbname: &str, owner: &str) -> Result<()> {
        debug!(dbname, owner, "creating database if absent");
        let query = format!("CREATE DATABASE {dbname} WITH OWNER {owner}");
        match self.client.batch_execute(&query) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => Ok(()),
            Err(e) => Err(map_pg_err(e)),
        }
    }

    /// Drop the project database, severing other sessions first.
    pub fn drop_database(&mut self, dbname: &str) -> Result<()> {
        self.terminate_connections(dbname)?;
        let query = format!("DROP DATABASE IF EXISTS {dbname}");
        self.client.batch_execute(&query).map_err(map_pg_err)
    }

    /// Grant CONNECT on the project database to its owner role.
    pub fn grant_connect(&mut self, dbname: &str, user: &str) -> Result<()> {
        let query = format!("GRANT CONNECT ON DATABASE {dbname} TO {user}");
        self.client.batch_execute(&query).map_err(map_pg_err)
    }

    fn terminate_connections(&mut self, dbname: &str) -> Result<()> {
        let query = "SELECT pg_terminate_backend(pg_stat_activity.pid)
                     FROM pg_stat_activity
                     WHERE pg_stat_activity.datname = $1
                     AND pid <> pg_backend_pid()";
        self.client.query(query, &[&dbname]).map_err(map_pg_err)?;
        Ok(())
    }
}
