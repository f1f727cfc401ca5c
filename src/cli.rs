//! Command-line surface: argument parsing, interactive prompts, progress
//! output and exit-code mapping.
//!
//! Exit codes: 0 for success and benign no-ops (duplicate `add`, removing
//! an unknown change), 1 for operator-declined prompts, bad targets and
//! hard failures.

use std::fs;
use std::io::{self, BufRead, Write};

use chrono::{Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::error;

use crate::config::Config;
use crate::core::{Direction, MigrateError, Result, TagEntry};
use crate::engine::{
    AddOutcome, Engine, RemoveOutcome, RenameOutcome, Reporter, TagAddOutcome, TagRemoveOutcome,
};
use crate::ledger::{PgAdmin, PgLedger};
use crate::plan::PlanFile;
use crate::registry::ScriptRegistry;

/// Width the change name is padded to in progress lines.
const MSG_LENGTH: usize = 60;

#[derive(Parser)]
#[command(name = "pgplan", version, about = "PostgreSQL schema migration manager")]
struct Cli {
    /// Project name; also the target database name. Defaults to $PROJECT.
    #[arg(long, env = "PROJECT")]
    project: String,

    /// Database role owning the project database. Defaults to $PROJECT_USER.
    #[arg(long, env = "PROJECT_USER")]
    project_user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initiate the project's migrations and target database
    Init {
        /// Drop and re-create an existing database
        #[arg(long)]
        newdb: bool,
    },
    /// Add a change to the migration plan
    Add {
        name: String,
        /// Short change description
        #[arg(short, long)]
        msg: String,
    },
    /// Deploy pending changes
    Deploy {
        /// Deploy up to this change or tag, inclusive
        #[arg(long)]
        to: Option<String>,
    },
    /// Revert deployed changes, newest first
    Revert {
        /// Revert down to this change, tag, HEAD or HEAD~N, inclusive
        #[arg(long)]
        to: Option<String>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Remove an undeployed change from the plan
    Remove {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Rename a change
    Rename {
        old_name: String,
        new_name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Report deployment status
    Status,
    /// Sync the plan file into the ledger's planned table
    Sync,
    /// Tag commands: add, list or remove
    Tag {
        #[command(subcommand)]
        command: TagCommand,
    },
}

#[derive(Subcommand)]
enum TagCommand {
    /// Apply a tag to a change (the last planned one by default)
    Add {
        #[arg(short, long)]
        tag: String,
        /// The tag message
        #[arg(short, long)]
        msg: String,
        /// Change name to attach the tag to
        #[arg(short, long)]
        change: Option<String>,
    },
    /// List all tags
    List,
    /// Remove a tag
    Remove {
        #[arg(short, long)]
        tag: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Parse arguments, run the command and map the result to an exit code.
pub fn run() -> i32 {
    init_tracing();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("pgplan: {}", err);
            error!(error = %err, "command failed");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &MigrateError) -> i32 {
    match err {
        // Duplicate add is idempotent-friendly.
        MigrateError::AlreadyExists(_) => 0,
        _ => 1,
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn execute(cli: Cli) -> Result<i32> {
    let config = Config::new(&cli.project, &cli.project_user);
    config.validate()?;

    if let Command::Init { newdb } = cli.command {
        return cmd_init(&config, newdb);
    }

    let plan = PlanFile::new(config.plan_path());
    let registry = ScriptRegistry::scan(config.migrations_dir())?;
    let ledger = PgLedger::connect(&config)?;
    let mut engine = Engine::new(&config.project, plan, registry, ledger);

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::Add { name, msg } => cmd_add(&mut engine, &name, &msg),
        Command::Deploy { to } => cmd_deploy(&mut engine, to.as_deref()),
        Command::Revert { to, yes } => cmd_revert(&mut engine, to.as_deref(), yes),
        Command::Remove { name, yes } => cmd_remove(&mut engine, &name, yes),
        Command::Rename {
            old_name,
            new_name,
            yes,
        } => cmd_rename(&mut engine, &old_name, &new_name, yes),
        Command::Status => cmd_status(&config, &mut engine),
        Command::Sync => cmd_sync(&mut engine),
        Command::Tag { command } => match command {
            TagCommand::Add { tag, msg, change } => {
                cmd_tag_add(&mut engine, &tag, &msg, change.as_deref())
            }
            TagCommand::List => cmd_tag_list(&mut engine),
            TagCommand::Remove { tag, yes } => cmd_tag_remove(&mut engine, &tag, yes),
        },
    }
}

// ---- commands ---------------------------------------------------------------

fn cmd_init(config: &Config, newdb: bool) -> Result<i32> {
    println!("Initiating project '{}' migrations", config.project);
    println!("Migration container path: {}", config.migrations_dir().display());

    fs::create_dir_all(config.migrations_dir())?;
    let registry = ScriptRegistry::scan(config.migrations_dir())?;
    registry.ensure_layout()?;
    let plan = PlanFile::new(config.plan_path());
    if !plan.exists() {
        println!("Creating migration plan: {}", plan.path().display());
        plan.create_empty()?;
    }

    let mut admin = PgAdmin::connect(config)?;
    if newdb {
        if confirm(&format!("Sure to drop existing DB {}?", config.project))? {
            println!("Dropping DB {}", config.project);
            admin.drop_database(&config.project)?;
        } else {
            println!("DB {} will not be dropped", config.project);
        }
    }
    println!("Creating DB {} if not already exists", config.project);
    admin.create_database(&config.project, &config.project_user)?;
    admin.grant_connect(&config.project, &config.project_user)?;
    drop(admin);

    let ledger = PgLedger::connect(config)?;
    let mut engine = Engine::new(&config.project, plan, registry, ledger);
    println!("Sync plan file into DB metaschema plan table");
    engine.sync(&mut ConsoleReporter)?;
    Ok(0)
}

fn cmd_add(engine: &mut Engine<PgLedger>, name: &str, msg: &str) -> Result<i32> {
    match engine.add(name, msg)? {
        AddOutcome::Added(_) => {
            println!("Change '{}' has been added", name);
            Ok(0)
        }
        AddOutcome::AlreadyExists => {
            println!("Change {} already exists in migration plan", name);
            Ok(0)
        }
    }
}

fn cmd_deploy(engine: &mut Engine<PgLedger>, to: Option<&str>) -> Result<i32> {
    let report = engine.deploy(to, &mut ConsoleReporter)?;
    if let Some((name, err)) = report.failed {
        eprintln!("!!! Error in deploy of change '{}': {}", name, err);
        return Ok(1);
    }
    if report.applied.is_empty() {
        println!("Nothing to deploy (up-to-date)");
    }
    Ok(0)
}

fn cmd_revert(engine: &mut Engine<PgLedger>, to: Option<&str>, yes: bool) -> Result<i32> {
    if !yes && !confirm("Revert?")? {
        println!("Nothing done");
        return Ok(1);
    }

    let report = engine.revert(to, &mut ConsoleReporter)?;
    if let Some((name, err)) = report.failed {
        eprintln!("!!! Error in revert of change '{}': {}", name, err);
        return Ok(1);
    }
    if report.reverted.is_empty() {
        println!("Nothing to revert");
    }
    Ok(0)
}

fn cmd_remove(engine: &mut Engine<PgLedger>, name: &str, yes: bool) -> Result<i32> {
    if !yes && !confirm("Remove change?")? {
        println!("Nothing done");
        return Ok(1);
    }

    match engine.remove(name)? {
        RemoveOutcome::Removed => {
            println!("Removed change {} from migration plan", name);
            Ok(0)
        }
        RemoveOutcome::NotFound => {
            println!("Change {} not found in migration plan", name);
            Ok(0)
        }
    }
}

fn cmd_rename(
    engine: &mut Engine<PgLedger>,
    old_name: &str,
    new_name: &str,
    yes: bool,
) -> Result<i32> {
    if !yes && !confirm("Rename change?")? {
        println!("Nothing done");
        return Ok(1);
    }

    match engine.rename(old_name, new_name)? {
        RenameOutcome::Renamed => {
            println!("Renamed change {} to {}", old_name, new_name);
            Ok(0)
        }
        RenameOutcome::NotFound => {
            println!("Change {} not found in migration plan", old_name);
            Ok(0)
        }
    }
}

fn cmd_status(config: &Config, engine: &mut Engine<PgLedger>) -> Result<i32> {
    println!("# On database: {}", config.project);

    let status = engine.status()?;
    if let Some(last) = &status.last_applied {
        let local = Utc
            .from_utc_datetime(&last.applied)
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S");
        println!("# Last Change ID: {}", last.changeid);
        println!("# Last Change Name: {}", last.name);
        println!("# Applied: {}", local);
        println!();
    }

    if status.plan_len > 0 && status.pending.len() == status.plan_len {
        println!("No changes deployed");
        return Ok(0);
    }

    if status.pending.is_empty() {
        println!("Nothing to deploy (up-to-date)");
    } else {
        println!("Undeployed changes:");
        println!();
        let rows: Vec<Vec<String>> = status
            .pending
            .iter()
            .map(|c| {
                vec![
                    c.name.clone(),
                    c.msg.clone(),
                    c.tag.clone().unwrap_or_default(),
                    c.tagmsg.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["Change", "Message", "Tag", "Tag Message"], &rows);
    }
    Ok(0)
}

fn cmd_sync(engine: &mut Engine<PgLedger>) -> Result<i32> {
    println!("Sync plan file into DB metaschema plan table");
    engine.sync(&mut ConsoleReporter)?;
    Ok(0)
}

fn cmd_tag_add(
    engine: &mut Engine<PgLedger>,
    tag: &str,
    msg: &str,
    change: Option<&str>,
) -> Result<i32> {
    let mut ask = |prompt: &str| confirm(prompt).unwrap_or(false);
    match engine.tag_add(tag, msg, change, &mut ask)? {
        TagAddOutcome::Applied { change } => {
            println!("Tag '{}' was applied to change '{}'", tag, change);
            Ok(0)
        }
        TagAddOutcome::TagInUse { change } => {
            eprintln!("Tag '{}' is already bound to change '{}'", tag, change);
            Ok(1)
        }
        TagAddOutcome::Declined => {
            println!("Tag was not replaced");
            Ok(1)
        }
    }
}

fn cmd_tag_list(engine: &mut Engine<PgLedger>) -> Result<i32> {
    let tags = engine.tag_list()?;
    let rows: Vec<Vec<String>> = tags
        .iter()
        .map(|t: &TagEntry| vec![t.change.clone(), t.tag.clone(), t.msg.clone()])
        .collect();
    print_table(&["Change", "Tag", "Message"], &rows);
    Ok(0)
}

fn cmd_tag_remove(engine: &mut Engine<PgLedger>, tag: &str, yes: bool) -> Result<i32> {
    let mut ask = |prompt: &str| yes || confirm(prompt).unwrap_or(false);
    match engine.tag_remove(tag, &mut ask)? {
        TagRemoveOutcome::Removed { change } => {
            println!("Tag '{}' was removed from change '{}'", tag, change);
            Ok(0)
        }
        TagRemoveOutcome::NotFound => {
            println!("No change with tag '{}' was found", tag);
            Ok(0)
        }
        TagRemoveOutcome::Declined => {
            println!("Nothing done");
            Ok(1)
        }
    }
}

// ---- console plumbing ---------------------------------------------------------

/// Prints `+ name ..... ok` progress lines like the deploy/revert scans.
struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn begin_change(&mut self, direction: Direction, name: &str) {
        let marker = match direction {
            Direction::Deploy => '+',
            Direction::Revert => '-',
        };
        let dots = ".".repeat(MSG_LENGTH.saturating_sub(name.len()));
        print!("{} {} {} ", marker, name, dots);
        io::stdout().flush().ok();
    }

    fn finish_change(&mut self, ok: bool) {
        println!("{}", if ok { "ok" } else { "fail" });
    }

    fn info(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Blocking yes/no prompt on stdin. Anything but y/yes declines.
fn confirm(prompt: &str) -> Result<bool> {
    print!("{} (y/N) ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (ind, cell) in row.iter().enumerate() {
            widths[ind] = widths[ind].max(cell.len());
        }
    }

    let line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(ind, h)| format!("{:width$}", h, width = widths[ind]))
        .collect();
    println!("{}", line.join("  "));

    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", rule.join("  "));

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(ind, cell)| format!("{:width$}", cell, width = widths[ind]))
            .collect();
        println!("{}", line.join("  "));
    }
}
