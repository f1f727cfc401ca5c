/// Reconciliation engine integration tests
///
/// These run the engine end to end over a real migrations directory and
/// the in-memory ledger backend.
/// Run with: cargo test --test engine_tests
use pgplan::engine::{AddOutcome, Engine, NullReporter, RemoveOutcome};
use pgplan::{Ledger, MemoryLedger, MigrateError, PlanFile, ScriptRegistry};
use tempfile::TempDir;

fn engine(dir: &TempDir) -> Engine<MemoryLedger> {
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    let registry = ScriptRegistry::scan(&migrations).unwrap();
    registry.ensure_layout().unwrap();
    let plan = PlanFile::new(migrations.join("plan.jsonl"));
    plan.create_empty().unwrap();
    Engine::new("inventory", plan, registry, MemoryLedger::new())
}

fn add_all(engine: &mut Engine<MemoryLedger>, names: &[&str]) {
    for name in names {
        assert!(matches!(
            engine.add(name, "msg").unwrap(),
            AddOutcome::Added(_)
        ));
    }
}

#[test]
fn test_add_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["users"]);

    assert!(matches!(
        engine.add("users", "msg").unwrap(),
        AddOutcome::AlreadyExists
    ));
    assert_eq!(engine.plan().list_entries().unwrap().len(), 1);
    assert_eq!(engine.ledger_mut().planned_names(), vec!["users"]);
}

#[test]
fn test_deploy_twice_changes_nothing_the_second_time() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["users", "orders"]);

    let first = engine.deploy(None, &mut NullReporter).unwrap();
    assert_eq!(first.applied, vec!["users", "orders"]);
    let executed_after_first = engine.ledger_mut().executed_scripts().len();

    let second = engine.deploy(None, &mut NullReporter).unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, 2);
    // No script ran again and no duplicate applied rows appeared.
    assert_eq!(
        engine.ledger_mut().executed_scripts().len(),
        executed_after_first
    );
    assert_eq!(engine.ledger_mut().applied_names(), vec!["users", "orders"]);
}

#[test]
fn test_deploy_to_stops_at_target_inclusive() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b", "c"]);

    let report = engine.deploy(Some("b"), &mut NullReporter).unwrap();
    assert_eq!(report.applied, vec!["a", "b"]);
    assert_eq!(engine.ledger_mut().applied_names(), vec!["a", "b"]);

    let status = engine.status().unwrap();
    let pending: Vec<_> = status.pending.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(pending, vec!["c"]);
}

#[test]
fn test_deploy_resumes_past_an_already_applied_target() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b", "c"]);

    engine.deploy(Some("b"), &mut NullReporter).unwrap();
    // Deploying to an already-applied target is a no-op, not a re-run.
    let report = engine.deploy(Some("b"), &mut NullReporter).unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(engine.ledger_mut().applied_names(), vec!["a", "b"]);
}

#[test]
fn test_revert_follows_apply_order_not_plan_order() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b"]);

    // Manufacture an apply order that diverges from plan order, as happens
    // after non-monotonic deploy --to runs.
    let a_id = engine.ledger_mut().planned_changeid("a").unwrap().unwrap();
    let b_id = engine.ledger_mut().planned_changeid("b").unwrap().unwrap();
    engine.ledger_mut().record_applied(b_id, "b").unwrap();
    engine.ledger_mut().record_applied(a_id, "a").unwrap();

    let report = engine.revert(None, &mut NullReporter).unwrap();
    // a was applied last, so it is reverted first; plan order would say b.
    assert_eq!(report.reverted, vec!["a", "b"]);
    assert!(engine.ledger_mut().applied_names().is_empty());
}

#[test]
fn test_revert_head_reverts_only_the_newest() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b", "c"]);
    engine.deploy(None, &mut NullReporter).unwrap();

    let report = engine.revert(Some("HEAD"), &mut NullReporter).unwrap();
    assert_eq!(report.reverted, vec!["c"]);
    assert_eq!(engine.ledger_mut().applied_names(), vec!["a", "b"]);
}

#[test]
fn test_remove_applied_change_is_rejected_without_mutation() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b"]);
    engine.deploy(Some("a"), &mut NullReporter).unwrap();

    let err = engine.remove("a").unwrap_err();
    assert!(matches!(err, MigrateError::DeployedChangeRemoval(n) if n == "a"));

    // Nothing moved: plan, planned mirror and applied set are intact.
    assert_eq!(engine.plan().list_entries().unwrap().len(), 2);
    assert_eq!(engine.ledger_mut().planned_names(), vec!["a", "b"]);
    assert_eq!(engine.ledger_mut().applied_names(), vec!["a"]);
}

#[test]
fn test_remove_pending_change_cleans_up_everywhere() {
    let dir = TempDir::new().unwrap();
    let migrations = dir.path().join("migrations");
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b"]);

    assert!(migrations.join("deploy/b.sql").exists());
    assert_eq!(engine.remove("b").unwrap(), RemoveOutcome::Removed);

    assert_eq!(engine.plan().list_entries().unwrap().len(), 1);
    assert_eq!(engine.ledger_mut().planned_names(), vec!["a"]);
    assert!(!migrations.join("deploy/b.sql").exists());
    assert!(!migrations.join("revert/b.sql").exists());
}

#[test]
fn test_remove_unknown_change_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a"]);

    assert_eq!(engine.remove("ghost").unwrap(), RemoveOutcome::NotFound);
    assert_eq!(engine.plan().list_entries().unwrap().len(), 1);
}

#[test]
fn test_rename_propagates_to_plan_ledger_and_scripts() {
    let dir = TempDir::new().unwrap();
    let migrations = dir.path().join("migrations");
    let mut engine = engine(&dir);
    add_all(&mut engine, &["users"]);
    engine.deploy(None, &mut NullReporter).unwrap();

    engine.rename("users", "users_base").unwrap();

    let entries = engine.plan().list_entries().unwrap();
    assert_eq!(entries[0].name, "users_base");
    assert_eq!(engine.ledger_mut().applied_names(), vec!["users_base"]);
    assert!(migrations.join("deploy/users_base.sql").exists());
    assert!(migrations.join("revert/users_base.sql").exists());
    assert!(!migrations.join("deploy/users.sql").exists());

    // The renamed scripts still resolve for a later revert.
    let report = engine.revert(None, &mut NullReporter).unwrap();
    assert_eq!(report.reverted, vec!["users_base"]);
}

#[test]
fn test_deploy_records_tag_when_tagged_change_lands() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b"]);
    engine
        .tag_add("v1.0", "first release", Some("b"), &mut |_| true)
        .unwrap();

    engine.deploy(None, &mut NullReporter).unwrap();
    assert_eq!(
        engine.ledger_mut().change_by_tag("v1.0").unwrap().as_deref(),
        Some("b")
    );
    // And the tag resolves as a revert target.
    let report = engine.revert(Some("v1.0"), &mut NullReporter).unwrap();
    assert_eq!(report.reverted, vec!["b"]);
}

#[test]
fn test_sync_is_safe_to_rerun() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b"]);

    assert_eq!(engine.sync(&mut NullReporter).unwrap(), 2);
    assert_eq!(engine.sync(&mut NullReporter).unwrap(), 2);
    assert_eq!(engine.ledger_mut().planned_names(), vec!["a", "b"]);
}

#[test]
fn test_full_scenario_deploy_to_then_revert_all() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b", "c"]);

    let deploy = engine.deploy(Some("b"), &mut NullReporter).unwrap();
    assert_eq!(deploy.applied, vec!["a", "b"]);

    let status = engine.status().unwrap();
    assert_eq!(status.last_applied.unwrap().name, "b");
    let pending: Vec<_> = status.pending.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(pending, vec!["c"]);

    let revert = engine.revert(None, &mut NullReporter).unwrap();
    assert_eq!(revert.reverted, vec!["b", "a"]);
    assert!(engine.ledger_mut().applied_names().is_empty());
}

#[test]
fn test_failed_revert_stops_the_scan() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine(&dir);
    add_all(&mut engine, &["a", "b", "c"]);
    engine.deploy(None, &mut NullReporter).unwrap();

    // The revert script of b fails; c is already gone, a must stay applied.
    engine.ledger_mut().fail_when_contains("Revert inventory:b");
    let report = engine.revert(None, &mut NullReporter).unwrap();
    assert_eq!(report.reverted, vec!["c"]);
    let (failed, err) = report.failed.unwrap();
    assert_eq!(failed, "b");
    assert!(matches!(err, MigrateError::ScriptExecution { .. }));
    assert_eq!(engine.ledger_mut().applied_names(), vec!["a", "b"]);
}
