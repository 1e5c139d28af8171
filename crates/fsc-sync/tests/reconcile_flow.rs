use fsc_core::JobStatus;
use fsc_storage::StatusStore;
use fsc_sync::{
    FacadeError, InvocationError, JobTool, ReconciliationEngine, SyncConfig, SyncFacade,
    SyncScheduler, SyncScope, TriggerOutcome,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct ToolScript {
    listing: Mutex<Option<Result<String, InvocationError>>>,
    details: Mutex<BTreeMap<String, String>>,
    cancels: Mutex<Vec<(String, Option<u32>)>>,
    list_calls: AtomicUsize,
    describe_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

/// Scripted stand-in for the job tool that also tracks how many calls
/// overlap.
#[derive(Clone)]
struct FakeTool(Arc<ToolScript>);

impl FakeTool {
    fn new() -> Self {
        Self(Arc::new(ToolScript::default()))
    }

    fn with_delay(delay: Duration) -> Self {
        Self(Arc::new(ToolScript {
            delay,
            ..ToolScript::default()
        }))
    }

    fn set_listing(&self, rows: &[(&str, &str)]) {
        *self.0.listing.lock().expect("listing lock") = Some(Ok(listing(rows)));
    }

    fn fail_listing(&self, err: InvocationError) {
        *self.0.listing.lock().expect("listing lock") = Some(Err(err));
    }

    fn set_detail(&self, name: &str, jobs: &[(u32, &str, &str)]) {
        self.0
            .details
            .lock()
            .expect("details lock")
            .insert(name.to_string(), detail(jobs));
    }

    fn describe_calls(&self) -> usize {
        self.0.describe_calls.load(Ordering::SeqCst)
    }

    async fn call<R>(&self, respond: impl FnOnce(&ToolScript) -> R) -> R {
        let now_active = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.0.delay.is_zero() {
            tokio::time::sleep(self.0.delay).await;
        }
        let response = respond(&self.0);
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

impl JobTool for FakeTool {
    async fn list_experiments(&self, _limit: usize) -> Result<String, InvocationError> {
        self.call(|script| {
            script.list_calls.fetch_add(1, Ordering::SeqCst);
            script
                .listing
                .lock()
                .expect("listing lock")
                .clone()
                .unwrap_or_else(|| Ok(String::new()))
        })
        .await
    }

    async fn describe_experiment(&self, name: &str) -> Result<String, InvocationError> {
        self.call(|script| {
            script.describe_calls.fetch_add(1, Ordering::SeqCst);
            script
                .details
                .lock()
                .expect("details lock")
                .get(name)
                .cloned()
                .ok_or_else(|| InvocationError::NonZeroExit {
                    program: "amlt".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("no experiment {name}"),
                })
        })
        .await
    }

    async fn cancel(&self, name: &str, job: Option<u32>) -> Result<String, InvocationError> {
        self.call(|script| {
            script
                .cancels
                .lock()
                .expect("cancels lock")
                .push((name.to_string(), job));
            Ok(String::new())
        })
        .await
    }

    async fn logs(&self, name: &str, job: u32, tail_lines: usize) -> Result<String, InvocationError> {
        self.call(|_| Ok(format!("{name} :{job} last {tail_lines} lines")))
            .await
    }
}

fn listing(rows: &[(&str, &str)]) -> String {
    let mut lines = vec![format!(
        "{:<20}{:<10}{:<30}{}",
        "EXPERIMENT_NAME", "MODIFIED", "JOB_STATUS", "CLUSTER"
    )];
    for (name, status) in rows {
        lines.push(format!("{:<20}{:<10}{:<30}{}", name, "5m ago", status, "a100"));
    }
    lines.join("\n")
}

fn detail(jobs: &[(u32, &str, &str)]) -> String {
    let mut lines = vec![format!("{:<6}{:<16}{}", "#", "JOB_NAME", "STATUS")];
    for (index, name, status) in jobs {
        lines.push(format!(
            "{:<6}{:<16}{}",
            format!(":{index}"),
            format!(":{name}"),
            status
        ));
    }
    lines.join("\n")
}

fn test_config() -> SyncConfig {
    SyncConfig {
        cancel_confirm_delay: Duration::from_secs(3600),
        ..SyncConfig::default()
    }
}

fn harness(tool: FakeTool, config: SyncConfig) -> (Arc<StatusStore>, SyncFacade<FakeTool>) {
    let store = Arc::new(StatusStore::open_in_memory().expect("open store"));
    let engine = Arc::new(ReconciliationEngine::new(tool, Arc::clone(&store), config));
    let scheduler = Arc::new(SyncScheduler::new(engine));
    (store, SyncFacade::new(scheduler))
}

fn names(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn status_of(store: &StatusStore, name: &str) -> JobStatus {
    store.get(name).expect("stored").experiment.status()
}

#[tokio::test]
async fn poll_keeps_terminal_entries_after_they_age_out() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("alpha", "Running (1)"), ("bravo", "Pass (1)")]);
    let result = engine.poll_all().await.expect("poll");
    assert_eq!((result.seen, result.updated), (2, 2));
    assert!(result.errors.is_empty());
    assert!(store.get("bravo").expect("bravo").terminal);

    tool.set_listing(&[("alpha", "Running (1)")]);
    let result = engine.poll_all().await.expect("poll");
    assert_eq!(result.seen, 1);
    assert_eq!(result.updated, 0);
    assert_eq!(status_of(&store, "bravo"), JobStatus::Passed);
}

#[tokio::test]
async fn malformed_listing_row_is_reported_not_fatal() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());

    let mut text = listing(&[("alpha", "Queued (1)"), ("bravo", "Running (2)")]);
    text.push_str("\nbroken-row");
    *tool.0.listing.lock().expect("listing lock") = Some(Ok(text));

    let result = facade.scheduler().engine().poll_all().await.expect("poll");
    assert_eq!(result.seen, 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(store.list_all().expect("list").len(), 2);
}

#[tokio::test]
async fn running_experiment_is_corrected_from_job0() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("sweep", "Running (1), Pass (1)")]);
    engine.poll_all().await.expect("poll");
    assert_eq!(status_of(&store, "sweep"), JobStatus::Running);

    tool.set_detail("sweep", &[(0, "lr-a", "pass"), (1, "lr-b", "running")]);
    let result = engine
        .check_and_correct(&names(&["sweep"]))
        .await
        .expect("correct");
    assert_eq!(result.corrected, 1);

    let entry = store.get("sweep").expect("stored");
    assert_eq!(entry.experiment.status(), JobStatus::Passed);
    assert_eq!(entry.experiment.jobs().len(), 2);
    assert!(entry.terminal);
    assert!(entry.terminal_at.is_some());
}

#[tokio::test]
async fn failed_side_jobs_do_not_change_aggregate_status() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("sweep", "Running (1), Fail (2)")]);
    engine.poll_all().await.expect("poll");
    tool.set_detail(
        "sweep",
        &[(1, "lr-b", "failed"), (0, "lr-a", "running"), (2, "lr-c", "failed")],
    );
    let result = engine
        .check_and_correct(&names(&["sweep"]))
        .await
        .expect("correct");

    assert_eq!(result.corrected, 0);
    let entry = store.get("sweep").expect("stored");
    assert_eq!(entry.experiment.status(), JobStatus::Running);
    assert_eq!(entry.experiment.jobs()[0].name, "lr-a");
    assert!(!entry.terminal);
}

#[tokio::test]
async fn terminal_entries_are_never_touched_by_automatic_paths() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("exp", "Running (1)")]);
    engine.poll_all().await.expect("poll");
    tool.set_detail("exp", &[(0, "exp", "pass")]);
    engine
        .check_and_correct(&names(&["exp"]))
        .await
        .expect("correct");
    let settled = store.get("exp").expect("stored");
    assert_eq!(settled.experiment.status(), JobStatus::Passed);

    // a lagging listing still claims the experiment is running
    let calls_before = tool.describe_calls();
    engine.poll_all().await.expect("poll");
    let result = engine
        .check_and_correct(&names(&["exp"]))
        .await
        .expect("correct");
    assert_eq!(result.seen, 0);
    assert_eq!(tool.describe_calls(), calls_before);
    assert_eq!(store.get("exp").expect("stored"), settled);
}

#[tokio::test]
async fn correction_is_idempotent() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("sweep", "Running (2)")]);
    engine.poll_all().await.expect("poll");
    tool.set_detail("sweep", &[(0, "lr-a", "running"), (1, "lr-b", "pass")]);

    let first = engine
        .check_and_correct(&names(&["sweep"]))
        .await
        .expect("first");
    let after_first = store.get("sweep").expect("stored").experiment;
    let second = engine
        .check_and_correct(&names(&["sweep"]))
        .await
        .expect("second");
    let after_second = store.get("sweep").expect("stored").experiment;

    assert_eq!(first.corrected, 0);
    assert_eq!(first.updated, 1);
    assert_eq!(second.corrected, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn unknown_job0_status_does_not_replace_a_known_one() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("exp", "Queued (1)")]);
    engine.poll_all().await.expect("poll");
    tool.set_detail("exp", &[(0, "exp", "teleporting")]);
    let result = engine
        .check_and_correct(&names(&["exp"]))
        .await
        .expect("correct");

    assert_eq!(result.corrected, 0);
    assert_eq!(status_of(&store, "exp"), JobStatus::Queued);
}

#[tokio::test]
async fn detail_without_job0_is_recorded() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    let engine = facade.scheduler().engine();

    tool.set_listing(&[("exp", "Running (1)")]);
    engine.poll_all().await.expect("poll");
    tool.set_detail("exp", &[(1, "side", "pass")]);
    let result = engine
        .check_and_correct(&names(&["exp"]))
        .await
        .expect("correct");

    assert_eq!(result.errors.len(), 1);
    assert_eq!(status_of(&store, "exp"), JobStatus::Running);
}

#[tokio::test]
async fn concurrent_full_triggers_never_overlap() {
    let tool = FakeTool::with_delay(Duration::from_millis(50));
    let (_store, facade) = harness(tool.clone(), test_config());
    tool.set_listing(&[("alpha", "Running (1)")]);
    tool.set_detail("alpha", &[(0, "alpha", "running")]);

    let (first, second) = tokio::join!(
        facade.refresh_now(SyncScope::All),
        facade.refresh_now(SyncScope::All)
    );
    let outcomes = [first.expect("first"), second.expect("second")];
    let completed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, TriggerOutcome::Completed(_)))
        .count();

    assert!((1..=2).contains(&completed));
    assert_eq!(tool.0.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(facade.scheduler().in_flight(), None);
}

#[tokio::test]
async fn narrower_trigger_queues_behind_the_running_one() {
    let tool = FakeTool::with_delay(Duration::from_millis(30));
    let (store, facade) = harness(tool.clone(), test_config());
    tool.set_listing(&[("alpha", "Running (1)")]);
    tool.set_detail("alpha", &[(0, "alpha", "pass")]);

    let (all, single, active) = tokio::join!(
        facade.refresh_now(SyncScope::All),
        facade.refresh_now(SyncScope::Experiment("alpha".to_string())),
        facade.refresh_now(SyncScope::Active),
    );

    assert!(matches!(all.expect("all"), TriggerOutcome::Completed(_)));
    assert!(matches!(
        single.expect("single"),
        TriggerOutcome::Completed(_)
    ));
    match active.expect("active") {
        TriggerOutcome::Coalesced { behind, result } => {
            assert_eq!(behind, SyncScope::All);
            assert_eq!(result.expect("covering run").seen, 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(tool.0.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(store.recent_syncs(10).expect("syncs").len(), 2);
}

#[tokio::test]
async fn cancel_is_visible_before_the_next_poll() {
    let tool = FakeTool::new();
    let (_store, facade) = harness(tool.clone(), test_config());
    tool.set_listing(&[("winning-joey", "Running (1)")]);
    facade
        .refresh_now(SyncScope::All)
        .await
        .expect_err("detail for winning-joey is not scripted");
    assert_eq!(
        facade
            .get_experiment("winning-joey")
            .expect("stored")
            .experiment
            .status(),
        JobStatus::Running
    );

    let outcome = facade.cancel("winning-joey", None).await.expect("cancel");
    assert_eq!(outcome.killed_jobs, 1);

    let entry = facade.get_experiment("winning-joey").expect("stored");
    assert_eq!(entry.experiment.status(), JobStatus::Killed);
    assert!(entry.terminal);
    assert_eq!(
        *tool.0.cancels.lock().expect("cancels lock"),
        vec![("winning-joey".to_string(), None)]
    );
}

#[tokio::test]
async fn cancel_schedules_a_confirming_refresh() {
    let tool = FakeTool::new();
    let config = SyncConfig {
        cancel_confirm_delay: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let (store, facade) = harness(tool.clone(), config);
    tool.set_listing(&[("exp", "Running (2)")]);
    tool.set_detail("exp", &[(0, "exp-0", "running"), (1, "exp-1", "running")]);
    facade.refresh_now(SyncScope::All).await.expect("sync");

    tool.set_detail("exp", &[(0, "exp-0", "running"), (1, "exp-1", "killed")]);
    let outcome = facade.cancel("exp", Some(1)).await.expect("cancel");
    assert_eq!(outcome.killed_jobs, 1);
    assert_eq!(status_of(&store, "exp"), JobStatus::Running);

    let mut confirmed = false;
    for _ in 0..100 {
        let syncs = store.recent_syncs(1).expect("syncs");
        if syncs.first().map(|record| record.scope.as_str()) == Some("experiment:exp") {
            confirmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(confirmed, "confirming refresh never ran");
    let entry = store.get("exp").expect("stored");
    assert_eq!(
        entry.experiment.job(1).map(|job| job.status),
        Some(JobStatus::Killed)
    );
}

#[tokio::test]
async fn operator_refresh_rewrites_terminal_entries() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());
    tool.set_listing(&[("exp", "Pass (1)")]);
    facade
        .scheduler()
        .engine()
        .poll_all()
        .await
        .expect("poll");
    assert_eq!(status_of(&store, "exp"), JobStatus::Passed);

    tool.set_detail("exp", &[(0, "exp", "failed")]);
    let outcome = facade
        .refresh_now(SyncScope::Experiment("exp".to_string()))
        .await
        .expect("refresh");
    match outcome {
        TriggerOutcome::Completed(result) => assert_eq!(result.corrected, 1),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(status_of(&store, "exp"), JobStatus::Failed);

    tool.set_detail("fresh", &[(0, "fresh", "queued")]);
    facade
        .refresh_now(SyncScope::Experiment("fresh".to_string()))
        .await
        .expect("refresh unknown");
    assert_eq!(status_of(&store, "fresh"), JobStatus::Queued);
}

#[tokio::test]
async fn invocation_failures_surface_on_demand_and_as_last_error() {
    let tool = FakeTool::new();
    let (_store, facade) = harness(tool.clone(), test_config());
    tool.fail_listing(InvocationError::Missing {
        program: "amlt".to_string(),
    });

    let err = facade
        .refresh_now(SyncScope::All)
        .await
        .expect_err("missing tool");
    assert!(matches!(
        err,
        FacadeError::Invocation(InvocationError::Missing { .. })
    ));
    assert_eq!(facade.last_error().as_deref(), Some("amlt not found"));
    assert_eq!(facade.recent_syncs(5).expect("syncs")[0].error_count, 1);
}

#[tokio::test]
async fn scheduled_loop_keeps_ticking_after_failures() {
    let tool = FakeTool::new();
    let config = SyncConfig {
        poll_interval: Duration::from_millis(20),
        ..test_config()
    };
    let (_store, facade) = harness(tool.clone(), config);
    tool.fail_listing(InvocationError::Timeout {
        program: "amlt".to_string(),
        timeout: Duration::from_secs(60),
    });

    let handle = facade.scheduler().start();
    for _ in 0..200 {
        if facade.scheduler_status().completed_runs >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    let status = facade.scheduler_status();
    assert!(status.completed_runs >= 3);
    assert!(status.last_error.is_some());
    assert!(tool.0.list_calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn reads_for_unknown_names_are_not_found() {
    let (_store, facade) = harness(FakeTool::new(), test_config());
    assert!(matches!(
        facade.get_experiment("nope"),
        Err(FacadeError::NotFound(name)) if name == "nope"
    ));
    assert!(facade
        .list_by_status(JobStatus::Running)
        .expect("list")
        .is_empty());
    assert_eq!(
        facade.logs("nope", 0, 10).await.expect("logs"),
        "nope :0 last 10 lines"
    );
}

#[tokio::test]
async fn retained_history_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("jobs.db");
    let tool = FakeTool::new();
    tool.set_listing(&[("bravo", "Pass (1)")]);
    {
        let store = Arc::new(StatusStore::open(&path).expect("open store"));
        let engine = ReconciliationEngine::new(tool.clone(), store, test_config());
        engine.poll_all().await.expect("poll");
    }

    tool.set_listing(&[]);
    let store = Arc::new(StatusStore::open(&path).expect("reopen store"));
    let engine = ReconciliationEngine::new(tool.clone(), Arc::clone(&store), test_config());
    let result = engine.poll_all().await.expect("poll");

    assert_eq!(result.seen, 0);
    assert!(result.errors.is_empty());
    let entry = store.get("bravo").expect("retained");
    assert!(entry.terminal);
    assert_eq!(entry.experiment.status(), JobStatus::Passed);
}

#[tokio::test]
async fn coalesced_refresh_reports_the_covering_failure() {
    let tool = FakeTool::with_delay(Duration::from_millis(30));
    let (_store, facade) = harness(tool.clone(), test_config());
    tool.fail_listing(InvocationError::Missing {
        program: "amlt".to_string(),
    });

    let (first, second) = tokio::join!(
        facade.refresh_now(SyncScope::All),
        facade.refresh_now(SyncScope::All)
    );

    for outcome in [first, second] {
        assert!(matches!(
            outcome,
            Err(FacadeError::Invocation(InvocationError::Missing { .. }))
        ));
    }
    assert_eq!(tool.0.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_before_any_poll_creates_a_killed_entry() {
    let tool = FakeTool::new();
    let (store, facade) = harness(tool.clone(), test_config());

    let outcome = facade.cancel("winning-joey", None).await.expect("cancel");
    assert_eq!(outcome.killed_jobs, 1);
    let entry = facade.get_experiment("winning-joey").expect("stored");
    assert_eq!(entry.experiment.status(), JobStatus::Killed);
    assert!(entry.terminal);

    facade.cancel("sweep", Some(2)).await.expect("cancel one job");
    let sweep = store.get("sweep").expect("stored").experiment;
    assert_eq!(sweep.job(2).map(|job| job.status), Some(JobStatus::Killed));
    assert_eq!(sweep.status(), JobStatus::Unknown);
}

#[tokio::test]
async fn zero_confirm_delay_rereads_the_tool_before_returning() {
    let tool = FakeTool::new();
    let config = SyncConfig {
        cancel_confirm_delay: Duration::ZERO,
        ..SyncConfig::default()
    };
    let (store, facade) = harness(tool.clone(), config);
    tool.set_detail("exp", &[(0, "exp-0", "killed"), (1, "exp-1", "pass")]);

    let outcome = facade.cancel("exp", None).await.expect("cancel");

    assert!(outcome.confirm_after.is_zero());
    let entry = outcome.entry.expect("entry");
    assert_eq!(entry.experiment.jobs().len(), 2);
    assert_eq!(
        entry.experiment.job(1).map(|job| job.status),
        Some(JobStatus::Passed)
    );
    assert_eq!(
        store.recent_syncs(1).expect("syncs")[0].scope,
        "experiment:exp"
    );
}

#[tokio::test]
async fn scheduled_loop_survives_out_of_range_ages() {
    let tool = FakeTool::new();
    let config = SyncConfig {
        poll_interval: Duration::from_millis(20),
        ..test_config()
    };
    let (store, facade) = harness(tool.clone(), config);
    let text = [
        format!(
            "{:<20}{:<20}{:<36}{}",
            "EXPERIMENT_NAME", "MODIFIED", "JOB_STATUS", "CLUSTER"
        ),
        format!(
            "{:<20}{:<20}{:<36}{}",
            "ancient", "99999999999d ago", "Running (4294967295), Pass (1)", "cpu"
        ),
    ]
    .join("\n");
    *tool.0.listing.lock().expect("listing lock") = Some(Ok(text));
    tool.set_detail("ancient", &[(0, "ancient", "running")]);

    let handle = facade.scheduler().start();
    for _ in 0..200 {
        if facade.scheduler_status().completed_runs >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    assert!(facade.scheduler_status().completed_runs >= 3);
    assert!(tool.0.list_calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(status_of(&store, "ancient"), JobStatus::Running);
}
