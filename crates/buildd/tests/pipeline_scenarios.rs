//! End-to-end pipeline runs against in-memory collaborators.

use build_core::events::{Event, EventKind};
use build_core::{Config, ProjectId, RunStatus, Stage};
use buildd::backend::CommandOutput;
use buildd::controller::ControllerError;
use buildd::testing::{
    app_files, events_until_terminal, failed_output, standard_app, FakeOp, TestPipeline,
};
use std::time::Duration;
use tempfile::TempDir;

const IMPORT_FAILURE: &str = "[vite]: Rollup failed to resolve import \"./Counter\" from \"src/App.jsx\"";

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn of_kind(events: &[Event], kind: EventKind) -> Vec<&Event> {
    events.iter().filter(|e| e.kind == kind).collect()
}

fn expected_files() -> serde_json::Value {
    serde_json::json!(["index.html", "package.json", "src/App.jsx", "src/main.jsx"])
}

#[tokio::test]
async fn import_error_is_retried_then_run_succeeds() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    p.backend.script_command(
        "npm run build",
        vec![failed_output(IMPORT_FAILURE), CommandOutput::default()],
    );
    let project = ProjectId::from_string("counter");

    let mut sub = p.publisher.attach(&project, 1).await;
    let run = p
        .controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    let events = events_until_terminal(&mut sub).await;

    assert_eq!(events[0].kind, EventKind::RunStarted);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert!(events.iter().all(|e| e.run_id == run.id));

    let retries = of_kind(&events, EventKind::RetryScheduled);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].payload["stage"], "building");
    assert_eq!(retries[0].payload["from_stage"], "validating");
    assert_eq!(retries[0].payload["categories"], serde_json::json!(["import"]));

    let builds = p
        .agent
        .requests()
        .into_iter()
        .filter(|r| r.stage == Stage::Building)
        .collect::<Vec<_>>();
    assert_eq!(builds.len(), 2);
    assert!(!builds[0].prompt.contains("failed to resolve import"));
    assert!(builds[1].prompt.contains("failed to resolve import"));

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunSucceeded);
    assert_eq!(
        last.payload["endpoint"],
        "https://5173-fake-1.preview.test"
    );
    assert_eq!(last.payload["file_list"], expected_files());

    let finished = p.controller.wait_for_terminal(&project).await.unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(finished.total_retries, 1);
    assert_eq!(finished.retries_for(build_core::ErrorCategory::Import), 1);

    let archived = p.storage.get_run(&run.id).await.unwrap();
    assert_eq!(archived.status, RunStatus::Succeeded);
    assert_eq!(archived.total_retries, 1);
}

#[tokio::test]
async fn persistent_import_error_exhausts_its_budget() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    p.backend
        .script_command("npm run build", vec![failed_output(IMPORT_FAILURE)]);
    let project = ProjectId::from_string("counter");

    let mut sub = p.publisher.attach(&project, 1).await;
    p.controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    let events = events_until_terminal(&mut sub).await;

    assert_eq!(of_kind(&events, EventKind::RetryScheduled).len(), 3);
    // The fourth failure is refused before another build is attempted.
    assert_eq!(p.agent.calls(Stage::Building), 4);
    let validations = p
        .backend
        .commands_run()
        .into_iter()
        .filter(|c| c == "npm run build")
        .count();
    assert_eq!(validations, 4);

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunFailed);
    assert_eq!(last.payload["categories"], serde_json::json!(["import"]));
    assert!(last.payload["details"]["import"]
        .as_str()
        .unwrap()
        .contains("failed to resolve import"));
    assert!(!kinds(&events).contains(&EventKind::RunSucceeded));

    let finished = p.controller.wait_for_terminal(&project).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.total_retries, 3);
}

#[tokio::test]
async fn expired_session_is_restored_and_run_completes() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    // Reads 1-4 capture the snapshot after a clean validate; read 5 is the
    // first check and finds the session gone.
    p.backend.expire_on(FakeOp::ReadFile, 5);
    let project = ProjectId::from_string("counter");

    let mut sub = p.publisher.attach(&project, 1).await;
    p.controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    let events = events_until_terminal(&mut sub).await;

    let pre_expiry = p
        .storage
        .latest_snapshot(&project)
        .await
        .unwrap()
        .unwrap()
        .file_list();

    let retries = of_kind(&events, EventKind::RetryScheduled);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].payload["from_stage"], "checking");
    assert_eq!(retries[0].payload["categories"], serde_json::json!(["runtime"]));

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunSucceeded);
    assert_eq!(last.payload["file_list"], expected_files());
    assert_eq!(last.payload["file_list"], serde_json::json!(pre_expiry));
    assert_eq!(
        last.payload["endpoint"],
        "https://5173-fake-2.preview.test"
    );

    assert_eq!(p.backend.sessions_created(), 2);
    assert_eq!(p.backend.live_sessions(), 1);
    let session = p.registry.peek(&project).await.unwrap();
    assert_eq!(session.handle.to_string(), "fake-2");
    assert_eq!(p.backend.files(&session.handle).len(), 4);
    assert!(p
        .backend
        .commands_run()
        .contains(&"rm -rf node_modules/.vite-temp".to_string()));
}

#[tokio::test]
async fn concurrent_starts_create_exactly_one_run() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    p.backend.set_create_delay(Duration::from_millis(50));
    let project = ProjectId::from_string("counter");

    let (a, b) = tokio::join!(
        p.controller.start(&project, "create a counter app"),
        p.controller.start(&project, "create a counter app"),
    );

    let (ok, rejected) = match (a, b) {
        (Ok(run), Err(e)) | (Err(e), Ok(run)) => (run, e),
        (a, b) => panic!("expected one accepted start, got {a:?} and {b:?}"),
    };
    assert!(matches!(rejected, ControllerError::RunAlreadyActive(_)));
    assert!(rejected.to_string().contains("already active"));

    let finished = p.controller.wait_for_terminal(&project).await.unwrap();
    assert_eq!(finished.id, ok.id);
    assert_eq!(p.backend.sessions_created(), 1);
    assert_eq!(p.agent.calls(Stage::Planning), 1);
}

#[tokio::test]
async fn reconnect_replays_from_sequence_without_gaps() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    let project = ProjectId::from_string("counter");

    let mut first = p.publisher.attach(&project, 1).await;
    p.controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    let all = events_until_terminal(&mut first).await;
    drop(first);

    let k = 4;
    let mut again = p.publisher.attach(&project, k).await;
    let replayed = events_until_terminal(&mut again).await;

    let expected: Vec<u64> = all.iter().map(|e| e.sequence).filter(|s| *s >= k).collect();
    let got: Vec<u64> = replayed.iter().map(|e| e.sequence).collect();
    assert_eq!(got, expected);
    assert_eq!(replayed.last().unwrap().kind, EventKind::RunSucceeded);
}

#[tokio::test]
async fn follow_up_run_continues_sequence_and_reuses_session() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    let project = ProjectId::from_string("counter");

    let mut sub = p.publisher.attach(&project, 1).await;
    p.controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    let first = events_until_terminal(&mut sub).await;

    p.agent.respond(Stage::Building, app_files());
    p.controller
        .message(&project, "make the counter start at ten")
        .await
        .unwrap();
    let second = events_until_terminal(&mut sub).await;

    assert_eq!(
        second[0].sequence,
        first.last().unwrap().sequence + 1
    );
    assert_eq!(second[0].kind, EventKind::RunStarted);
    assert_eq!(second.last().unwrap().kind, EventKind::RunSucceeded);
    assert_eq!(p.backend.sessions_created(), 1);
}

#[tokio::test]
async fn next_run_started_on_terminal_status_follows_previous_outcome() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    let project = ProjectId::from_string("counter");

    let mut sub = p.publisher.attach(&project, 1).await;
    let first = p
        .controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    p.controller.wait_for_terminal(&project).await.unwrap();
    p.agent.respond(Stage::Building, app_files());
    let second = p
        .controller
        .start(&project, "make the counter start at ten")
        .await
        .unwrap();

    let earlier = events_until_terminal(&mut sub).await;
    let later = events_until_terminal(&mut sub).await;

    assert!(earlier.iter().all(|e| e.run_id == first.id));
    assert!(later.iter().all(|e| e.run_id == second.id));
    let outcome = earlier.last().unwrap();
    assert_eq!(outcome.kind, EventKind::RunSucceeded);
    assert_eq!(later[0].kind, EventKind::RunStarted);
    assert_eq!(later[0].sequence, outcome.sequence + 1);
}

#[tokio::test]
async fn persistent_validation_error_exhausts_its_budget() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    standard_app(&p.agent);
    p.backend.script_command(
        "npm run build",
        vec![failed_output("src/App.jsx:3:1: ERROR: Unexpected token")],
    );
    let project = ProjectId::from_string("counter");

    let mut sub = p.publisher.attach(&project, 1).await;
    p.controller
        .start(&project, "create a counter app")
        .await
        .unwrap();
    let events = events_until_terminal(&mut sub).await;

    let retries = of_kind(&events, EventKind::RetryScheduled);
    assert_eq!(retries.len(), 3);
    assert!(retries
        .iter()
        .all(|e| e.payload["categories"] == serde_json::json!(["validation"])));
    assert_eq!(retries[2].payload["total_retries"], 3);
    assert_eq!(p.agent.calls(Stage::Building), 4);

    let building_attempts: Vec<u64> = of_kind(&events, EventKind::StageStarted)
        .into_iter()
        .filter(|e| e.payload["stage"] == "building")
        .map(|e| e.payload["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(building_attempts, vec![1, 2, 3, 4]);

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunFailed);
    assert_eq!(last.payload["categories"], serde_json::json!(["validation"]));
    assert!(last.payload["details"]["validation"]
        .as_str()
        .unwrap()
        .contains("Unexpected token"));

    let finished = p.controller.wait_for_terminal(&project).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.total_retries, 3);
    assert_eq!(
        finished.retries_for(build_core::ErrorCategory::Validation),
        3
    );
}

#[tokio::test]
async fn acquire_is_idempotent_until_release() {
    let dir = TempDir::new().unwrap();
    let p = TestPipeline::new(dir.path(), Config::default()).await;
    let project = ProjectId::from_string("counter");

    let a = p.registry.acquire(&project).await.unwrap();
    let b = p.registry.acquire(&project).await.unwrap();
    assert_eq!(a.handle, b.handle);

    p.registry.release(&project).await;
    let c = p.registry.acquire(&project).await.unwrap();
    assert_ne!(a.handle, c.handle);
    assert_eq!(p.backend.sessions_destroyed(), 1);
}
