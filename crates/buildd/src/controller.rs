//! Pipeline controller.
//!
//! Drives one run per project through Planning, Building, Validating and
//! Checking. Each run is its own task; the controller keeps only a small
//! per-project entry (cancel token plus a watch on the run's state) so that a
//! second start for a busy project is rejected and status can be answered
//! without touching the run task.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use build_core::events::{
    EventPayload, RetryScheduledPayload, RunFailedPayload, RunStartedPayload,
    RunSucceededPayload, StageCompletedPayload, StageStartedPayload,
};
use build_core::{
    Config, ErrorCategory, ErrorReport, NextAction, ProjectId, RetryPolicy, Run, RunStatus,
    Session, Stage,
};
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{validate_relative_path, BackendError, ExecutionBackend};
use crate::files::{capture_snapshot, read_listed_files, zip_files, FileFilter};
use crate::publisher::{EventPublisher, RunEvents};
use crate::registry::{RegistryError, SessionRegistry};
use crate::stages::{StageContext, StageError, StageResult, Stages};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("request text is empty")]
    EmptyRequest,
    #[error("run already active for project {0}")]
    RunAlreadyActive(ProjectId),
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),
    #[error("no active run for project {0}")]
    RunNotFound(ProjectId),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("failed to build archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Bound on every stage executor call.
    pub stage_timeout: Duration,
    /// Snapshot after a clean Validate as well as at success.
    pub speculative_snapshot: bool,
    pub filter: FileFilter,
}

impl ControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage_timeout: Duration::from_secs(config.stage_timeout_sec),
            speculative_snapshot: config.speculative_snapshot,
            filter: FileFilter::from_config(config),
        }
    }
}

/// Answer to `status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub stage: Stage,
    pub status: RunStatus,
    pub run: Run,
}

/// Answer to `files`.
#[derive(Debug, Clone, Serialize)]
pub struct FilesView {
    pub project_id: ProjectId,
    pub file_list: Vec<String>,
    pub session_active: bool,
}

#[derive(Debug)]
struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    /// `None` while the session is being acquired.
    state: Option<watch::Receiver<Run>>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        self.state
            .as_ref()
            .map_or(true, |rx| !rx.borrow().status.is_terminal())
    }
}

/// How a run ended.
enum Outcome {
    Succeeded {
        endpoint: Option<String>,
        file_list: Vec<String>,
    },
    Failed {
        unresolved: Vec<ErrorReport>,
        detail: String,
    },
    Stopped,
}

pub struct Controller {
    registry: Arc<SessionRegistry>,
    publisher: Arc<EventPublisher>,
    storage: Arc<Storage>,
    backend: Arc<dyn ExecutionBackend>,
    stages: Stages,
    policy: RetryPolicy,
    config: ControllerConfig,
    active: Mutex<HashMap<ProjectId, ActiveRun>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(
        registry: Arc<SessionRegistry>,
        publisher: Arc<EventPublisher>,
        storage: Arc<Storage>,
        backend: Arc<dyn ExecutionBackend>,
        stages: Stages,
        policy: RetryPolicy,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            storage,
            backend,
            stages,
            policy,
            config,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn active(&self) -> MutexGuard<'_, HashMap<ProjectId, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run for a project.
    ///
    /// Rejected with `RunAlreadyActive` while another run for the project is
    /// in flight, and with `SessionUnavailable` (before any run exists) when
    /// no session can be provisioned. The returned run is still in Planning;
    /// progress is observable through events.
    pub async fn start(self: &Arc<Self>, project_id: &ProjectId, request: &str) -> Result<Run> {
        let request = request.trim();
        if request.is_empty() {
            return Err(ControllerError::EmptyRequest);
        }

        let (generation, cancel) = self.reserve(project_id)?;

        if let Err(e) = self.registry.acquire(project_id).await {
            self.retire(project_id, generation);
            let detail = match e {
                RegistryError::SessionUnavailable(detail) => detail,
                other => other.to_string(),
            };
            warn!(project_id = %project_id, error = %detail, "start rejected: no session");
            return Err(ControllerError::SessionUnavailable(detail));
        }

        let run = Run::new(project_id.clone(), request);
        if let Err(e) = self.storage.insert_run(&run).await {
            self.retire(project_id, generation);
            return Err(e.into());
        }

        let (tx, rx) = watch::channel(run.clone());
        if let Some(entry) = self.active().get_mut(project_id) {
            if entry.generation == generation {
                entry.state = Some(rx);
            }
        }

        info!(project_id = %project_id, run_id = %run.id, "run started");
        tokio::spawn(Arc::clone(self).drive(run.clone(), tx, cancel, generation));
        Ok(run)
    }

    /// Follow-up request for a project. Same rules as `start`.
    pub async fn message(self: &Arc<Self>, project_id: &ProjectId, text: &str) -> Result<Run> {
        self.start(project_id, text).await
    }

    fn reserve(&self, project_id: &ProjectId) -> Result<(u64, CancellationToken)> {
        let mut active = self.active();
        if active.get(project_id).is_some_and(ActiveRun::is_running) {
            return Err(ControllerError::RunAlreadyActive(project_id.clone()));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        active.insert(
            project_id.clone(),
            ActiveRun {
                generation,
                cancel: cancel.clone(),
                state: None,
            },
        );
        Ok((generation, cancel))
    }

    fn retire(&self, project_id: &ProjectId, generation: u64) {
        let mut active = self.active();
        if active
            .get(project_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            active.remove(project_id);
        }
    }

    /// Whether a run is in flight for the project.
    pub fn is_active(&self, project_id: &ProjectId) -> bool {
        self.active()
            .get(project_id)
            .is_some_and(ActiveRun::is_running)
    }

    /// Cancel the project's run. The run ends as Failed and its session is released.
    pub fn stop(&self, project_id: &ProjectId) -> Result<()> {
        let active = self.active();
        match active.get(project_id) {
            Some(entry) if entry.is_running() => {
                info!(project_id = %project_id, "stop requested");
                entry.cancel.cancel();
                Ok(())
            }
            _ => Err(ControllerError::RunNotFound(project_id.clone())),
        }
    }

    /// Current stage and status: the in-flight run, else the latest archived one.
    pub async fn status(&self, project_id: &ProjectId) -> Result<RunStatusView> {
        let live = self
            .active()
            .get(project_id)
            .and_then(|entry| entry.state.as_ref().map(|rx| rx.borrow().clone()));
        let run = match live {
            Some(run) => run,
            None => self
                .storage
                .latest_run(project_id)
                .await?
                .ok_or_else(|| ControllerError::ProjectNotFound(project_id.clone()))?,
        };
        Ok(RunStatusView {
            stage: run.current_stage,
            status: run.status,
            run,
        })
    }

    /// Wait until the project's current run is terminal and return it.
    pub async fn wait_for_terminal(&self, project_id: &ProjectId) -> Result<Run> {
        let rx = self
            .active()
            .get(project_id)
            .and_then(|entry| entry.state.clone());
        if let Some(mut rx) = rx {
            if let Ok(run) = rx.wait_for(|run| run.status.is_terminal()).await {
                return Ok(run.clone());
            }
        }
        Ok(self.status(project_id).await?.run)
    }

    /// Files of the live session, or of the latest snapshot when there is none.
    pub async fn files(&self, project_id: &ProjectId) -> Result<FilesView> {
        if let Some(session) = self.registry.peek(project_id).await {
            match self.backend.list_files(&session.handle).await {
                Ok(paths) => {
                    return Ok(FilesView {
                        project_id: project_id.clone(),
                        file_list: self.config.filter.listing(paths),
                        session_active: true,
                    });
                }
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "listing live session failed");
                }
            }
        }

        let file_list = self
            .storage
            .latest_snapshot(project_id)
            .await?
            .map(|snapshot| self.config.filter.listing(snapshot.file_list()))
            .unwrap_or_default();
        Ok(FilesView {
            project_id: project_id.clone(),
            file_list,
            session_active: false,
        })
    }

    /// One file's content, from the live session or the latest snapshot.
    pub async fn file(&self, project_id: &ProjectId, path: &str) -> Result<String> {
        validate_relative_path(path)?;
        if !self.config.filter.is_listed(path) {
            return Err(ControllerError::FileNotFound(path.to_string()));
        }

        if let Some(session) = self.registry.peek(project_id).await {
            match self.backend.read_file(&session.handle, path).await {
                Ok(content) => return Ok(content),
                Err(BackendError::NotFound(_)) => {
                    return Err(ControllerError::FileNotFound(path.to_string()));
                }
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "reading live session failed");
                }
            }
        }

        self.storage
            .latest_snapshot(project_id)
            .await?
            .and_then(|snapshot| snapshot.files.into_iter().find(|f| f.path == path))
            .map(|f| f.content)
            .ok_or_else(|| ControllerError::FileNotFound(path.to_string()))
    }

    /// Every listed file of the project as a ZIP archive: from the live
    /// session, else from the latest snapshot.
    pub async fn download(&self, project_id: &ProjectId) -> Result<Vec<u8>> {
        if let Some(session) = self.registry.peek(project_id).await {
            match read_listed_files(self.backend.as_ref(), &session.handle, &self.config.filter)
                .await
            {
                Ok(files) => return Ok(zip_files(&files)?),
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "reading live session failed");
                }
            }
        }

        let snapshot = self
            .storage
            .latest_snapshot(project_id)
            .await?
            .ok_or_else(|| ControllerError::ProjectNotFound(project_id.clone()))?;
        let files: Vec<_> = snapshot
            .files
            .into_iter()
            .filter(|f| self.config.filter.is_listed(&f.path))
            .collect();
        Ok(zip_files(&files)?)
    }

    /// Tear down the project's session. Refused while a run is using it.
    pub async fn release_session(&self, project_id: &ProjectId) -> Result<()> {
        if self.is_active(project_id) {
            return Err(ControllerError::RunAlreadyActive(project_id.clone()));
        }
        self.registry.release(project_id).await;
        Ok(())
    }

    // --- Run task ---

    async fn drive(
        self: Arc<Self>,
        mut run: Run,
        state: watch::Sender<Run>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let project_id = run.project_id.clone();
        let events = RunEvents::new(
            Arc::clone(&self.publisher),
            project_id.clone(),
            run.id.clone(),
        );
        events
            .emit(EventPayload::RunStarted(RunStartedPayload {
                run_id: run.id.clone(),
                project_id: project_id.clone(),
                request: run.original_request.clone(),
            }))
            .await;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Outcome::Stopped,
            outcome = self.run_stages(&mut run, &state, &events) => outcome,
        };

        let terminal = match outcome {
            Outcome::Succeeded {
                endpoint,
                file_list,
            } => {
                run.finish(RunStatus::Succeeded);
                info!(
                    project_id = %project_id,
                    run_id = %run.id,
                    files = file_list.len(),
                    "run succeeded"
                );
                EventPayload::RunSucceeded(RunSucceededPayload {
                    endpoint,
                    file_list,
                })
            }
            Outcome::Failed { unresolved, detail } => {
                run.finish(RunStatus::Failed);
                error!(project_id = %project_id, run_id = %run.id, detail = %detail, "run failed");
                EventPayload::RunFailed(self.failure_payload(&unresolved, detail))
            }
            Outcome::Stopped => {
                run.finish(RunStatus::Failed);
                info!(project_id = %project_id, run_id = %run.id, "run stopped");
                self.registry.release(&project_id).await;
                EventPayload::RunFailed(RunFailedPayload {
                    categories: Vec::new(),
                    detail: "stopped".to_string(),
                    details: BTreeMap::new(),
                })
            }
        };

        self.archive(&run).await;
        // Status turns terminal only once the terminal event holds its
        // sequence: a follow-up run's events always come after it, and an
        // observer reacting to the event can start the next run at once.
        let finished = run.clone();
        events
            .emit_with(terminal, move |_| {
                state.send_replace(finished);
            })
            .await;
        self.retire(&project_id, generation);
    }

    fn failure_payload(&self, unresolved: &[ErrorReport], detail: String) -> RunFailedPayload {
        let mut details: BTreeMap<ErrorCategory, String> = BTreeMap::new();
        for report in unresolved {
            details.insert(report.category, report.detail.clone());
        }
        RunFailedPayload {
            categories: self.policy.present_categories(unresolved),
            detail,
            details,
        }
    }

    async fn run_stages(
        &self,
        run: &mut Run,
        state: &watch::Sender<Run>,
        events: &RunEvents,
    ) -> Outcome {
        let mut stage = Stage::Planning;
        let mut plan: Option<String> = None;
        let mut scoped: Vec<ErrorReport> = Vec::new();
        let mut attempts: HashMap<Stage, u32> = HashMap::new();

        loop {
            run.enter(stage);
            state.send_replace(run.clone());
            self.archive(run).await;

            let attempt = {
                let n = attempts.entry(stage).or_insert(0);
                *n += 1;
                *n
            };
            info!(project_id = %run.project_id, run_id = %run.id, stage = ?stage, attempt, "stage started");
            events
                .emit(EventPayload::StageStarted(StageStartedPayload { stage, attempt }))
                .await;

            let result = match self
                .run_stage(run, stage, plan.as_deref(), &scoped, events)
                .await
            {
                Ok(result) => result,
                Err(detail) => {
                    return Outcome::Failed {
                        unresolved: Vec::new(),
                        detail: format!("upstream failure: {detail}"),
                    };
                }
            };

            events
                .emit(EventPayload::StageCompleted(StageCompletedPayload {
                    stage,
                    summary: result.output.summary.clone(),
                }))
                .await;
            if stage == Stage::Planning {
                plan = result.output.content;
            }
            if stage == Stage::Building {
                scoped.clear();
            }

            match self
                .policy
                .decide(stage, &result.errors, &run.retry_counts, run.total_retries)
            {
                NextAction::Advance(next) => {
                    if stage == Stage::Validating && self.config.speculative_snapshot {
                        self.snapshot(&run.project_id).await;
                    }
                    stage = next;
                }
                NextAction::Retry {
                    target,
                    scoped_errors,
                } => {
                    self.policy.record_retry(run, &scoped_errors);
                    let categories = self.policy.present_categories(&scoped_errors);
                    warn!(
                        project_id = %run.project_id,
                        run_id = %run.id,
                        from = ?stage,
                        categories = ?categories,
                        total_retries = run.total_retries,
                        "retry scheduled"
                    );
                    events
                        .emit(EventPayload::RetryScheduled(RetryScheduledPayload {
                            stage: target,
                            from_stage: stage,
                            categories,
                            total_retries: run.total_retries,
                        }))
                        .await;
                    scoped = scoped_errors;
                    stage = target;
                }
                NextAction::Succeed => return self.succeed(&run.project_id).await,
                NextAction::Fail { reason, unresolved } => {
                    return Outcome::Failed {
                        unresolved,
                        detail: reason.describe(),
                    };
                }
            }
        }
    }

    /// Run one stage against a live session.
    ///
    /// Timeouts, panics and backend faults become Runtime reports. Only an
    /// upstream failure comes back as `Err`.
    async fn run_stage(
        &self,
        run: &Run,
        stage: Stage,
        plan: Option<&str>,
        scoped: &[ErrorReport],
        events: &RunEvents,
    ) -> std::result::Result<StageResult, String> {
        let session = match self.live_session(&run.project_id).await {
            Ok(session) => session,
            Err(detail) => return Ok(runtime_failure(stage, detail)),
        };

        let ctx = StageContext {
            run,
            session: &session,
            plan,
            scoped_errors: scoped,
            events,
        };
        let executor = self.stages.for_stage(stage);
        let call = AssertUnwindSafe(executor.execute(&ctx)).catch_unwind();

        match tokio::time::timeout(self.config.stage_timeout, call).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(StageError::Upstream(detail)))) => Err(detail),
            Ok(Ok(Err(StageError::Backend(BackendError::SessionExpired(handle))))) => {
                self.registry
                    .invalidate(&run.project_id, &session.handle)
                    .await;
                Ok(runtime_failure(stage, format!("session expired: {handle}")))
            }
            Ok(Ok(Err(StageError::Backend(e)))) => Ok(runtime_failure(stage, e.to_string())),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(run_id = %run.id, stage = ?stage, panic = %message, "stage panicked");
                Ok(runtime_failure(stage, format!("stage panicked: {message}")))
            }
            Err(_) => {
                warn!(run_id = %run.id, stage = ?stage, "stage timed out");
                Ok(runtime_failure(
                    stage,
                    format!("{stage} timed out after {:?}", self.config.stage_timeout),
                ))
            }
        }
    }

    /// Acquire the project's session and push its expiry out.
    ///
    /// A session found expired on extend is replaced by a freshly restored one.
    async fn live_session(&self, project_id: &ProjectId) -> std::result::Result<Session, String> {
        let session = self
            .registry
            .acquire(project_id)
            .await
            .map_err(|e| e.to_string())?;
        match self.registry.extend(project_id).await {
            Ok(session) => Ok(session),
            Err(RegistryError::Expired(_)) => {
                warn!(project_id = %project_id, handle = %session.handle, "session expired, reacquiring");
                self.registry
                    .acquire(project_id)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "failed to extend session");
                Ok(session)
            }
        }
    }

    async fn succeed(&self, project_id: &ProjectId) -> Outcome {
        let session = self.registry.peek(project_id).await;
        let endpoint = session.as_ref().and_then(|s| s.preview_endpoint.clone());

        let file_list = match self.snapshot(project_id).await {
            Some(file_list) => file_list,
            None => match self.storage.latest_snapshot(project_id).await {
                Ok(snapshot) => snapshot.map(|s| s.file_list()).unwrap_or_default(),
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "no snapshot to report");
                    Vec::new()
                }
            },
        };

        Outcome::Succeeded {
            endpoint,
            file_list,
        }
    }

    /// Capture and store a snapshot of the live session. Returns its file list.
    async fn snapshot(&self, project_id: &ProjectId) -> Option<Vec<String>> {
        let session = self.registry.peek(project_id).await?;
        let capture = capture_snapshot(
            self.backend.as_ref(),
            &session.handle,
            project_id,
            &self.config.filter,
        );
        let snapshot = match tokio::time::timeout(self.config.stage_timeout, capture).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(project_id = %project_id, error = %e, "snapshot capture failed");
                return None;
            }
            Err(_) => {
                warn!(project_id = %project_id, "snapshot capture timed out");
                return None;
            }
        };
        match self.storage.save_snapshot(&snapshot).await {
            Ok(true) => info!(project_id = %project_id, files = snapshot.files.len(), "snapshot saved"),
            Ok(false) => debug!(project_id = %project_id, "snapshot unchanged"),
            Err(e) => warn!(project_id = %project_id, error = %e, "failed to save snapshot"),
        }
        Some(snapshot.file_list())
    }

    async fn archive(&self, run: &Run) {
        if let Err(e) = self.storage.update_run(run).await {
            warn!(run_id = %run.id, error = %e, "failed to archive run");
        }
    }
}

fn runtime_failure(stage: Stage, detail: impl Into<String>) -> StageResult {
    StageResult {
        output: build_core::StageOutput::summary(format!("{stage} failed")),
        errors: vec![ErrorReport::runtime(detail, stage)],
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
