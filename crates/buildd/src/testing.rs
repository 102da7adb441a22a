//! In-memory collaborators for tests.
//!
//! Compiled for this crate's unit tests and, through the `testing` feature,
//! for its integration tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use build_core::events::Event;
use build_core::{Config, RetryPolicy, SessionHandle, SnapshotFile, Stage};

use crate::backend::{
    validate_relative_path, AgentError, AgentRequest, AgentResponse, BackendError, CommandOutput,
    ExecutionBackend, ReasoningBackend, Result,
};
use crate::controller::{Controller, ControllerConfig};
use crate::files::FileFilter;
use crate::publisher::{EventPublisher, Subscription};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::stages::{BuildStage, CheckStage, PlanStage, StageExecutor, Stages, ValidateStage};
use crate::storage::Storage;

/// Backend operations that can be armed to expire every live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    RunCommand,
    ReadFile,
    WriteFile,
    ListFiles,
}

#[derive(Debug, Default)]
struct FakeSession {
    files: BTreeMap<String, String>,
    alive: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    sessions: HashMap<SessionHandle, FakeSession>,
    next_id: usize,
    scripted: HashMap<String, VecDeque<CommandOutput>>,
    commands_run: Vec<String>,
    hanging: HashSet<String>,
    op_counts: HashMap<FakeOp, usize>,
    expire_at: Option<(FakeOp, usize)>,
}

/// Execution backend that keeps sessions in memory.
#[derive(Debug, Default)]
pub struct FakeExecution {
    state: Mutex<FakeState>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_create: AtomicBool,
    create_delay_ms: AtomicUsize,
}

impl FakeExecution {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue outputs for a command. Once drained, the last output repeats.
    /// Unscripted commands succeed with empty output.
    pub fn script_command(&self, cmd: &str, outputs: Vec<CommandOutput>) {
        self.state()
            .scripted
            .insert(cmd.to_string(), outputs.into_iter().collect());
    }

    /// Make a command block until its caller gives up.
    pub fn hang_command(&self, cmd: &str) {
        self.state().hanging.insert(cmd.to_string());
    }

    /// Make `create_session` fail until cleared.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Delay every `create_session` call.
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// On the `nth` call of `op` from now, expire every live session and fail that call.
    pub fn expire_on(&self, op: FakeOp, nth: usize) {
        let mut state = self.state();
        state.op_counts.remove(&op);
        state.expire_at = Some((op, nth));
    }

    /// Expire every live session immediately.
    pub fn expire_all(&self) {
        for session in self.state().sessions.values_mut() {
            session.alive = false;
        }
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.state().sessions.values().filter(|s| s.alive).count()
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.state().commands_run.clone()
    }

    /// Files of a session, live or not.
    pub fn files(&self, handle: &SessionHandle) -> BTreeMap<String, String> {
        self.state()
            .sessions
            .get(handle)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }

    /// Count an operation and apply any armed expiry. Fails if the session is dead.
    fn enter(&self, op: FakeOp, handle: &SessionHandle) -> Result<()> {
        let mut state = self.state();
        let count = {
            let entry = state.op_counts.entry(op).or_insert(0);
            *entry += 1;
            *entry
        };
        if state.expire_at == Some((op, count)) {
            state.expire_at = None;
            for session in state.sessions.values_mut() {
                session.alive = false;
            }
        }
        match state.sessions.get(handle) {
            Some(session) if session.alive => Ok(()),
            _ => Err(BackendError::SessionExpired(handle.to_string())),
        }
    }

    fn check_live(&self, handle: &SessionHandle) -> Result<()> {
        match self.state().sessions.get(handle) {
            Some(session) if session.alive => Ok(()),
            _ => Err(BackendError::SessionExpired(handle.to_string())),
        }
    }
}

#[async_trait]
impl ExecutionBackend for FakeExecution {
    async fn create_session(&self, _template: &str, _ttl: Duration) -> Result<SessionHandle> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("no capacity".to_string()));
        }
        let mut state = self.state();
        state.next_id += 1;
        let handle = SessionHandle(format!("fake-{}", state.next_id));
        state.sessions.insert(
            handle.clone(),
            FakeSession {
                files: BTreeMap::new(),
                alive: true,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn restore(&self, handle: &SessionHandle, files: &[SnapshotFile]) -> Result<()> {
        self.check_live(handle)?;
        let mut state = self.state();
        if let Some(session) = state.sessions.get_mut(handle) {
            for file in files {
                session.files.insert(file.path.clone(), file.content.clone());
            }
        }
        Ok(())
    }

    async fn run_command(
        &self,
        handle: &SessionHandle,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.enter(FakeOp::RunCommand, handle)?;
        let output = {
            let mut state = self.state();
            state.commands_run.push(cmd.to_string());
            if state.hanging.contains(cmd) {
                None
            } else {
                Some(match state.scripted.get_mut(cmd) {
                    Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                    Some(queue) => queue.front().cloned().unwrap_or_default(),
                    None => CommandOutput::default(),
                })
            }
        };
        match output {
            Some(output) => Ok(output),
            None => std::future::pending().await,
        }
    }

    async fn read_file(&self, handle: &SessionHandle, path: &str) -> Result<String> {
        self.enter(FakeOp::ReadFile, handle)?;
        self.state()
            .sessions
            .get(handle)
            .and_then(|s| s.files.get(path).cloned())
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }

    async fn write_file(&self, handle: &SessionHandle, path: &str, content: &str) -> Result<()> {
        validate_relative_path(path)?;
        self.enter(FakeOp::WriteFile, handle)?;
        if let Some(session) = self.state().sessions.get_mut(handle) {
            session.files.insert(path.to_string(), content.to_string());
        }
        Ok(())
    }

    async fn list_files(&self, handle: &SessionHandle) -> Result<Vec<String>> {
        self.enter(FakeOp::ListFiles, handle)?;
        Ok(self
            .state()
            .sessions
            .get(handle)
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_timeout(&self, handle: &SessionHandle, _ttl: Duration) -> Result<()> {
        self.check_live(handle)
    }

    async fn destroy(&self, handle: &SessionHandle) -> Result<()> {
        if self.state().sessions.remove(handle).is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn preview_endpoint(&self, handle: &SessionHandle, port: u16) -> Result<String> {
        self.check_live(handle)?;
        Ok(format!("https://{port}-{handle}.preview.test"))
    }
}

/// Reasoning backend that replays scripted responses per stage.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    responses: Mutex<HashMap<Stage, VecDeque<std::result::Result<AgentResponse, String>>>>,
    prompts: Mutex<Vec<AgentRequest>>,
    panicking: Mutex<HashSet<Stage>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response. Once drained, the last response repeats.
    pub fn respond(&self, stage: Stage, output: impl Into<String>) -> &Self {
        self.push(
            stage,
            Ok(AgentResponse {
                output: output.into(),
                raw_errors: Vec::new(),
            }),
        )
    }

    /// Queue a response that carries raw errors.
    pub fn respond_with_errors(
        &self,
        stage: Stage,
        output: impl Into<String>,
        raw_errors: Vec<String>,
    ) -> &Self {
        self.push(
            stage,
            Ok(AgentResponse {
                output: output.into(),
                raw_errors,
            }),
        )
    }

    /// Queue a transport failure.
    pub fn fail(&self, stage: Stage, message: impl Into<String>) -> &Self {
        self.push(stage, Err(message.into()))
    }

    /// Panic on every invocation for a stage.
    pub fn panic_on(&self, stage: Stage) -> &Self {
        self.panicking
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(stage);
        self
    }

    fn push(&self, stage: Stage, response: std::result::Result<AgentResponse, String>) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(stage)
            .or_default()
            .push_back(response);
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of invocations for a stage.
    pub fn calls(&self, stage: Stage) -> usize {
        self.requests().iter().filter(|r| r.stage == stage).count()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedAgent {
    async fn invoke(
        &self,
        request: AgentRequest,
    ) -> std::result::Result<AgentResponse, AgentError> {
        let stage = request.stage;
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request);
        let panics = self
            .panicking
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&stage);
        if panics {
            panic!("scripted panic in {stage}");
        }

        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = match responses.get_mut(&stage) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(AgentError::Unavailable(message)),
            None => Err(AgentError::Unavailable(format!(
                "no scripted response for {stage}"
            ))),
        }
    }
}

/// Format files the way the build stage expects them from the agent.
pub fn file_blocks(files: &[(&str, &str)]) -> String {
    files
        .iter()
        .map(|(path, content)| format!("<file path=\"{path}\">\n{content}\n</file>"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Command output for a failed command.
pub fn failed_output(stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: 1,
    }
}

/// The files of a minimal working app, as build output.
pub fn app_files() -> String {
    file_blocks(&[
        ("index.html", "<div id=\"root\"></div>"),
        ("package.json", "{\"name\": \"counter\"}"),
        (
            "src/App.jsx",
            "import Counter from './Counter';\nexport default function App() { return <Counter />; }",
        ),
        ("src/main.jsx", "import App from './App';"),
    ])
}

/// Script a plan and a build that produce `app_files`.
pub fn standard_app(agent: &ScriptedAgent) {
    agent.respond(Stage::Planning, "1. Counter component\n2. Render it from App");
    agent.respond(Stage::Building, app_files());
}

/// Read events until a terminal one arrives. Panics after ten seconds.
pub async fn events_until_terminal(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = sub.next().await {
            let terminal = event.kind.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .is_err()
    {
        panic!("no terminal event within 10s");
    }
    events
}

/// A controller wired to in-memory collaborators and a SQLite file under `db_dir`.
#[derive(Debug)]
pub struct TestPipeline {
    pub controller: Arc<Controller>,
    pub backend: Arc<FakeExecution>,
    pub agent: Arc<ScriptedAgent>,
    pub storage: Arc<Storage>,
    pub publisher: Arc<EventPublisher>,
    pub registry: Arc<SessionRegistry>,
}

impl TestPipeline {
    pub async fn new(db_dir: &Path, config: Config) -> Self {
        Self::build(db_dir, config, None).await
    }

    /// Same as `new`, with a custom Check stage.
    pub async fn with_check(db_dir: &Path, config: Config, check: Arc<dyn StageExecutor>) -> Self {
        Self::build(db_dir, config, Some(check)).await
    }

    async fn build(db_dir: &Path, config: Config, check: Option<Arc<dyn StageExecutor>>) -> Self {
        let storage = Storage::new(&db_dir.join("buildd.db"))
            .await
            .expect("open test database");
        storage.migrate_embedded().await.expect("migrate test database");
        let storage = Arc::new(storage);

        let backend = Arc::new(FakeExecution::new());
        let agent = Arc::new(ScriptedAgent::new());
        let exec: Arc<dyn ExecutionBackend> = Arc::clone(&backend) as Arc<dyn ExecutionBackend>;
        let reasoning: Arc<dyn ReasoningBackend> = Arc::clone(&agent) as Arc<dyn ReasoningBackend>;

        let check = check.unwrap_or_else(|| {
            Arc::new(CheckStage::new(Arc::clone(&exec), config.essential_files.clone()))
        });
        let stages = Stages::new(
            Arc::new(PlanStage::new(Arc::clone(&reasoning))),
            Arc::new(BuildStage::new(
                reasoning,
                Arc::clone(&exec),
                FileFilter::from_config(&config),
            )),
            Arc::new(ValidateStage::new(
                Arc::clone(&exec),
                config.validate_cmds.clone(),
                Duration::from_secs(config.stage_timeout_sec),
            )),
            check,
        );

        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&exec),
            Arc::clone(&storage),
            RegistryConfig::from_config(&config),
        ));
        let publisher = Arc::new(EventPublisher::from_config(&config));
        let controller = Arc::new(Controller::new(
            Arc::clone(&registry),
            Arc::clone(&publisher),
            Arc::clone(&storage),
            exec,
            stages,
            RetryPolicy::from_config(&config),
            ControllerConfig::from_config(&config),
        ));

        Self {
            controller,
            backend,
            agent,
            storage,
            publisher,
            registry,
        }
    }
}
