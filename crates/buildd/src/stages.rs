//! Stage executors.
//!
//! Each stage takes the run context and returns an output plus zero or more
//! categorized error reports. Only faults the retry loop cannot act on come
//! back as `StageError`: an unusable reasoning backend (`Upstream`) or a
//! backend failure such as an expired session (`Backend`).

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use build_core::classifier::classify_batch;
use build_core::events::{
    CommandFinishedPayload, CommandStartedPayload, EventPayload, FileWrittenPayload,
};
use build_core::{Config, ErrorReport, Run, Session, Stage, StageOutput};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{AgentError, AgentRequest, BackendError, ExecutionBackend, ReasoningBackend};
use crate::files::FileFilter;
use crate::publisher::RunEvents;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Everything a stage may look at for one invocation.
#[derive(Debug)]
pub struct StageContext<'a> {
    pub run: &'a Run,
    pub session: &'a Session,
    /// Plan text produced by Planning, once available.
    pub plan: Option<&'a str>,
    /// Failures from the previous attempt that this attempt should address.
    pub scoped_errors: &'a [ErrorReport],
    pub events: &'a RunEvents,
}

#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub output: StageOutput,
    pub errors: Vec<ErrorReport>,
}

impl StageResult {
    pub fn ok(output: StageOutput) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError>;
}

/// The four executors the controller drives.
#[derive(Clone)]
pub struct Stages {
    plan: Arc<dyn StageExecutor>,
    build: Arc<dyn StageExecutor>,
    validate: Arc<dyn StageExecutor>,
    check: Arc<dyn StageExecutor>,
}

impl std::fmt::Debug for Stages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stages").finish_non_exhaustive()
    }
}

impl Stages {
    pub fn new(
        plan: Arc<dyn StageExecutor>,
        build: Arc<dyn StageExecutor>,
        validate: Arc<dyn StageExecutor>,
        check: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            plan,
            build,
            validate,
            check,
        }
    }

    /// Standard executors backed by the given collaborators.
    pub fn standard(
        agent: Arc<dyn ReasoningBackend>,
        backend: Arc<dyn ExecutionBackend>,
        config: &Config,
    ) -> Self {
        let cmd_timeout = Duration::from_secs(config.stage_timeout_sec);
        Self::new(
            Arc::new(PlanStage::new(Arc::clone(&agent))),
            Arc::new(BuildStage::new(
                agent,
                Arc::clone(&backend),
                FileFilter::from_config(config),
            )),
            Arc::new(ValidateStage::new(
                Arc::clone(&backend),
                config.validate_cmds.clone(),
                cmd_timeout,
            )),
            Arc::new(CheckStage::new(backend, config.essential_files.clone())),
        )
    }

    pub fn for_stage(&self, stage: Stage) -> Arc<dyn StageExecutor> {
        match stage {
            Stage::Planning => Arc::clone(&self.plan),
            Stage::Building => Arc::clone(&self.build),
            Stage::Validating => Arc::clone(&self.validate),
            Stage::Checking => Arc::clone(&self.check),
        }
    }
}

// --- Plan ---

pub struct PlanStage {
    agent: Arc<dyn ReasoningBackend>,
}

impl std::fmt::Debug for PlanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanStage").finish_non_exhaustive()
    }
}

impl PlanStage {
    pub fn new(agent: Arc<dyn ReasoningBackend>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl StageExecutor for PlanStage {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        let prompt = format!(
            "Write a short implementation plan for a React + Vite app.\n\
             List the files to create and what each one does.\n\n\
             Request:\n{}\n",
            ctx.run.original_request
        );
        let response = self
            .agent
            .invoke(AgentRequest {
                stage: Stage::Planning,
                prompt,
            })
            .await
            .map_err(|e| StageError::Upstream(e.to_string()))?;

        if !response.raw_errors.is_empty() {
            return Err(StageError::Upstream(response.raw_errors.join("; ")));
        }
        let plan = response.output.trim();
        if plan.is_empty() {
            return Err(StageError::Upstream("empty plan".to_string()));
        }

        Ok(StageResult::ok(StageOutput {
            summary: summarize(plan),
            content: Some(plan.to_string()),
        }))
    }
}

// --- Build ---

/// One `<file path="...">` block from build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
}

/// Extract `<file path="...">...</file>` blocks. Unterminated blocks are ignored.
pub fn parse_file_blocks(text: &str) -> Vec<FileBlock> {
    const OPEN: &str = "<file path=\"";
    const CLOSE: &str = "</file>";

    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(path_end) = after_open.find("\">") else {
            break;
        };
        let path = after_open[..path_end].trim().to_string();
        let body = &after_open[path_end + 2..];
        let Some(end) = body.find(CLOSE) else {
            break;
        };
        let content = &body[..end];
        let content = content.strip_prefix('\n').unwrap_or(content);
        let content = content.strip_suffix('\n').unwrap_or(content);
        blocks.push(FileBlock {
            path,
            content: content.to_string(),
        });
        rest = &body[end + CLOSE.len()..];
    }
    blocks
}

pub struct BuildStage {
    agent: Arc<dyn ReasoningBackend>,
    backend: Arc<dyn ExecutionBackend>,
    filter: FileFilter,
}

impl std::fmt::Debug for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildStage")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl BuildStage {
    pub fn new(
        agent: Arc<dyn ReasoningBackend>,
        backend: Arc<dyn ExecutionBackend>,
        filter: FileFilter,
    ) -> Self {
        Self {
            agent,
            backend,
            filter,
        }
    }

    fn prompt(ctx: &StageContext<'_>, existing: &[String]) -> String {
        let mut prompt = String::from(
            "Produce the project files for this request. Emit every file as\n\
             <file path=\"relative/path\">full contents</file>\n\n",
        );
        let _ = write!(prompt, "Request:\n{}\n", ctx.run.original_request);
        if let Some(plan) = ctx.plan {
            let _ = write!(prompt, "\nPlan:\n{plan}\n");
        }
        if !existing.is_empty() {
            let _ = write!(prompt, "\nExisting files:\n{}\n", existing.join("\n"));
        }
        if !ctx.scoped_errors.is_empty() {
            prompt.push_str(
                "\nThe previous attempt failed. Fix only these problems and \
                 re-emit just the files you change:\n",
            );
            for report in ctx.scoped_errors {
                let _ = writeln!(prompt, "- [{}] {}", report.category, report.detail);
            }
        }
        prompt
    }

    async fn existing_files(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, StageError> {
        match self.backend.list_files(&ctx.session.handle).await {
            Ok(paths) => Ok(self.filter.listing(paths)),
            Err(BackendError::SessionExpired(h)) => Err(BackendError::SessionExpired(h).into()),
            Err(e) => {
                warn!(run_id = %ctx.run.id, error = %e, "could not list existing files");
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl StageExecutor for BuildStage {
    fn stage(&self) -> Stage {
        Stage::Building
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        let existing = self.existing_files(ctx).await?;
        let request = AgentRequest {
            stage: Stage::Building,
            prompt: Self::prompt(ctx, &existing),
        };

        let response = match self.agent.invoke(request).await {
            Ok(response) => response,
            Err(AgentError::Timeout(secs)) => {
                return Ok(StageResult {
                    output: StageOutput::summary("build timed out"),
                    errors: vec![ErrorReport::runtime(
                        format!("reasoning backend timed out after {secs}s"),
                        Stage::Building,
                    )],
                });
            }
            Err(e) => return Err(StageError::Upstream(e.to_string())),
        };

        let blocks = parse_file_blocks(&response.output);
        let mut errors = Vec::new();
        if blocks.is_empty() {
            if response.raw_errors.is_empty() {
                return Err(StageError::Upstream(
                    "build output contained no files".to_string(),
                ));
            }
            errors.extend(classify_batch(Stage::Building, response.raw_errors.as_slice()));
            return Ok(StageResult {
                output: StageOutput::summary("no files written"),
                errors,
            });
        }

        let mut written = 0usize;
        for block in &blocks {
            match self
                .backend
                .write_file(&ctx.session.handle, &block.path, &block.content)
                .await
            {
                Ok(()) => {
                    written += 1;
                    ctx.events
                        .emit(EventPayload::FileWritten(FileWrittenPayload {
                            stage: Stage::Building,
                            path: block.path.clone(),
                            bytes: block.content.len(),
                        }))
                        .await;
                }
                Err(BackendError::SessionExpired(h)) => {
                    return Err(BackendError::SessionExpired(h).into());
                }
                Err(e) => {
                    warn!(run_id = %ctx.run.id, path = %block.path, error = %e, "write failed");
                    errors.push(ErrorReport::runtime(
                        format!("failed to write {}: {e}", block.path),
                        Stage::Building,
                    ));
                }
            }
        }

        if !response.raw_errors.is_empty() {
            errors.extend(classify_batch(Stage::Building, response.raw_errors.as_slice()));
        }

        debug!(run_id = %ctx.run.id, written, "build wrote files");
        Ok(StageResult {
            output: StageOutput::summary(format!("wrote {written} file(s)")),
            errors,
        })
    }
}

// --- Validate ---

pub struct ValidateStage {
    backend: Arc<dyn ExecutionBackend>,
    cmds: Vec<String>,
    cmd_timeout: Duration,
}

impl std::fmt::Debug for ValidateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidateStage")
            .field("cmds", &self.cmds)
            .field("cmd_timeout", &self.cmd_timeout)
            .finish_non_exhaustive()
    }
}

impl ValidateStage {
    pub fn new(backend: Arc<dyn ExecutionBackend>, cmds: Vec<String>, cmd_timeout: Duration) -> Self {
        Self {
            backend,
            cmds,
            cmd_timeout,
        }
    }
}

#[async_trait]
impl StageExecutor for ValidateStage {
    fn stage(&self) -> Stage {
        Stage::Validating
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        let mut failures: Vec<String> = Vec::new();
        let mut errors = Vec::new();

        for cmd in &self.cmds {
            ctx.events
                .emit(EventPayload::CommandStarted(CommandStartedPayload {
                    stage: Stage::Validating,
                    cmd: cmd.clone(),
                }))
                .await;
            let started = Instant::now();
            let result = self
                .backend
                .run_command(&ctx.session.handle, cmd, self.cmd_timeout)
                .await;
            let exit_code = match &result {
                Ok(out) => out.exit_code,
                Err(_) => -1,
            };
            ctx.events
                .emit(EventPayload::CommandFinished(CommandFinishedPayload {
                    stage: Stage::Validating,
                    cmd: cmd.clone(),
                    exit_code,
                    duration_ms: started.elapsed().as_millis() as u64,
                }))
                .await;

            match result {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    let text = out.combined();
                    if text.trim().is_empty() {
                        failures.push(format!("`{cmd}` exited with code {}", out.exit_code));
                    } else {
                        failures.push(text);
                    }
                }
                Err(BackendError::SessionExpired(h)) => {
                    return Err(BackendError::SessionExpired(h).into());
                }
                Err(BackendError::Timeout(after)) => errors.push(ErrorReport::runtime(
                    format!("`{cmd}` timed out after {after:?}"),
                    Stage::Validating,
                )),
                Err(e) => errors.push(ErrorReport::runtime(
                    format!("`{cmd}` could not run: {e}"),
                    Stage::Validating,
                )),
            }
        }

        if !failures.is_empty() {
            errors.extend(classify_batch(Stage::Validating, failures.as_slice()));
        }

        let summary = if errors.is_empty() {
            format!("{} command(s) passed", self.cmds.len())
        } else {
            format!("{} problem(s) found", errors.len())
        };
        Ok(StageResult {
            output: StageOutput::summary(summary),
            errors,
        })
    }
}

// --- Check ---

pub struct CheckStage {
    backend: Arc<dyn ExecutionBackend>,
    essential_files: Vec<String>,
}

impl std::fmt::Debug for CheckStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckStage")
            .field("essential_files", &self.essential_files)
            .finish_non_exhaustive()
    }
}

impl CheckStage {
    pub fn new(backend: Arc<dyn ExecutionBackend>, essential_files: Vec<String>) -> Self {
        Self {
            backend,
            essential_files,
        }
    }
}

#[async_trait]
impl StageExecutor for CheckStage {
    fn stage(&self) -> Stage {
        Stage::Checking
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        let mut errors = Vec::new();
        for path in &self.essential_files {
            match self.backend.read_file(&ctx.session.handle, path).await {
                Ok(content) if content.trim().is_empty() => errors.push(ErrorReport::runtime(
                    format!("entry point absent: {path} is empty"),
                    Stage::Checking,
                )),
                Ok(_) => {}
                Err(BackendError::NotFound(_)) => errors.push(ErrorReport::runtime(
                    format!("missing required file: {path}"),
                    Stage::Checking,
                )),
                Err(BackendError::SessionExpired(h)) => {
                    return Err(BackendError::SessionExpired(h).into());
                }
                Err(e) => errors.push(ErrorReport::runtime(
                    format!("could not read {path}: {e}"),
                    Stage::Checking,
                )),
            }
        }

        let summary = if errors.is_empty() {
            format!("{} required file(s) present", self.essential_files.len())
        } else {
            format!("{} required file(s) missing", errors.len())
        };
        Ok(StageResult {
            output: StageOutput::summary(summary),
            errors,
        })
    }
}

/// First line of a text, cut to a readable length.
fn summarize(text: &str) -> String {
    const MAX: usize = 120;
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX {
        line.to_string()
    } else {
        let cut: String = line.chars().take(MAX).collect();
        format!("{cut}...")
    }
}
