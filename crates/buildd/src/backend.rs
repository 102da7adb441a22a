//! Collaborator interfaces consumed by the pipeline.
//!
//! The execution backend owns live environments where files are written and
//! commands run. The reasoning backend produces text for a stage. Both are
//! external; the daemon only relies on the contracts below.

use std::path::{Component, Path};
use std::time::Duration;

use async_trait::async_trait;
use build_core::{SessionHandle, SnapshotFile, Stage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("execution backend unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Captured result of a command run inside a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined, for classification.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Remote code-execution environment.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Provision a fresh environment from a template.
    async fn create_session(&self, template: &str, ttl: Duration) -> Result<SessionHandle>;

    /// Write a set of files into an environment.
    async fn restore(&self, handle: &SessionHandle, files: &[SnapshotFile]) -> Result<()>;

    async fn run_command(
        &self,
        handle: &SessionHandle,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn read_file(&self, handle: &SessionHandle, path: &str) -> Result<String>;

    async fn write_file(&self, handle: &SessionHandle, path: &str, content: &str) -> Result<()>;

    /// Relative paths of every regular file in the environment.
    async fn list_files(&self, handle: &SessionHandle) -> Result<Vec<String>>;

    /// Push the environment's expiry out to `ttl` from now.
    async fn set_timeout(&self, handle: &SessionHandle, ttl: Duration) -> Result<()>;

    /// Tear down an environment. Unknown handles are not an error.
    async fn destroy(&self, handle: &SessionHandle) -> Result<()>;

    /// Public URL serving `port` inside the environment.
    async fn preview_endpoint(&self, handle: &SessionHandle, port: u16) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("reasoning backend unavailable: {0}")]
    Unavailable(String),
    #[error("reasoning backend timed out after {0}s")]
    Timeout(u64),
    #[error("malformed output: {0}")]
    Malformed(String),
}

/// Context handed to the reasoning backend for one stage.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub stage: Stage,
    pub prompt: String,
}

/// What the reasoning backend produced.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub output: String,
    /// Free-form failure text reported alongside the output.
    pub raw_errors: Vec<String>,
}

/// AI reasoning backend.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> std::result::Result<AgentResponse, AgentError>;
}

/// Reject absolute paths and parent traversal.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.is_empty() || p.is_absolute() {
        return Err(BackendError::InvalidPath(path.to_string()));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(BackendError::InvalidPath(path.to_string())),
        }
    }
    Ok(())
}
