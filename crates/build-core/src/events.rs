//! Event kinds and payloads streamed to observers of a run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorCategory, Id, ProjectId, Stage};

/// Event kind names as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    RunStarted,
    StageStarted,
    StageCompleted,
    RetryScheduled,
    RunSucceeded,
    RunFailed,
    /// A command started in the execution backend.
    CommandStarted,
    /// A command finished in the execution backend.
    CommandFinished,
    /// A stage wrote a file into the session.
    FileWritten,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run-started",
            Self::StageStarted => "stage-started",
            Self::StageCompleted => "stage-completed",
            Self::RetryScheduled => "retry-scheduled",
            Self::RunSucceeded => "run-succeeded",
            Self::RunFailed => "run-failed",
            Self::CommandStarted => "command-started",
            Self::CommandFinished => "command-finished",
            Self::FileWritten => "file-written",
        }
    }

    /// Terminal events are never evicted from a replay buffer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunSucceeded | Self::RunFailed)
    }
}

/// Envelope delivered to subscribers. `sequence` is the ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub run_id: Id,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Payload for run-started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub project_id: ProjectId,
    pub request: String,
}

/// Payload for stage-started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStartedPayload {
    pub stage: Stage,
    /// Attempt number of this stage within the run, starting at 1.
    pub attempt: u32,
}

/// Payload for stage-completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCompletedPayload {
    pub stage: Stage,
    pub summary: String,
}

/// Payload for retry-scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryScheduledPayload {
    /// Stage the run returns to.
    pub stage: Stage,
    /// Stage whose errors triggered the retry.
    pub from_stage: Stage,
    pub categories: Vec<ErrorCategory>,
    pub total_retries: u32,
}

/// Payload for run-succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSucceededPayload {
    pub endpoint: Option<String>,
    pub file_list: Vec<String>,
}

/// Payload for run-failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    /// Unresolved categories; empty for upstream or session failures.
    pub categories: Vec<ErrorCategory>,
    /// Summary of why the run ended.
    pub detail: String,
    /// Most recent detail message per unresolved category.
    pub details: BTreeMap<ErrorCategory, String>,
}

/// Payload for command-started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStartedPayload {
    pub stage: Stage,
    pub cmd: String,
}

/// Payload for command-finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFinishedPayload {
    pub stage: Stage,
    pub cmd: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Payload for file-written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrittenPayload {
    pub stage: Stage,
    pub path: String,
    pub bytes: usize,
}

/// Typed payload for any event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    StageStarted(StageStartedPayload),
    StageCompleted(StageCompletedPayload),
    RetryScheduled(RetryScheduledPayload),
    RunSucceeded(RunSucceededPayload),
    RunFailed(RunFailedPayload),
    CommandStarted(CommandStartedPayload),
    CommandFinished(CommandFinishedPayload),
    FileWritten(FileWrittenPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunStarted(_) => EventKind::RunStarted,
            Self::StageStarted(_) => EventKind::StageStarted,
            Self::StageCompleted(_) => EventKind::StageCompleted,
            Self::RetryScheduled(_) => EventKind::RetryScheduled,
            Self::RunSucceeded(_) => EventKind::RunSucceeded,
            Self::RunFailed(_) => EventKind::RunFailed,
            Self::CommandStarted(_) => EventKind::CommandStarted,
            Self::CommandFinished(_) => EventKind::CommandFinished,
            Self::FileWritten(_) => EventKind::FileWritten,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
