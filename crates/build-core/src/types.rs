//! Core types for the build pipeline.
//!
//! A `Run` is one attempt to satisfy a build request for a project. It moves
//! through the ordered `Stage`s and ends in a terminal `RunStatus`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier for runs and sessions.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stable external key for a project. Chosen by the caller, never generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque reference to a live environment in the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Pipeline stage. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Building,
    Validating,
    Checking,
}

impl Stage {
    pub const ALL: [Self; 4] = [
        Self::Planning,
        Self::Building,
        Self::Validating,
        Self::Checking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Building => "building",
            Self::Validating => "validating",
            Self::Checking => "checking",
        }
    }

    /// The stage that follows this one on a clean pass, `None` after Checking.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Planning => Some(Self::Building),
            Self::Building => Some(Self::Validating),
            Self::Validating => Some(Self::Checking),
            Self::Checking => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Recoverable error category used for retry routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Import,
    Validation,
    Runtime,
}

impl ErrorCategory {
    pub const ALL: [Self; 3] = [Self::Import, Self::Validation, Self::Runtime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Validation => "validation",
            Self::Runtime => "runtime",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "import" => Some(Self::Import),
            "validation" => Some(Self::Validation),
            "runtime" => Some(Self::Runtime),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Core Types ---

/// A classified failure produced during a stage. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub detail: String,
    pub source_stage: Stage,
}

impl ErrorReport {
    pub fn new(category: ErrorCategory, detail: impl Into<String>, source_stage: Stage) -> Self {
        Self {
            category,
            detail: detail.into(),
            source_stage,
        }
    }

    pub fn runtime(detail: impl Into<String>, source_stage: Stage) -> Self {
        Self::new(ErrorCategory::Runtime, detail, source_stage)
    }
}

/// One end-to-end attempt to satisfy a build request.
///
/// Unknown fields are rejected so stale or hand-edited records fail loudly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Run {
    pub id: Id,
    pub project_id: ProjectId,
    pub original_request: String,
    pub current_stage: Stage,
    /// Retries consumed per category. Absent means zero.
    pub retry_counts: BTreeMap<ErrorCategory, u32>,
    pub total_retries: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(project_id: ProjectId, original_request: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            project_id,
            original_request: original_request.into(),
            current_stage: Stage::Planning,
            retry_counts: BTreeMap::new(),
            total_retries: 0,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn retries_for(&self, category: ErrorCategory) -> u32 {
        self.retry_counts.get(&category).copied().unwrap_or(0)
    }

    pub fn enter(&mut self, stage: Stage) {
        self.current_stage = stage;
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A live execution environment bound to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub project_id: ProjectId,
    pub handle: SessionHandle,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub preview_endpoint: Option<String>,
}

impl Session {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(Utc::now())
    }
}

/// One captured file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    pub content: String,
}

/// Durable record of a project's file set. Latest snapshot wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub project_id: ProjectId,
    pub files: Vec<SnapshotFile>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot with files sorted by path.
    pub fn new(project_id: ProjectId, mut files: Vec<SnapshotFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);
        Self {
            project_id,
            files,
            taken_at: Utc::now(),
        }
    }

    pub fn file_list(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Content digest over paths and contents, independent of `taken_at`.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(file.content.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// What a stage hands back to the controller on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    /// One-line summary shown in `stage-completed`.
    pub summary: String,
    /// Full text produced by the stage (the plan, for Planning).
    pub content: Option<String>,
}

impl StageOutput {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            content: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Succeeded).unwrap(),
            "\"SUCCEEDED\""
        );
        assert_eq!(RunStatus::parse("FAILED"), Some(RunStatus::Failed));
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn stage_order_follows_pipeline() {
        assert_eq!(Stage::Planning.next(), Some(Stage::Building));
        assert_eq!(Stage::Building.next(), Some(Stage::Validating));
        assert_eq!(Stage::Validating.next(), Some(Stage::Checking));
        assert_eq!(Stage::Checking.next(), None);
        assert!(Stage::Planning < Stage::Checking);
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!(ErrorCategory::parse("Runtime"), Some(ErrorCategory::Runtime));
        assert_eq!(ErrorCategory::parse(" import "), Some(ErrorCategory::Import));
        assert_eq!(ErrorCategory::parse("network"), None);
    }

    #[test]
    fn new_run_starts_in_planning() {
        let run = Run::new(ProjectId::from_string("p1"), "create a counter app");
        assert_eq!(run.current_stage, Stage::Planning);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.total_retries, 0);
        assert_eq!(run.retries_for(ErrorCategory::Import), 0);
    }

    #[test]
    fn run_rejects_unknown_fields() {
        let run = Run::new(ProjectId::from_string("p1"), "req");
        let mut value = serde_json::to_value(&run).unwrap();
        assert!(serde_json::from_value::<Run>(value.clone()).is_ok());

        value
            .as_object_mut()
            .unwrap()
            .insert("extra".to_string(), serde_json::json!(1));
        assert!(serde_json::from_value::<Run>(value).is_err());
    }

    #[test]
    fn run_retry_counts_serialize_by_category_name() {
        let mut run = Run::new(ProjectId::from_string("p1"), "req");
        run.retry_counts.insert(ErrorCategory::Import, 2);
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"retry_counts\":{\"import\":2}"));
    }

    #[test]
    fn session_liveness_uses_expiry() {
        let now = Utc::now();
        let session = Session {
            project_id: ProjectId::from_string("p1"),
            handle: SessionHandle("h1".to_string()),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(10),
            preview_endpoint: None,
        };
        assert!(session.is_live_at(now));
        assert!(!session.is_live_at(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn snapshot_sorts_files_and_digest_ignores_timestamp() {
        let files = vec![
            SnapshotFile {
                path: "src/main.jsx".to_string(),
                content: "main".to_string(),
            },
            SnapshotFile {
                path: "package.json".to_string(),
                content: "{}".to_string(),
            },
        ];
        let a = Snapshot::new(ProjectId::from_string("p1"), files.clone());
        let mut b = Snapshot::new(ProjectId::from_string("p1"), files);
        b.taken_at = a.taken_at + chrono::Duration::seconds(5);

        assert_eq!(a.file_list(), vec!["package.json", "src/main.jsx"]);
        assert_eq!(a.digest(), b.digest());

        b.files[0].content = "{\"name\":\"x\"}".to_string();
        assert_ne!(a.digest(), b.digest());
    }
}
