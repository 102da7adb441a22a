//! Session registry.
//!
//! Process-wide map from project to its live execution session. Each project
//! has its own async lock, so acquire/extend/release for one project are
//! serialized while other projects proceed independently. Nothing outside the
//! registry holds a session it can mutate; callers receive clones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use build_core::{Config, ProjectId, Session, SessionHandle};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ExecutionBackend};
use crate::files::restore_snapshot;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("no session for project {0}")]
    NoSession(ProjectId),
    #[error("session expired for project {0}")]
    Expired(ProjectId),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub template: String,
    pub ttl: Duration,
    /// Bound on create/restore and on every backend call the registry makes.
    pub op_timeout: Duration,
    pub preview_port: u16,
    pub post_restore_cmds: Vec<String>,
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            template: config.session_template.clone(),
            ttl: Duration::from_secs(config.session_ttl_sec),
            op_timeout: Duration::from_secs(config.session_timeout_sec),
            preview_port: config.preview_port,
            post_restore_cmds: config.post_restore_cmds.clone(),
        }
    }
}

type Slot = Arc<AsyncMutex<Option<Session>>>;

pub struct SessionRegistry {
    backend: Arc<dyn ExecutionBackend>,
    storage: Arc<Storage>,
    config: RegistryConfig,
    slots: Mutex<HashMap<ProjectId, Slot>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        storage: Arc<Storage>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            backend,
            storage,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    fn slot(&self, project_id: &ProjectId) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(project_id.clone()).or_default())
    }

    fn existing_slot(&self, project_id: &ProjectId) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .map(Arc::clone)
    }

    /// Return the project's live session, provisioning one if needed.
    ///
    /// A fresh session is restored from the latest snapshot before it is
    /// returned. Any provisioning failure is `SessionUnavailable`.
    pub async fn acquire(&self, project_id: &ProjectId) -> Result<Session> {
        let slot = self.slot(project_id);
        let mut current = slot.lock().await;

        if let Some(session) = current.as_ref() {
            if session.is_live() {
                return Ok(session.clone());
            }
        }
        if let Some(stale) = current.take() {
            debug!(project_id = %project_id, handle = %stale.handle, "replacing expired session");
            self.destroy_quietly(&stale.handle).await;
        }

        let session = match self.provision(project_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "failed to provision session");
                return Err(match e {
                    RegistryError::SessionUnavailable(detail) => {
                        RegistryError::SessionUnavailable(detail)
                    }
                    other => RegistryError::SessionUnavailable(other.to_string()),
                });
            }
        };

        info!(project_id = %project_id, handle = %session.handle, "session acquired");
        *current = Some(session.clone());
        Ok(session)
    }

    /// Create a session, restore it and look up its preview endpoint.
    ///
    /// Each step has its own deadline. Once the backend has handed out a
    /// handle, any failure or timeout destroys it before returning.
    async fn provision(&self, project_id: &ProjectId) -> Result<Session> {
        let timeout = self.config.op_timeout;
        let handle = tokio::time::timeout(
            timeout,
            self.backend.create_session(&self.config.template, self.config.ttl),
        )
        .await
        .map_err(|_| {
            RegistryError::SessionUnavailable(format!("session creation timed out after {timeout:?}"))
        })??;

        let restored = tokio::time::timeout(timeout, self.restore_latest(project_id, &handle))
            .await
            .unwrap_or_else(|_| {
                Err(RegistryError::SessionUnavailable(format!(
                    "restore timed out after {timeout:?}"
                )))
            });
        if let Err(e) = restored {
            self.destroy_quietly(&handle).await;
            return Err(e);
        }

        let preview_endpoint = match tokio::time::timeout(
            timeout,
            self.backend.preview_endpoint(&handle, self.config.preview_port),
        )
        .await
        {
            Ok(Ok(url)) => Some(url),
            Ok(Err(e)) => {
                warn!(project_id = %project_id, error = %e, "no preview endpoint");
                None
            }
            Err(_) => {
                warn!(project_id = %project_id, "preview endpoint lookup timed out");
                None
            }
        };

        let created_at = Utc::now();
        Ok(Session {
            project_id: project_id.clone(),
            handle,
            created_at,
            expires_at: expiry_after(created_at, self.config.ttl),
            preview_endpoint,
        })
    }

    async fn restore_latest(&self, project_id: &ProjectId, handle: &SessionHandle) -> Result<()> {
        let Some(snapshot) = self.storage.latest_snapshot(project_id).await? else {
            return Ok(());
        };
        info!(
            project_id = %project_id,
            files = snapshot.files.len(),
            "restoring session from snapshot"
        );
        restore_snapshot(
            self.backend.as_ref(),
            handle,
            &snapshot,
            &self.config.post_restore_cmds,
            self.config.op_timeout,
        )
        .await?;
        Ok(())
    }

    /// Push the session's expiry out by the configured TTL.
    ///
    /// An expired session is dropped from the registry and reported as `Expired`.
    pub async fn extend(&self, project_id: &ProjectId) -> Result<Session> {
        let slot = self.slot(project_id);
        let mut current = slot.lock().await;
        let Some(session) = current.as_mut() else {
            return Err(RegistryError::NoSession(project_id.clone()));
        };

        let outcome = tokio::time::timeout(
            self.config.op_timeout,
            self.backend.set_timeout(&session.handle, self.config.ttl),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout(self.config.op_timeout)));

        match outcome {
            Ok(()) => {
                session.expires_at = expiry_after(Utc::now(), self.config.ttl);
                Ok(session.clone())
            }
            Err(BackendError::SessionExpired(_)) => {
                if let Some(stale) = current.take() {
                    warn!(project_id = %project_id, handle = %stale.handle, "session expired");
                    self.destroy_quietly(&stale.handle).await;
                }
                Err(RegistryError::Expired(project_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tear down the project's session. No-op when there is none.
    pub async fn release(&self, project_id: &ProjectId) {
        let Some(slot) = self.existing_slot(project_id) else {
            return;
        };
        let taken = slot.lock().await.take();
        if let Some(session) = taken {
            info!(project_id = %project_id, handle = %session.handle, "session released");
            self.destroy_quietly(&session.handle).await;
        }
    }

    /// Forget a session the backend reported as expired.
    ///
    /// Only clears the slot if it still holds `handle`; a newer session is kept.
    pub async fn invalidate(&self, project_id: &ProjectId, handle: &SessionHandle) {
        let Some(slot) = self.existing_slot(project_id) else {
            return;
        };
        let mut current = slot.lock().await;
        if current.as_ref().is_some_and(|s| &s.handle == handle) {
            current.take();
            warn!(project_id = %project_id, handle = %handle, "session invalidated");
            self.destroy_quietly(handle).await;
        }
    }

    /// The project's session if one is registered and not past its expiry.
    pub async fn peek(&self, project_id: &ProjectId) -> Option<Session> {
        let slot = self.existing_slot(project_id)?;
        let current = slot.lock().await;
        current.as_ref().filter(|s| s.is_live()).cloned()
    }

    async fn destroy_quietly(&self, handle: &SessionHandle) {
        let outcome =
            tokio::time::timeout(self.config.op_timeout, self.backend.destroy(handle)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(handle = %handle, error = %e, "failed to destroy session"),
            Err(_) => warn!(handle = %handle, "destroy timed out"),
        }
    }
}

fn expiry_after(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecution;
    use build_core::{Snapshot, SnapshotFile};
    use tempfile::TempDir;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        backend: Arc<FakeExecution>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        fixture_with(RegistryConfig::from_config(&Config::default())).await
    }

    async fn fixture_with(config: RegistryConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let backend = Arc::new(FakeExecution::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&backend) as Arc<dyn ExecutionBackend>,
            Arc::clone(&storage),
            config,
        ));
        Fixture {
            registry,
            backend,
            storage,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn acquire_twice_returns_same_handle() {
        let f = fixture().await;
        let project = ProjectId::from_string("p1");

        let first = f.registry.acquire(&project).await.unwrap();
        let second = f.registry.acquire(&project).await.unwrap();

        assert_eq!(first.handle, second.handle);
        assert_eq!(f.backend.sessions_created(), 1);
        assert!(first.expires_at > Utc::now());
        assert!(first.preview_endpoint.is_some());
    }

    #[tokio::test]
    async fn concurrent_acquire_creates_one_session() {
        let f = fixture().await;
        f.backend.set_create_delay(Duration::from_millis(50));
        let project = ProjectId::from_string("p1");

        let (a, b) = tokio::join!(f.registry.acquire(&project), f.registry.acquire(&project));

        assert_eq!(a.unwrap().handle, b.unwrap().handle);
        assert_eq!(f.backend.sessions_created(), 1);
    }

    #[tokio::test]
    async fn projects_get_separate_sessions() {
        let f = fixture().await;
        let a = f.registry.acquire(&ProjectId::from_string("a")).await.unwrap();
        let b = f.registry.acquire(&ProjectId::from_string("b")).await.unwrap();
        assert_ne!(a.handle, b.handle);
    }

    #[tokio::test]
    async fn provisioning_failure_is_session_unavailable() {
        let f = fixture().await;
        f.backend.fail_creates(true);

        let err = f
            .registry
            .acquire(&ProjectId::from_string("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::SessionUnavailable(_)));
        assert!(f.registry.peek(&ProjectId::from_string("p1")).await.is_none());
    }

    #[tokio::test]
    async fn expired_session_is_recreated_from_snapshot() {
        let f = fixture().await;
        let project = ProjectId::from_string("p1");
        f.storage
            .save_snapshot(&Snapshot::new(
                project.clone(),
                vec![SnapshotFile {
                    path: "src/App.jsx".to_string(),
                    content: "export default 1".to_string(),
                }],
            ))
            .await
            .unwrap();

        let first = f.registry.acquire(&project).await.unwrap();
        f.backend.expire_all();

        let err = f.registry.extend(&project).await.unwrap_err();
        assert!(matches!(err, RegistryError::Expired(_)));

        let second = f.registry.acquire(&project).await.unwrap();
        assert_ne!(first.handle, second.handle);
        assert_eq!(
            f.backend.files(&second.handle).get("src/App.jsx").map(String::as_str),
            Some("export default 1")
        );
        assert!(f
            .backend
            .commands_run()
            .contains(&"rm -rf node_modules/.vite-temp".to_string()));
    }

    #[tokio::test]
    async fn hung_restore_destroys_the_new_session() {
        let config = RegistryConfig {
            op_timeout: Duration::from_millis(200),
            post_restore_cmds: vec!["npm install".to_string()],
            ..RegistryConfig::from_config(&Config::default())
        };
        let f = fixture_with(config).await;
        let project = ProjectId::from_string("p1");
        f.storage
            .save_snapshot(&Snapshot::new(
                project.clone(),
                vec![SnapshotFile {
                    path: "package.json".to_string(),
                    content: "{}".to_string(),
                }],
            ))
            .await
            .unwrap();
        f.backend.hang_command("npm install");

        for _ in 0..2 {
            let err = f.registry.acquire(&project).await.unwrap_err();
            assert!(matches!(err, RegistryError::SessionUnavailable(ref d) if d.contains("restore timed out")));
        }

        assert_eq!(f.backend.sessions_created(), 2);
        assert_eq!(f.backend.sessions_destroyed(), 2);
        assert_eq!(f.backend.live_sessions(), 0);
        assert!(f.registry.peek(&project).await.is_none());
    }

    #[tokio::test]
    async fn extend_moves_expiry_forward() {
        let f = fixture().await;
        let project = ProjectId::from_string("p1");
        let session = f.registry.acquire(&project).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let extended = f.registry.extend(&project).await.unwrap();

        assert_eq!(extended.handle, session.handle);
        assert!(extended.expires_at > session.expires_at);
    }

    #[tokio::test]
    async fn extend_without_session_fails() {
        let f = fixture().await;
        let err = f
            .registry
            .extend(&ProjectId::from_string("nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoSession(_)));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let f = fixture().await;
        let project = ProjectId::from_string("p1");
        f.registry.acquire(&project).await.unwrap();

        f.registry.release(&project).await;
        f.registry.release(&project).await;
        f.registry.release(&ProjectId::from_string("never")).await;

        assert_eq!(f.backend.sessions_destroyed(), 1);
        assert!(f.registry.peek(&project).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_ignores_other_handles() {
        let f = fixture().await;
        let project = ProjectId::from_string("p1");
        let session = f.registry.acquire(&project).await.unwrap();

        f.registry
            .invalidate(&project, &SessionHandle("someone-else".to_string()))
            .await;
        assert!(f.registry.peek(&project).await.is_some());

        f.registry.invalidate(&project, &session.handle).await;
        assert!(f.registry.peek(&project).await.is_none());
    }
}
