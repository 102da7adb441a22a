//! Local execution backend.
//!
//! Each session is a directory under a root. Commands run through `sh -c`
//! inside that directory. A session past its expiry answers every call with
//! `SessionExpired`, the same way a remote sandbox would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use build_core::{Id, SessionHandle, SnapshotFile};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backend::{
    validate_relative_path, BackendError, CommandOutput, ExecutionBackend, Result,
};

#[derive(Debug)]
struct LocalSession {
    dir: PathBuf,
    expires_at: Instant,
}

/// Execution backend backed by local directories.
#[derive(Debug)]
pub struct LocalExecution {
    root: PathBuf,
    templates_dir: Option<PathBuf>,
    sessions: Mutex<HashMap<SessionHandle, LocalSession>>,
}

impl LocalExecution {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            templates_dir: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Seed new sessions from `<templates_dir>/<template>` when it exists.
    pub fn with_templates(mut self, templates_dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = Some(templates_dir.into());
        self
    }

    /// Directory of a live session.
    fn live_dir(&self, handle: &SessionHandle) -> Result<PathBuf> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| BackendError::Unavailable("session table poisoned".to_string()))?;
        match sessions.get(handle) {
            Some(session) if session.expires_at > Instant::now() => Ok(session.dir.clone()),
            _ => Err(BackendError::SessionExpired(handle.to_string())),
        }
    }

    fn resolve(&self, handle: &SessionHandle, path: &str) -> Result<PathBuf> {
        validate_relative_path(path)?;
        Ok(self.live_dir(handle)?.join(path))
    }
}

#[async_trait]
impl ExecutionBackend for LocalExecution {
    async fn create_session(&self, template: &str, ttl: Duration) -> Result<SessionHandle> {
        let handle = SessionHandle(Id::new().to_string());
        let dir = self.root.join(handle.as_ref());
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(templates) = &self.templates_dir {
            let source = templates.join(template);
            if source.is_dir() {
                let target = dir.clone();
                tokio::task::spawn_blocking(move || copy_tree(&source, &target))
                    .await
                    .map_err(|e| BackendError::Unavailable(e.to_string()))??;
            } else {
                warn!(template, "template not found, starting empty session");
            }
        }

        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| BackendError::Unavailable("session table poisoned".to_string()))?;
        sessions.insert(
            handle.clone(),
            LocalSession {
                dir,
                expires_at: Instant::now() + ttl,
            },
        );
        info!(handle = %handle, template, "created local session");
        Ok(handle)
    }

    async fn restore(&self, handle: &SessionHandle, files: &[SnapshotFile]) -> Result<()> {
        for file in files {
            self.write_file(handle, &file.path, &file.content).await?;
        }
        debug!(handle = %handle, count = files.len(), "restored files");
        Ok(())
    }

    async fn run_command(
        &self,
        handle: &SessionHandle,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let dir = self.live_dir(handle)?;
        debug!(handle = %handle, cmd, "running command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(handle = %handle, cmd, "command timed out");
                return Err(BackendError::Timeout(timeout));
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(&self, handle: &SessionHandle, path: &str) -> Result<String> {
        let full = self.resolve(handle, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, handle: &SessionHandle, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(handle, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn list_files(&self, handle: &SessionHandle) -> Result<Vec<String>> {
        let dir = self.live_dir(handle)?;
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut files = Vec::new();
            walk(&dir, &dir, &mut files)?;
            files.sort();
            Ok(files)
        })
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?
    }

    async fn set_timeout(&self, handle: &SessionHandle, ttl: Duration) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| BackendError::Unavailable("session table poisoned".to_string()))?;
        match sessions.get_mut(handle) {
            Some(session) if session.expires_at > Instant::now() => {
                session.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(BackendError::SessionExpired(handle.to_string())),
        }
    }

    async fn destroy(&self, handle: &SessionHandle) -> Result<()> {
        let removed = self
            .sessions
            .lock()
            .map_err(|_| BackendError::Unavailable("session table poisoned".to_string()))?
            .remove(handle);
        if let Some(session) = removed {
            match tokio::fs::remove_dir_all(&session.dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(handle = %handle, "destroyed local session");
        }
        Ok(())
    }

    async fn preview_endpoint(&self, handle: &SessionHandle, port: u16) -> Result<String> {
        self.live_dir(handle)?;
        Ok(format!("http://127.0.0.1:{port}/{handle}/"))
    }
}

/// Collect regular files below `dir` as `/`-separated paths relative to `base`.
fn walk(base: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            walk(base, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                let parts: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                out.push(parts.join("/"));
            }
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest = target.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    fn backend() -> (LocalExecution, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalExecution::new(dir.path().join("sessions")), dir)
    }

    #[tokio::test]
    async fn write_read_and_list_files() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("react-vite", TTL).await.unwrap();

        backend
            .write_file(&handle, "src/App.jsx", "export default 1")
            .await
            .unwrap();
        backend.write_file(&handle, "package.json", "{}").await.unwrap();

        assert_eq!(
            backend.read_file(&handle, "src/App.jsx").await.unwrap(),
            "export default 1"
        );
        assert_eq!(
            backend.list_files(&handle).await.unwrap(),
            vec!["package.json", "src/App.jsx"]
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        let err = backend.read_file(&handle, "src/main.jsx").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(p) if p == "src/main.jsx"));
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        let err = backend
            .write_file(&handle, "../escape.txt", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn runs_commands_in_session_dir() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        backend.write_file(&handle, "hello.txt", "hi").await.unwrap();

        let out = backend
            .run_command(&handle, "cat hello.txt; echo oops >&2; exit 3", TTL)
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn command_timeout_is_reported() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        let err = backend
            .run_command(&handle, "sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    #[tokio::test]
    async fn expired_session_rejects_calls() {
        let (backend, _dir) = backend();
        let handle = backend
            .create_session("t", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            backend.list_files(&handle).await,
            Err(BackendError::SessionExpired(_))
        ));
        assert!(matches!(
            backend.set_timeout(&handle, TTL).await,
            Err(BackendError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn set_timeout_extends_live_session() {
        let (backend, _dir) = backend();
        let handle = backend
            .create_session("t", Duration::from_millis(100))
            .await
            .unwrap();
        backend.set_timeout(&handle, TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.list_files(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn destroy_removes_directory_and_is_idempotent() {
        let (backend, dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        let session_dir = dir.path().join("sessions").join(handle.as_ref());
        assert!(session_dir.is_dir());

        backend.destroy(&handle).await.unwrap();
        assert!(!session_dir.exists());
        backend.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn restore_writes_snapshot_files() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        let files = vec![
            SnapshotFile {
                path: "index.html".to_string(),
                content: "<div id=root>".to_string(),
            },
            SnapshotFile {
                path: "src/main.jsx".to_string(),
                content: "main".to_string(),
            },
        ];
        backend.restore(&handle, &files).await.unwrap();
        assert_eq!(
            backend.list_files(&handle).await.unwrap(),
            vec!["index.html", "src/main.jsx"]
        );
    }

    #[tokio::test]
    async fn template_seeds_new_sessions() {
        let dir = TempDir::new().unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(templates.join("react-vite/src")).unwrap();
        std::fs::write(templates.join("react-vite/package.json"), "{}").unwrap();
        std::fs::write(templates.join("react-vite/src/main.jsx"), "main").unwrap();

        let backend = LocalExecution::new(dir.path().join("sessions")).with_templates(&templates);
        let handle = backend.create_session("react-vite", TTL).await.unwrap();
        assert_eq!(
            backend.list_files(&handle).await.unwrap(),
            vec!["package.json", "src/main.jsx"]
        );
    }

    #[tokio::test]
    async fn preview_endpoint_names_port_and_handle() {
        let (backend, _dir) = backend();
        let handle = backend.create_session("t", TTL).await.unwrap();
        let url = backend.preview_endpoint(&handle, 5173).await.unwrap();
        assert_eq!(url, format!("http://127.0.0.1:5173/{handle}/"));
    }
}
