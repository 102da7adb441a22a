//! File listing filters and snapshot capture/restore.

use std::io::{Cursor, Write};
use std::time::Duration;

use build_core::{Config, ProjectId, SessionHandle, Snapshot, SnapshotFile};
use tracing::{debug, warn};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::backend::{BackendError, ExecutionBackend};

/// Which session files are listed and which are captured in snapshots.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub excluded_dirs: Vec<String>,
    pub excluded_files: Vec<String>,
    /// Path prefixes (files or directories) captured in a snapshot.
    pub snapshot_paths: Vec<String>,
}

impl FileFilter {
    pub fn from_config(config: &Config) -> Self {
        Self {
            excluded_dirs: config.excluded_dirs.clone(),
            excluded_files: config.excluded_files.clone(),
            snapshot_paths: config.snapshot_paths.clone(),
        }
    }

    /// Whether a path shows up in file listings.
    pub fn is_listed(&self, path: &str) -> bool {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some(name) = parts.pop() else {
            return false;
        };
        if self.excluded_files.iter().any(|f| f == name) {
            return false;
        }
        !parts
            .iter()
            .any(|dir| self.excluded_dirs.iter().any(|d| d == dir))
    }

    /// Whether a path belongs in a snapshot.
    pub fn in_snapshot(&self, path: &str) -> bool {
        self.is_listed(path)
            && self.snapshot_paths.iter().any(|prefix| {
                let prefix = prefix.trim_end_matches('/');
                path == prefix
                    || path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    /// Filter and sort a raw listing.
    pub fn listing(&self, paths: Vec<String>) -> Vec<String> {
        let mut listed: Vec<String> = paths.into_iter().filter(|p| self.is_listed(p)).collect();
        listed.sort();
        listed
    }
}

/// Read every in-scope file out of a session.
pub async fn capture_snapshot(
    backend: &dyn ExecutionBackend,
    handle: &SessionHandle,
    project_id: &ProjectId,
    filter: &FileFilter,
) -> Result<Snapshot, BackendError> {
    let paths = backend.list_files(handle).await?;
    let mut files = Vec::new();
    for path in paths.into_iter().filter(|p| filter.in_snapshot(p)) {
        match backend.read_file(handle, &path).await {
            Ok(content) => files.push(SnapshotFile { path, content }),
            // Deleted between listing and reading.
            Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    debug!(project_id = %project_id, count = files.len(), "captured snapshot");
    Ok(Snapshot::new(project_id.clone(), files))
}

/// Read every listed file out of a session, sorted by path.
pub async fn read_listed_files(
    backend: &dyn ExecutionBackend,
    handle: &SessionHandle,
    filter: &FileFilter,
) -> Result<Vec<SnapshotFile>, BackendError> {
    let paths = filter.listing(backend.list_files(handle).await?);
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        match backend.read_file(handle, &path).await {
            Ok(content) => files.push(SnapshotFile { path, content }),
            Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(files)
}

/// Pack files into an in-memory ZIP archive.
pub fn zip_files(files: &[SnapshotFile]) -> zip::result::ZipResult<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for file in files {
        zip.start_file(file.path.as_str(), options)?;
        zip.write_all(file.content.as_bytes())?;
    }
    Ok(zip.finish()?.into_inner())
}

/// Write a snapshot into a session, then run the post-restore commands.
///
/// Post-restore command failures are logged, not returned.
pub async fn restore_snapshot(
    backend: &dyn ExecutionBackend,
    handle: &SessionHandle,
    snapshot: &Snapshot,
    post_restore_cmds: &[String],
    cmd_timeout: Duration,
) -> Result<(), BackendError> {
    backend.restore(handle, &snapshot.files).await?;
    for cmd in post_restore_cmds {
        match backend.run_command(handle, cmd, cmd_timeout).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                warn!(handle = %handle, cmd = %cmd, exit_code = out.exit_code, "post-restore command failed");
            }
            Err(BackendError::SessionExpired(h)) => return Err(BackendError::SessionExpired(h)),
            Err(e) => warn!(handle = %handle, cmd = %cmd, error = %e, "post-restore command errored"),
        }
    }
    Ok(())
}
