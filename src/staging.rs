//! Scratch directories and plain file operations used by a pipeline run.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CopyError, StagingError};

/// Name prefix shared by every staging directory.
pub const STAGING_PREFIX: &str = ".data-";

const DELETE_ATTEMPTS: u32 = 5;
const DELETE_BACKOFF: Duration = Duration::from_millis(200);

/// A uniquely named working directory owned by a single pipeline run.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    /// Creates a fresh `.data-{uuid}` directory inside `work_dir`.
    ///
    /// With `cleanup_old`, leftover staging directories from earlier runs are
    /// removed first. Failing to remove one is logged and otherwise ignored.
    pub async fn prepare(work_dir: &Path, cleanup_old: bool) -> Result<Self, StagingError> {
        if cleanup_old {
            sweep_stale(work_dir).await;
        }

        let path = work_dir.join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| StagingError::Create {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Staging area created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the directory and everything in it. Failures are logged only.
    pub async fn dispose(self) {
        match delete_recursive(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Staging area removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staging area"),
        }
    }
}

/// Returns true if `name` looks like a staging directory name.
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

async fn sweep_stale(work_dir: &Path) {
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %work_dir.display(), error = %e, "Failed to list work directory for cleanup");
            return;
        }
    };

    let mut removed = 0usize;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %work_dir.display(), error = %e, "Failed to read work directory entry");
                break;
            }
        };

        let name = entry.file_name();
        if !is_staging_name(&name.to_string_lossy()) {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }

        let path = entry.path();
        match delete_recursive(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to clean up old staging area"),
        }
    }

    if removed > 0 {
        info!(removed, "Cleaned up old staging areas");
    }
}

/// Creates `path` and any missing parents. Does nothing if it already exists.
pub async fn create_directory(path: &Path) -> Result<(), StagingError> {
    if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }

    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| StagingError::Create {
            path: path.to_path_buf(),
            source,
        })
}

/// Removes a file or directory tree. Missing paths are not an error.
///
/// Transient failures are retried a few times before giving up.
pub async fn delete_recursive(path: &Path) -> Result<(), StagingError> {
    let mut attempt = 1;
    loop {
        match remove_path(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) if attempt >= DELETE_ATTEMPTS => {
                return Err(StagingError::Delete {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "Delete failed, retrying");
                tokio::time::sleep(DELETE_BACKOFF).await;
                attempt += 1;
            }
        }
    }
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// Copies a single file. The destination's parent directory must exist.
pub async fn copy_file(from: &Path, to: &Path) -> Result<(), CopyError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|source| CopyError {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn staging_dirs(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_staging_name(&p.file_name().unwrap().to_string_lossy()))
            .collect()
    }

    #[tokio::test]
    async fn test_prepare_creates_unique_empty_dir() {
        let work = tempfile::tempdir().unwrap();

        let a = StagingArea::prepare(work.path(), false).await.unwrap();
        let b = StagingArea::prepare(work.path(), false).await.unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert_eq!(fs::read_dir(a.path()).unwrap().count(), 0);
        assert_eq!(staging_dirs(work.path()).len(), 2);
    }

    #[tokio::test]
    async fn test_prepare_sweeps_stale_dirs_only() {
        let work = tempfile::tempdir().unwrap();
        let stale = work.path().join(".data-old");
        fs::create_dir_all(stale.join("nested")).unwrap();
        fs::write(stale.join("nested/gtfs.zip"), b"junk").unwrap();
        fs::create_dir(work.path().join("keep-me")).unwrap();
        fs::write(work.path().join(".data-file"), b"not a dir").unwrap();

        let area = StagingArea::prepare(work.path(), true).await.unwrap();

        assert!(!stale.exists());
        assert!(work.path().join("keep-me").exists());
        assert!(work.path().join(".data-file").exists());
        assert_eq!(staging_dirs(work.path()), vec![area.path().to_path_buf()]);
    }

    #[tokio::test]
    async fn test_prepare_without_cleanup_keeps_stale_dirs() {
        let work = tempfile::tempdir().unwrap();
        let stale = work.path().join(".data-old");
        fs::create_dir(&stale).unwrap();

        let _area = StagingArea::prepare(work.path(), false).await.unwrap();

        assert!(stale.exists());
    }

    #[tokio::test]
    async fn test_prepare_fails_when_work_dir_is_a_file() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let err = StagingArea::prepare(&file, true).await.unwrap_err();
        assert!(matches!(err, StagingError::Create { .. }));
    }

    #[tokio::test]
    async fn test_dispose_removes_tree() {
        let work = tempfile::tempdir().unwrap();
        let area = StagingArea::prepare(work.path(), false).await.unwrap();
        fs::create_dir(area.path().join("out")).unwrap();
        fs::write(area.path().join("out/a.txt"), b"a").unwrap();
        let path = area.path().to_path_buf();

        area.dispose().await;

        assert!(!path.exists());
    }

    /// Makes `dir` read-only so its entries can't be removed. Returns false
    /// when permissions aren't enforced (e.g. running as root).
    #[cfg(unix)]
    fn lock_dir(dir: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::write(dir.join(".write-check"), b"").is_ok() {
            unlock_dir(dir);
            return false;
        }
        true
    }

    #[cfg(unix)]
    fn unlock_dir(dir: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_continues_when_stale_dir_cannot_be_removed() {
        let work = tempfile::tempdir().unwrap();
        let stale = work.path().join(".data-stuck");
        fs::create_dir(&stale).unwrap();
        fs::write(stale.join("gtfs.zip"), b"junk").unwrap();
        if !lock_dir(&stale) {
            return;
        }

        let area = StagingArea::prepare(work.path(), true).await;
        unlock_dir(&stale);

        let area = area.unwrap();
        assert!(area.path().is_dir());
        assert!(stale.join("gtfs.zip").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_recursive_gives_up_after_retries() {
        let work = tempfile::tempdir().unwrap();
        let locked = work.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("stops.txt"), b"stop_id\n").unwrap();
        if !lock_dir(&locked) {
            return;
        }

        let started = std::time::Instant::now();
        let result = delete_recursive(&locked).await;
        let elapsed = started.elapsed();
        unlock_dir(&locked);

        match result.unwrap_err() {
            StagingError::Delete { path, attempts, .. } => {
                assert_eq!(path, locked);
                assert_eq!(attempts, DELETE_ATTEMPTS);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(elapsed >= DELETE_BACKOFF * (DELETE_ATTEMPTS - 1));
    }

    #[tokio::test]
    async fn test_create_directory_is_idempotent() {
        let work = tempfile::tempdir().unwrap();
        let dir = work.path().join("a/b/c");

        create_directory(&dir).await.unwrap();
        fs::write(dir.join("f"), b"1").unwrap();
        create_directory(&dir).await.unwrap();

        assert!(dir.join("f").exists());
    }

    #[tokio::test]
    async fn test_delete_recursive_missing_path_is_ok() {
        let work = tempfile::tempdir().unwrap();
        delete_recursive(&work.path().join("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_recursive_removes_file() {
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("gtfs.zip");
        fs::write(&file, b"zip").unwrap();

        delete_recursive(&file).await.unwrap();

        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_copy_file_missing_source() {
        let work = tempfile::tempdir().unwrap();
        let from = work.path().join("calendar.txt");
        let to = work.path().join("regional-calendar.txt");

        let err = copy_file(&from, &to).await.unwrap_err();

        assert_eq!(err.from, from);
        assert_eq!(err.to, to);
        assert!(!to.exists());
    }

    #[tokio::test]
    async fn test_copy_file_does_not_create_parents() {
        let work = tempfile::tempdir().unwrap();
        let from = work.path().join("stops.txt");
        fs::write(&from, b"stop_id\n").unwrap();

        let result = copy_file(&from, &work.path().join("missing/stops.txt")).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_copy_file_copies_bytes() {
        let work = tempfile::tempdir().unwrap();
        let from = work.path().join("stops.txt");
        let to = work.path().join("regional-stops.txt");
        fs::write(&from, b"stop_id,stop_name\n1,Central\n").unwrap();

        copy_file(&from, &to).await.unwrap();

        assert_eq!(fs::read(&to).unwrap(), fs::read(&from).unwrap());
    }
}
