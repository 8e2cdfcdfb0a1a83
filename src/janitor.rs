use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// What `cleanup` did with a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    NotEmpty,
    Missing,
}

/// Removes empty session directories under the HLS root.
///
/// Never deletes a directory that still has entries.
#[derive(Debug, Clone)]
pub struct Janitor {
    root: PathBuf,
}

impl Janitor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Delete `dir` if and only if it is empty.
    pub async fn cleanup(&self, dir: &Path) -> io::Result<CleanupOutcome> {
        match is_empty_dir(dir).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(dir = %dir.display(), "output directory not empty, leaving it");
                return Ok(CleanupOutcome::NotEmpty);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CleanupOutcome::Missing),
            Err(e) => return Err(e),
        }

        // remove_dir refuses non-empty directories, so a file created after
        // the check above is never lost.
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "removed empty output directory");
                Ok(CleanupOutcome::Removed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CleanupOutcome::Missing),
            Err(e) => match is_empty_dir(dir).await {
                Ok(false) => Ok(CleanupOutcome::NotEmpty),
                _ => Err(e),
            },
        }
    }

    /// Remove every empty directory under the root that `is_active` does not
    /// claim and that is older than `min_age`.
    ///
    /// `is_active` is consulted per directory, right before removal. The age
    /// check protects directories created by a start that is still between
    /// reserving its id and launching. Returns the number removed; errors are
    /// logged and skipped.
    pub async fn sweep<F>(&self, is_active: F, min_age: Duration) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), ?e, "janitor sweep could not read root");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(?e, "janitor sweep failed to read directory entry");
                    break;
                }
            };
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_dir() => m,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }
            let name = entry.file_name();
            if is_active(&name.to_string_lossy()) {
                continue;
            }
            match self.cleanup(&entry.path()).await {
                Ok(CleanupOutcome::Removed) => removed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(dir = %entry.path().display(), ?e, "janitor failed to remove directory");
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "janitor removed empty output directories");
        }
        removed
    }
}

async fn is_empty_dir(dir: &Path) -> io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
