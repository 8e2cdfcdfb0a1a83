use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::process::SEGMENT_EXTENSION;
use crate::session::SessionDescriptor;

/// Point-in-time view of the supervisor.
///
/// Not cached; may be slightly stale relative to concurrent starts and stops.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub active_count: usize,
    pub total_segment_files: usize,
    pub hls_root: PathBuf,
    pub streams: Vec<SessionDescriptor>,
}

/// Count segment files across every directory directly under `root`.
///
/// Directories that vanish mid-scan are skipped; only an unreadable root is
/// an error.
pub async fn count_segment_files(root: &Path) -> io::Result<usize> {
    let mut total = 0;
    let mut dirs = tokio::fs::read_dir(root).await?;
    while let Some(entry) = dirs.next_entry().await? {
        match entry.file_type().await {
            Ok(ft) if ft.is_dir() => {}
            _ => continue,
        }
        let mut files = match tokio::fs::read_dir(entry.path()).await {
            Ok(files) => files,
            Err(e) => {
                tracing::debug!(dir = %entry.path().display(), ?e, "skipping unreadable session directory");
                continue;
            }
        };
        while let Ok(Some(file)) = files.next_entry().await {
            if is_segment(&file.path()) {
                total += 1;
            }
        }
    }
    Ok(total)
}

fn is_segment(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION)
}
