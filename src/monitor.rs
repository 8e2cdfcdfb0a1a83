//! Per-session exit watcher.
//!
//! The monitor owns the session's [`ProcessWaiter`], so it is the only task
//! that can observe the exit, and the only one that deregisters the session.

use tokio_util::task::TaskTracker;

use crate::janitor::{CleanupOutcome, Janitor};
use crate::process::{ProcessExit, ProcessWaiter, SessionHandle};
use crate::session::{SessionRegistry, SessionState};

/// Spawn the monitor for a freshly launched session on `tracker`.
pub(crate) fn spawn_monitor(
    tracker: &TaskTracker,
    registry: SessionRegistry,
    janitor: Janitor,
    id: String,
    handle: SessionHandle,
    waiter: ProcessWaiter,
) {
    tracker.spawn(async move {
        let result = waiter.wait().await;
        let (state, exit_code) = classify(&handle, &result);

        match &result {
            Ok(exit) if state == SessionState::Failed => {
                tracing::warn!(session = %id, status = ?exit.status, "transcoder exited unexpectedly");
                for line in &exit.stderr_tail {
                    tracing::warn!(session = %id, "ffmpeg: {}", line);
                }
            }
            Ok(exit) => {
                tracing::info!(session = %id, status = ?exit.status, "transcoder exited");
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "lost track of transcoder exit");
            }
        }

        let Some((descriptor, finished)) = registry.finish(&id, state, exit_code) else {
            tracing::warn!(session = %id, "session already deregistered when transcoder exited");
            return;
        };

        match janitor.cleanup(&descriptor.output_dir).await {
            Ok(CleanupOutcome::NotEmpty) => {
                tracing::debug!(session = %id, "output directory kept, segments remain");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session = %id, ?e, "failed to clean up output directory");
            }
        }

        finished.cancel();
    });
}

/// `Stopped` if termination was requested or the transcoder finished cleanly
/// (its `-t` lifetime ran out); `Failed` otherwise.
fn classify(
    handle: &SessionHandle,
    result: &Result<ProcessExit, crate::process::MonitorError>,
) -> (SessionState, Option<i32>) {
    match result {
        Ok(exit) => {
            let code = exit.status.code();
            if handle.stop_requested() || exit.status.success() {
                (SessionState::Stopped, code)
            } else {
                (SessionState::Failed, code)
            }
        }
        Err(_) => (SessionState::Failed, None),
    }
}
