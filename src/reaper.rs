//! Periodic expiration sweep.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::supervisor::{StopOutcome, Supervisor, SupervisorInner};

/// Counts from one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub stopped: usize,
    pub dirs_removed: usize,
}

/// Spawn the reaper loop.
///
/// The loop holds only a weak reference so a dropped supervisor does not
/// keep it alive; it exits on `cancel` or when the supervisor is gone.
pub(crate) fn spawn_reaper(
    supervisor: Weak<SupervisorInner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(supervisor) = Supervisor::upgrade(&supervisor) else {
                break;
            };
            let report = sweep(&supervisor).await;
            if report.expired > 0 {
                tracing::info!(
                    expired = report.expired,
                    stopped = report.stopped,
                    "reaper sweep finished"
                );
            }
        }
        tracing::debug!("reaper exiting");
    })
}

/// Stop every session whose lifetime has elapsed, then sweep empty
/// directories.
///
/// Expired sessions are stopped concurrently. A session that disappears
/// between listing and stopping is not an error.
pub async fn sweep(supervisor: &Supervisor) -> SweepReport {
    let expired = supervisor.registry().expired(Instant::now());
    let mut report = SweepReport {
        expired: expired.len(),
        ..Default::default()
    };

    let outcomes = futures::future::join_all(expired.iter().map(|id| async move {
        tracing::info!(session = %id, "session exceeded its max duration, stopping");
        (id, supervisor.stop(id).await)
    }))
    .await;

    for (id, outcome) in outcomes {
        match outcome {
            StopOutcome::Found => report.stopped += 1,
            StopOutcome::NotFound => {
                tracing::debug!(session = %id, "expired session already gone");
            }
        }
    }

    let registry = supervisor.registry().clone();
    report.dirs_removed = supervisor
        .janitor()
        .sweep(
            |id| registry.contains(id),
            supervisor.config().reaper_interval(),
        )
        .await;
    report
}
