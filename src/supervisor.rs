use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{ConfigError, SupervisorConfig};
use crate::janitor::Janitor;
use crate::monitor::spawn_monitor;
use crate::process::{LaunchError, Launcher, SessionHandle};
use crate::reaper;
use crate::session::{
    Attach, RegistryError, Reservation, ReserveRequest, SessionDescriptor, SessionEvent,
    SessionRegistry, StopTicket,
};
use crate::source::redact_credentials;
use crate::stats::{self, StatsSnapshot};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("max duration must be positive")]
    InvalidDuration,

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Parameters for [`Supervisor::start`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source_uri: String,
    pub max_duration_secs: u64,
    /// Explicit session id. Starting an id that is already live is a no-op.
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Created(SessionDescriptor),
    AlreadyExists(SessionDescriptor),
}

impl StartOutcome {
    pub fn descriptor(&self) -> &SessionDescriptor {
        match self {
            StartOutcome::Created(d) | StartOutcome::AlreadyExists(d) => d,
        }
    }

    pub fn into_descriptor(self) -> SessionDescriptor {
        match self {
            StartOutcome::Created(d) | StartOutcome::AlreadyExists(d) => d,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, StartOutcome::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Found,
    NotFound,
}

impl StopOutcome {
    pub fn is_found(self) -> bool {
        self == StopOutcome::Found
    }
}

pub(crate) struct SupervisorInner {
    config: SupervisorConfig,
    registry: SessionRegistry,
    launcher: Launcher,
    janitor: Janitor,
    monitors: TaskTracker,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every live transcoding session.
///
/// Construct with [`Supervisor::new`], share by cloning, and call
/// [`Supervisor::shutdown`] before exit so no transcoder outlives the process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Validate `config`, ensure the HLS root exists and start the reaper.
    pub async fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.hls_root)
            .await
            .map_err(|source| SupervisorError::Io {
                action: "failed to create HLS root",
                path: config.hls_root.clone(),
                source,
            })?;

        let supervisor = Supervisor {
            inner: Arc::new(SupervisorInner {
                registry: SessionRegistry::with_max_sessions(config.max_sessions),
                launcher: Launcher::from_config(&config),
                janitor: Janitor::new(config.hls_root.clone()),
                monitors: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
                config,
            }),
        };

        let handle = reaper::spawn_reaper(
            supervisor.downgrade(),
            supervisor.inner.config.reaper_interval(),
            supervisor.inner.shutdown.clone(),
        );
        *supervisor.inner.reaper.lock() = Some(handle);

        tracing::info!(
            root = %supervisor.inner.config.hls_root.display(),
            ffmpeg = %supervisor.inner.config.ffmpeg_path.display(),
            "session supervisor started"
        );
        Ok(supervisor)
    }

    pub(crate) fn downgrade(&self) -> Weak<SupervisorInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<SupervisorInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Supervisor { inner })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn janitor(&self) -> &Janitor {
        &self.inner.janitor
    }

    pub fn launcher(&self) -> &Launcher {
        &self.inner.launcher
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.inner.registry.subscribe_events()
    }

    /// Start a transcoding session, or return the live one holding `req.id`.
    ///
    /// Launch failures are returned to the caller and never retried.
    pub async fn start(&self, req: StartRequest) -> Result<StartOutcome, SupervisorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        if req.max_duration_secs == 0 {
            return Err(SupervisorError::InvalidDuration);
        }

        let reservation = self.inner.registry.reserve(ReserveRequest {
            id: req.id,
            source_uri: &req.source_uri,
            max_duration: Duration::from_secs(req.max_duration_secs),
            root: &self.inner.config.hls_root,
        })?;
        let reserved = match reservation {
            Reservation::AlreadyExists(existing) => {
                tracing::info!(session = %existing.id, "session already active, reusing it");
                return Ok(StartOutcome::AlreadyExists(existing));
            }
            Reservation::Created(reserved) => reserved,
        };
        let id = reserved.id.clone();

        // Shutdown snapshots the registry after cancelling; a reservation that
        // missed the snapshot must see the cancellation here.
        if self.inner.shutdown.is_cancelled() {
            self.inner.registry.release(&id);
            return Err(SupervisorError::ShuttingDown);
        }

        if let Err(source) = tokio::fs::create_dir_all(&reserved.output_dir).await {
            self.inner.registry.release(&id);
            return Err(SupervisorError::Io {
                action: "failed to create output directory",
                path: reserved.output_dir,
                source,
            });
        }

        let (handle, waiter) = match self.inner.launcher.launch(
            &id,
            &req.source_uri,
            &reserved.output_dir,
            req.max_duration_secs,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(session = %id, error = %e, "failed to launch transcoder");
                if let Some(dir) = self.inner.registry.release(&id) {
                    if let Err(e) = self.inner.janitor.cleanup(&dir).await {
                        tracing::warn!(session = %id, ?e, "failed to clean up output directory");
                    }
                }
                return Err(e.into());
            }
        };

        let attached = self.inner.registry.attach(&id, handle.clone());
        spawn_monitor(
            &self.inner.monitors,
            self.inner.registry.clone(),
            self.inner.janitor.clone(),
            id.clone(),
            handle.clone(),
            waiter,
        );

        match attached {
            Attach::Running(descriptor) => {
                tracing::info!(
                    session = %id,
                    pid = ?descriptor.pid,
                    source = %redact_credentials(&descriptor.source_uri),
                    "session started"
                );
                Ok(StartOutcome::Created(descriptor))
            }
            Attach::StopPending(descriptor) => {
                tracing::info!(session = %id, "session stopped while starting, terminating");
                let this = self.clone();
                let id = id.clone();
                self.inner.monitors.spawn(async move {
                    this.terminate(&id, &handle).await;
                });
                Ok(StartOutcome::Created(descriptor))
            }
            Attach::Missing => {
                // Only this start path or the monitor removes a reservation
                // before attach, so this means the registry lost it.
                tracing::error!(session = %id, "reservation vanished before attach, stopping transcoder");
                handle.kill();
                let mut descriptor = reserved;
                descriptor.pid = handle.pid();
                Ok(StartOutcome::Created(descriptor))
            }
        }
    }

    /// Stop a session and wait until its monitor has deregistered it.
    ///
    /// Unknown ids return [`StopOutcome::NotFound`]. Concurrent stops for one
    /// session share a single SIGTERM/SIGKILL sequence.
    pub async fn stop(&self, id: &str) -> StopOutcome {
        let finished = match self.inner.registry.begin_stop(id) {
            StopTicket::NotFound => {
                tracing::debug!(session = %id, "stop requested for unknown session");
                return StopOutcome::NotFound;
            }
            StopTicket::Drive { handle, finished } => {
                self.terminate(id, &handle).await;
                finished
            }
            StopTicket::Join { finished } => finished,
        };

        let grace = self.inner.config.grace_period();
        if tokio::time::timeout(grace, finished.cancelled()).await.is_err() {
            tracing::warn!(session = %id, "session not deregistered within grace period after stop");
        }
        StopOutcome::Found
    }

    /// SIGTERM, bounded wait, then SIGKILL.
    async fn terminate(&self, id: &str, handle: &SessionHandle) {
        if handle.request_stop() {
            tracing::info!(session = %id, pid = ?handle.pid(), "sent SIGTERM to transcoder");
        }
        let grace = self.inner.config.grace_period();
        if tokio::time::timeout(grace, handle.exited()).await.is_err() {
            tracing::warn!(
                session = %id,
                pid = ?handle.pid(),
                grace_secs = grace.as_secs(),
                "transcoder ignored SIGTERM, killing"
            );
            handle.kill();
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionDescriptor> {
        self.inner.registry.get(id)
    }

    pub fn list(&self) -> Vec<SessionDescriptor> {
        self.inner.registry.list()
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, SupervisorError> {
        let streams = self.inner.registry.list();
        let root = &self.inner.config.hls_root;
        let total_segment_files =
            stats::count_segment_files(root)
                .await
                .map_err(|source| SupervisorError::Io {
                    action: "failed to scan HLS root",
                    path: root.clone(),
                    source,
                })?;
        Ok(StatsSnapshot {
            active_count: streams.len(),
            total_segment_files,
            hls_root: root.clone(),
            streams,
        })
    }

    /// Cancel the reaper, stop every session and wait for all monitors.
    ///
    /// New starts are refused from the moment this is called.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                tracing::warn!(?e, "reaper task panicked");
            }
        }

        let ids = self.inner.registry.ids();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "stopping sessions for shutdown");
        }
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;

        self.inner.monitors.close();
        self.inner.monitors.wait().await;
        tracing::info!("session supervisor stopped");
    }
}
