use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::process::{SessionHandle, PLAYLIST_FILE};

/// URL prefix under which session directories are served.
pub const PLAYLIST_URL_PREFIX: &str = "/hls";

/// Validate a session id. Ids become directory names, so they must be 1-64
/// chars of ASCII alphanumerics, hyphens or underscores.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > 64 {
        return Err(format!("session id too long ({} chars, max 64)", id.len()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(format!(
            "session id contains invalid characters: {}",
            id.chars().take(64).collect::<String>()
        ));
    }
    Ok(())
}

/// Stable playlist URL for a session id.
pub fn playlist_url(id: &str) -> String {
    format!("{PLAYLIST_URL_PREFIX}/{id}/{PLAYLIST_FILE}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Read-only view of a session, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub source_uri: String,
    pub playlist_url: String,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub max_duration_secs: u64,
    pub state: SessionState,
    pub pid: Option<u32>,
}

/// Registry entry. Only the registry mutates it, always under its lock.
struct SessionRecord {
    id: String,
    source_uri: String,
    output_dir: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    max_duration: Duration,
    state: SessionState,
    handle: Option<SessionHandle>,
    stop_pending: bool,
    /// Fires once the session has been deregistered and its directory handed
    /// to the janitor.
    finished: CancellationToken,
}

impl SessionRecord {
    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            source_uri: self.source_uri.clone(),
            playlist_url: playlist_url(&self.id),
            output_dir: self.output_dir.clone(),
            started_at: self.started_at,
            max_duration_secs: self.max_duration.as_secs(),
            state: self.state,
            pid: self.handle.as_ref().and_then(|h| h.pid()),
        }
    }
}

/// Server-level session lifecycle events, for collaborators that persist
/// session metadata.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        id: String,
        source_uri: String,
        playlist_url: String,
    },
    Stopping {
        id: String,
    },
    Ended {
        id: String,
        state: SessionState,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("invalid session id: {0}")]
    InvalidId(String),
}

/// Everything the registry needs to reserve a new session.
#[derive(Debug, Clone)]
pub struct ReserveRequest<'a> {
    /// Explicit id; `None` generates a fresh UUID.
    pub id: Option<String>,
    pub source_uri: &'a str,
    pub max_duration: Duration,
    /// Root under which the session directory is placed.
    pub root: &'a Path,
}

/// Result of an atomic test-and-insert.
#[derive(Debug, Clone)]
pub enum Reservation {
    Created(SessionDescriptor),
    AlreadyExists(SessionDescriptor),
}

/// Result of attaching a launched process to its reservation.
#[derive(Debug)]
pub enum Attach {
    Running(SessionDescriptor),
    /// A stop arrived while the session was starting; the caller must
    /// terminate the process it just launched.
    StopPending(SessionDescriptor),
    /// The reservation is gone.
    Missing,
}

/// What a `stop` caller should do after consulting the registry.
#[derive(Debug)]
pub enum StopTicket {
    NotFound,
    /// This caller won the `Running -> Stopping` transition and drives the
    /// termination sequence.
    Drive {
        handle: SessionHandle,
        finished: CancellationToken,
    },
    /// Another caller (or the start path) is already terminating the session.
    Join { finished: CancellationToken },
}

struct RegistryInner {
    sessions: HashMap<String, SessionRecord>,
    max_sessions: Option<usize>,
}

/// Concurrency-safe map from session id to session record.
///
/// Every operation takes the lock once and never awaits or does I/O while
/// holding it.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Default maximum number of sessions when no explicit limit is set.
    ///
    /// Each session is one ffmpeg process, a few fds and a monitor task.
    const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
            })),
            events_tx,
        }
    }

    /// Atomically reserve an id in the `Starting` state.
    ///
    /// If the id is already present nothing is inserted and the existing
    /// session's descriptor is returned, so concurrent starts for one id can
    /// never both go on to launch a process.
    pub fn reserve(&self, req: ReserveRequest<'_>) -> Result<Reservation, RegistryError> {
        if let Some(id) = &req.id {
            validate_session_id(id).map_err(RegistryError::InvalidId)?;
        }

        let mut inner = self.inner.lock();

        if let Some(existing) = req.id.as_ref().and_then(|id| inner.sessions.get(id)) {
            return Ok(Reservation::AlreadyExists(existing.descriptor()));
        }

        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        let id = match req.id {
            Some(id) => id,
            None => loop {
                let candidate = uuid::Uuid::new_v4().to_string();
                if !inner.sessions.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let record = SessionRecord {
            output_dir: req.root.join(&id),
            id: id.clone(),
            source_uri: req.source_uri.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            max_duration: req.max_duration,
            state: SessionState::Starting,
            handle: None,
            stop_pending: false,
            finished: CancellationToken::new(),
        };
        let descriptor = record.descriptor();
        inner.sessions.insert(id, record);
        Ok(Reservation::Created(descriptor))
    }

    /// Record the launched process for a reservation and mark it `Running`.
    ///
    /// The lifetime clock restarts here, at successful launch.
    pub fn attach(&self, id: &str, handle: SessionHandle) -> Attach {
        let mut inner = self.inner.lock();
        let Some(record) = inner.sessions.get_mut(id) else {
            return Attach::Missing;
        };
        record.handle = Some(handle);
        record.started_at = Utc::now();
        record.started = Instant::now();
        if record.stop_pending {
            record.state = SessionState::Stopping;
            return Attach::StopPending(record.descriptor());
        }
        record.state = SessionState::Running;
        let descriptor = record.descriptor();
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Started {
            id: descriptor.id.clone(),
            source_uri: descriptor.source_uri.clone(),
            playlist_url: descriptor.playlist_url.clone(),
        });
        Attach::Running(descriptor)
    }

    /// Drop a reservation whose launch never produced a process.
    ///
    /// Returns the output directory so the caller can hand it to the janitor.
    pub fn release(&self, id: &str) -> Option<PathBuf> {
        let record = self.inner.lock().sessions.remove(id)?;
        debug_assert!(record.handle.is_none(), "release() on a launched session");
        record.finished.cancel();
        Some(record.output_dir)
    }

    /// Decide how a stop request proceeds, transitioning the session to
    /// `Stopping` if it is the first.
    pub fn begin_stop(&self, id: &str) -> StopTicket {
        let mut inner = self.inner.lock();
        let Some(record) = inner.sessions.get_mut(id) else {
            return StopTicket::NotFound;
        };
        let finished = record.finished.clone();
        let ticket = match (record.state, &record.handle) {
            (SessionState::Running, Some(handle)) => {
                record.state = SessionState::Stopping;
                StopTicket::Drive {
                    handle: handle.clone(),
                    finished,
                }
            }
            (SessionState::Starting, _) => {
                record.stop_pending = true;
                record.state = SessionState::Stopping;
                StopTicket::Join { finished }
            }
            _ => return StopTicket::Join { finished },
        };
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Stopping { id: id.to_string() });
        ticket
    }

    /// Record the terminal state and remove the session.
    ///
    /// Called only by the session's monitor after it has observed the process
    /// exit. Returns the final descriptor and the `finished` latch, which the
    /// caller fires once cleanup is complete.
    pub fn finish(
        &self,
        id: &str,
        state: SessionState,
        exit_code: Option<i32>,
    ) -> Option<(SessionDescriptor, CancellationToken)> {
        let mut record = self.inner.lock().sessions.remove(id)?;
        record.state = state;
        let _ = self.events_tx.send(SessionEvent::Ended {
            id: id.to_string(),
            state,
            exit_code,
        });
        Some((record.descriptor(), record.finished))
    }

    pub fn get(&self, id: &str) -> Option<SessionDescriptor> {
        self.inner.lock().sessions.get(id).map(SessionRecord::descriptor)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionDescriptor> {
        let mut sessions: Vec<SessionDescriptor> = self
            .inner
            .lock()
            .sessions
            .values()
            .map(SessionRecord::descriptor)
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn ids(&self) -> HashSet<String> {
        self.inner.lock().sessions.keys().cloned().collect()
    }

    /// Ids of running sessions whose lifetime has elapsed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|r| r.state == SessionState::Running)
            .filter(|r| now.saturating_duration_since(r.started) > r.max_duration)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
