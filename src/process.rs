use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::source::CredentialMask;

/// Name of the playlist written inside each session directory.
pub const PLAYLIST_FILE: &str = "stream.m3u8";
/// ffmpeg pattern for segment files; the sequence number is monotonic.
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";
/// Extension of segment files, used when counting them on disk.
pub const SEGMENT_EXTENSION: &str = "ts";

/// Number of trailing stderr lines kept for the exit report.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("transcoder binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("failed to spawn transcoder: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failure to observe a transcoder's exit.
#[derive(Error, Debug)]
#[error("failed to wait for transcoder: {0}")]
pub struct MonitorError(#[from] std::io::Error);

/// Builds and starts transcoder processes.
///
/// The invocation is a pure function of the source, the output directory and
/// the lifetime, so two launches with the same inputs run the same command.
#[derive(Debug, Clone)]
pub struct Launcher {
    binary: PathBuf,
    segment_seconds: u32,
    playlist_size: u32,
}

impl Launcher {
    pub fn new(binary: impl Into<PathBuf>, segment_seconds: u32, playlist_size: u32) -> Self {
        Self {
            binary: binary.into(),
            segment_seconds,
            playlist_size,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            config.segment_seconds,
            config.playlist_size,
        )
    }

    /// Arguments passed to the transcoder, excluding the program itself.
    ///
    /// Video is copied untouched, audio is re-encoded to AAC, and the HLS muxer
    /// prunes old segments so the directory stays bounded.
    pub fn build_args(
        &self,
        source_uri: &str,
        output_dir: &Path,
        max_duration_secs: u64,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
        ];
        if is_rtsp(source_uri) {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend([
            "-i".into(),
            source_uri.to_string(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.segment_seconds.to_string(),
            "-hls_list_size".into(),
            self.playlist_size.to_string(),
            "-hls_flags".into(),
            "delete_segments".into(),
            "-hls_segment_filename".into(),
            output_dir.join(SEGMENT_PATTERN).display().to_string(),
            "-t".into(),
            max_duration_secs.to_string(),
            output_dir.join(PLAYLIST_FILE).display().to_string(),
        ]);
        args
    }

    /// Resolve the configured binary to an existing file.
    ///
    /// Paths with more than one component are checked directly; bare names
    /// are searched for on `PATH`.
    pub fn locate_binary(&self) -> Result<PathBuf, LaunchError> {
        if self.binary.components().count() > 1 {
            return if self.binary.is_file() {
                Ok(self.binary.clone())
            } else {
                Err(LaunchError::BinaryNotFound(self.binary.clone()))
            };
        }
        std::env::var_os("PATH")
            .into_iter()
            .flat_map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
            .map(|dir| dir.join(&self.binary))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| LaunchError::BinaryNotFound(self.binary.clone()))
    }

    /// Start a transcoder writing into `output_dir`, which must already exist.
    ///
    /// Returns the cloneable control half and the single-use waiter half. The
    /// child runs in its own process group so signals reach anything it forks.
    pub fn launch(
        &self,
        session: &str,
        source_uri: &str,
        output_dir: &Path,
        max_duration_secs: u64,
    ) -> Result<(SessionHandle, ProcessWaiter), LaunchError> {
        let program = self.locate_binary()?;
        let args = self.build_args(source_uri, output_dir, max_duration_secs);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        // The binary was found above; ENOENT here is a missing output directory.
        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;

        let pid = child.id();
        tracing::debug!(session, ?pid, program = %program.display(), "transcoder spawned");

        let mask = CredentialMask::for_uri(source_uri);
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(session.to_string(), stderr, mask)));

        let control = Arc::new(ProcessControl::default());
        let handle = SessionHandle {
            pid,
            program,
            args: args.into(),
            control: control.clone(),
        };
        let waiter = ProcessWaiter {
            child,
            control,
            stderr_task,
        };
        Ok((handle, waiter))
    }
}

fn is_rtsp(source_uri: &str) -> bool {
    let lower = source_uri.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

/// Forward transcoder stderr to the log, keeping the last few lines.
///
/// ffmpeg echoes the input URL in its errors, so every line is masked before
/// it is logged or kept.
async fn collect_stderr(session: String, stderr: ChildStderr, mask: CredentialMask) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        let line = mask.apply(&line).into_owned();
        tracing::debug!(session = %session, "ffmpeg: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

#[derive(Default)]
struct ProcessControl {
    stop_requested: AtomicBool,
    kill_requested: CancellationToken,
    exited: CancellationToken,
}

/// Control half of a running transcoder.
///
/// Cloning shares the same process; none of these operations block.
#[derive(Clone)]
pub struct SessionHandle {
    pid: Option<u32>,
    program: PathBuf,
    args: Arc<[String]>,
    control: Arc<ProcessControl>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn stop_requested(&self) -> bool {
        self.control.stop_requested.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        self.control.exited.is_cancelled()
    }

    /// Resolves once the owning waiter has observed the exit.
    pub async fn exited(&self) {
        self.control.exited.cancelled().await
    }

    /// Ask the transcoder to terminate gracefully (SIGTERM to its group).
    ///
    /// Returns `true` only for the call that actually sent the signal; later
    /// calls, and calls after exit, are no-ops.
    pub fn request_stop(&self) -> bool {
        if self.control.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.has_exited() {
            tracing::debug!(pid = ?self.pid, "transcoder already exited, skipping SIGTERM");
            return false;
        }
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            self.control.kill_requested.cancel();
        }
        true
    }

    /// Forcefully terminate the transcoder.
    pub fn kill(&self) {
        if self.has_exited() {
            tracing::debug!(pid = ?self.pid, "transcoder already exited, skipping SIGKILL");
            return;
        }
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        self.control.kill_requested.cancel();
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else {
            return;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        // SAFETY: kill(2) has no memory-safety preconditions. The negative PID
        // targets the group the child leads, and the exited check above keeps
        // us from signalling a reaped, possibly recycled, PID.
        let rc = unsafe { libc::kill(-(pid as i32), signal) };
        if rc != 0 {
            tracing::debug!(
                pid,
                signal,
                error = %std::io::Error::last_os_error(),
                "failed to signal transcoder process group"
            );
        }
    }
}

/// What the waiter saw when the transcoder ended.
#[derive(Debug)]
pub struct ProcessExit {
    pub status: ExitStatus,
    /// Last lines the transcoder wrote to stderr.
    pub stderr_tail: Vec<String>,
}

/// Exit-observing half of a transcoder. Consumed by [`ProcessWaiter::wait`],
/// so a process can be waited on exactly once.
pub struct ProcessWaiter {
    child: Child,
    control: Arc<ProcessControl>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
}

impl ProcessWaiter {
    /// Block the calling task until the transcoder exits.
    pub async fn wait(mut self) -> Result<ProcessExit, MonitorError> {
        let mut kill_sent = false;
        let result = loop {
            tokio::select! {
                status = self.child.wait() => break status,
                _ = self.control.kill_requested.cancelled(), if !kill_sent => {
                    kill_sent = true;
                    if let Err(e) = self.child.start_kill() {
                        tracing::debug!(?e, "start_kill failed");
                    }
                }
            }
        };
        self.control.exited.cancel();
        let status = result?;

        // Forked grandchildren can keep the pipe open; don't wait on them.
        let stderr_tail = match self.stderr_task.take() {
            Some(task) => match tokio::time::timeout(Duration::from_millis(500), task).await {
                Ok(Ok(tail)) => tail,
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        Ok(ProcessExit {
            status,
            stderr_tail,
        })
    }
}
