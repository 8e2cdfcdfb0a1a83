#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use camhls::config::SupervisorConfig;
use camhls::session::{SessionEvent, SessionState};
use camhls::supervisor::{StartOutcome, StartRequest, Supervisor};
use tokio::sync::broadcast;

/// Writes a playlist and one segment next to the output path (the last
/// argument), then runs until SIGTERM.
pub const HLS_TRANSCODER: &str = r#"#!/bin/sh
trap 'exit 0' TERM
for last; do :; done
dir=$(dirname "$last")
printf '#EXTM3U\n#EXT-X-VERSION:3\n' > "$last"
printf 'ts' > "$dir/segment_000.ts"
while :; do sleep 1; done
"#;

/// Runs until SIGTERM without writing anything.
pub const QUIET_TRANSCODER: &str = r#"#!/bin/sh
trap 'exit 0' TERM
while :; do sleep 1; done
"#;

/// Ignores SIGTERM; only SIGKILL ends it. Touches `ready` in its working
/// directory once the trap is installed.
pub const STUBBORN_TRANSCODER: &str = r#"#!/bin/sh
trap '' TERM
: > ready
while :; do sleep 1; done
"#;

/// Fails the way ffmpeg does when the camera refuses the connection.
pub const CRASHING_TRANSCODER: &str = r#"#!/bin/sh
echo "Connection refused" >&2
exit 3
"#;

/// Echoes its input URL in an error and exits 1, like ffmpeg when the
/// camera is unreachable.
pub const ECHOING_CRASH_TRANSCODER: &str = r#"#!/bin/sh
for a; do
    case "$a" in *://*) echo "$a: Connection refused" >&2 ;; esac
done
exit 1
"#;

/// Write an executable fake transcoder into `dir`.
pub fn write_transcoder(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Short timings so lifecycle tests finish in a few seconds.
pub fn test_config(dir: &Path, ffmpeg: PathBuf) -> SupervisorConfig {
    SupervisorConfig {
        hls_root: dir.join("hls"),
        ffmpeg_path: ffmpeg,
        grace_period_secs: 2,
        reaper_interval_secs: 1,
        ..SupervisorConfig::default()
    }
}

/// A supervisor running `transcoder` in a fresh temp directory.
pub struct TestSupervisor {
    pub supervisor: Supervisor,
    pub dir: tempfile::TempDir,
}

impl TestSupervisor {
    pub async fn new(transcoder: &str) -> Self {
        Self::with_config(transcoder, |_| {}).await
    }

    pub async fn with_config(transcoder: &str, tweak: impl FnOnce(&mut SupervisorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = write_transcoder(dir.path(), transcoder);
        let mut config = test_config(dir.path(), script);
        tweak(&mut config);
        let supervisor = Supervisor::new(config).await.unwrap();
        Self { supervisor, dir }
    }

    pub fn root(&self) -> &Path {
        &self.supervisor.config().hls_root
    }

    pub async fn start(&self, id: Option<&str>, source_uri: &str) -> StartOutcome {
        self.supervisor
            .start(start_request(id, source_uri, 3600))
            .await
            .unwrap()
    }
}

pub fn start_request(id: Option<&str>, source_uri: &str, max_duration_secs: u64) -> StartRequest {
    StartRequest {
        source_uri: source_uri.to_string(),
        max_duration_secs,
        id: id.map(str::to_string),
    }
}

/// Poll `check` every 50ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for the `Ended` event of session `id`.
pub async fn wait_ended(
    events: &mut broadcast::Receiver<SessionEvent>,
    id: &str,
    timeout: Duration,
) -> (SessionState, Option<i32>) {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Ended {
                    id: ended,
                    state,
                    exit_code,
                }) if ended == id => return (state, exit_code),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session {id} did not end within {timeout:?}"))
}

/// Whether a process with `pid` still exists.
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<parking_lot::Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's logs, down to DEBUG, into the capture until the
    /// guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
