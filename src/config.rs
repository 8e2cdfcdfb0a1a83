use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supervisor settings, loaded from TOML and overridable from the command line.
///
/// Every field has a default so an empty file (or no file at all) yields a
/// working configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory under which each session gets its own output directory.
    pub hls_root: PathBuf,
    /// Transcoder binary. A bare name is looked up on `PATH`.
    pub ffmpeg_path: PathBuf,
    /// Target duration of each HLS segment.
    pub segment_seconds: u32,
    /// Number of segments kept in the sliding playlist window.
    pub playlist_size: u32,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL.
    pub grace_period_secs: u64,
    /// Interval between expiration sweeps.
    pub reaper_interval_secs: u64,
    /// Upper bound on concurrently registered sessions. `None` disables the limit.
    pub max_sessions: Option<usize>,
    /// Lifetime used by the HTTP layer when a request omits one.
    pub default_duration_secs: u64,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            hls_root: PathBuf::from("/var/www/hls"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            segment_seconds: 4,
            playlist_size: 5,
            grace_period_secs: 5,
            reaper_interval_secs: 60,
            max_sessions: Some(256),
            default_duration_secs: 3600,
            min_duration_secs: 60,
            max_duration_secs: 86_400,
        }
    }
}

/// Errors that can occur when loading or validating config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl SupervisorConfig {
    /// Load config from a TOML file path. Returns `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject settings that would make the supervisor spin or refuse every request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_seconds == 0 {
            return Err(ConfigError::Invalid("segment_seconds must be positive".into()));
        }
        if self.playlist_size == 0 {
            return Err(ConfigError::Invalid("playlist_size must be positive".into()));
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid("reaper_interval_secs must be positive".into()));
        }
        if self.min_duration_secs == 0 {
            return Err(ConfigError::Invalid("min_duration_secs must be positive".into()));
        }
        if self.min_duration_secs > self.max_duration_secs {
            return Err(ConfigError::Invalid(format!(
                "min_duration_secs ({}) exceeds max_duration_secs ({})",
                self.min_duration_secs, self.max_duration_secs
            )));
        }
        if !(self.min_duration_secs..=self.max_duration_secs).contains(&self.default_duration_secs) {
            return Err(ConfigError::Invalid(format!(
                "default_duration_secs ({}) is outside {}..={}",
                self.default_duration_secs, self.min_duration_secs, self.max_duration_secs
            )));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

/// Warn if the config file is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); \
             consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
