//! Supervisor configuration model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{ProcgovError, Result};

/// Runtime configuration of the job supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long the supervisor keeps running with no tracked job, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Completion-port poll timeout, in milliseconds.
    pub poll_interval_ms: u64,
    /// How long a job may stay without members before it is dropped, in
    /// milliseconds. `None` uses the idle timeout.
    pub memberless_grace_ms: Option<u64>,
    /// How long a write to one subscriber may block, in milliseconds.
    pub notify_timeout_ms: u64,
    /// Socket path override; `None` selects the privilege-scoped default.
    pub endpoint: Option<PathBuf>,
    /// Parent cgroup for job cgroups.
    pub cgroup_root: PathBuf,
}

impl SupervisorConfig {
    /// Loads a configuration from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it
    /// contains a zero poll interval.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProcgovError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the supervisor misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll interval or the notification timeout
    /// is zero.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ProcgovError::Config {
                message: "poll interval must be greater than zero".into(),
            });
        }
        if self.notify_timeout_ms == 0 {
            return Err(ProcgovError::Config {
                message: "notification timeout must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Idle window after which an empty supervisor shuts down.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Completion-port poll timeout.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Time a registered job may go without members before it is dropped.
    #[must_use]
    pub fn memberless_grace(&self) -> Duration {
        Duration::from_millis(self.memberless_grace_ms.unwrap_or(self.idle_timeout_ms))
    }

    /// Time a single subscriber write may block before the subscriber is dropped.
    #[must_use]
    pub const fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: constants::DEFAULT_IDLE_TIMEOUT_MS,
            poll_interval_ms: constants::DEFAULT_POLL_INTERVAL_MS,
            memberless_grace_ms: None,
            notify_timeout_ms: constants::DEFAULT_NOTIFY_TIMEOUT_MS,
            endpoint: None,
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_bounded_poll_interval() {
        let config = SupervisorConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert!(config.endpoint.is_none());
        assert_eq!(config.notify_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn memberless_grace_follows_idle_timeout_unless_set() {
        let mut config = SupervisorConfig {
            idle_timeout_ms: 300,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.memberless_grace(), Duration::from_millis(300));
        config.memberless_grace_ms = Some(20);
        assert_eq!(config.memberless_grace(), Duration::from_millis(20));
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("procgov.json");
        std::fs::write(&path, r#"{"idle_timeout_ms": 500}"#).expect("write config");

        let config = SupervisorConfig::load(&path).expect("load");
        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.poll_interval_ms, constants::DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn load_rejects_zero_poll_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("procgov.json");
        std::fs::write(&path, r#"{"poll_interval_ms": 0}"#).expect("write config");

        assert!(matches!(
            SupervisorConfig::load(&path),
            Err(ProcgovError::Config { .. })
        ));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = SupervisorConfig::load(Path::new("/nonexistent/procgov.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/procgov.json"));
    }
}
