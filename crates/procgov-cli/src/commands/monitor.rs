//! `procgov --monitor`: run the job supervisor in the foreground.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use procgov_common::config::SupervisorConfig;
use procgov_core::cgroup::CgroupBackend;
use procgov_core::topology::{LinuxTopology, SystemTopology};
use procgov_supervisor::Supervisor;
use tokio::runtime::Runtime;

use super::GlobalArgs;
use crate::output::parse_duration_ms;

/// Options of the supervisor.
#[derive(Args, Debug, Default)]
pub struct MonitorArgs {
    /// JSON configuration file; flags override its values.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Stop after running this long without any job (e.g. 30s).
    #[arg(
        long = "idle-timeout",
        value_name = "DURATION",
        env = "PROCGOV_IDLE_TIMEOUT",
        value_parser = parse_duration_ms
    )]
    pub idle_timeout_ms: Option<u64>,

    /// Interval at which job state is sampled (e.g. 100ms).
    #[arg(long = "poll-interval", value_name = "DURATION", value_parser = parse_duration_ms)]
    pub poll_interval_ms: Option<u64>,
}

impl MonitorArgs {
    /// Builds the supervisor configuration from the file and the flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result is invalid.
    pub fn into_config(self, global: &GlobalArgs) -> anyhow::Result<SupervisorConfig> {
        let mut config = match &self.config {
            Some(path) => SupervisorConfig::load(path)?,
            None => SupervisorConfig::default(),
        };
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(socket) = &global.socket {
            config.endpoint = Some(socket.clone());
        }
        if let Some(root) = &global.cgroup_root {
            config.cgroup_root = root.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Executes the supervisor until it is idle or interrupted.
///
/// # Errors
///
/// Returns an error if cgroups are unavailable, the socket cannot be bound,
/// or the supervisor stops on a failure.
pub fn execute(
    runtime: &Runtime,
    args: MonitorArgs,
    global: &GlobalArgs,
) -> anyhow::Result<ExitCode> {
    let config = args.into_config(global)?;
    let topology = Arc::new(LinuxTopology::new());
    let backend = CgroupBackend::new(
        config.cgroup_root.clone(),
        topology.total_cores(),
        config.poll_interval(),
    )
    .with_context(|| {
        format!(
            "cannot manage cgroups under {}; a delegated cgroup v2 hierarchy is required",
            config.cgroup_root.display()
        )
    })?;
    tracing::info!(
        root = %backend.root().display(),
        cores = topology.total_cores(),
        idle_timeout_ms = config.idle_timeout_ms,
        "starting supervisor"
    );

    let supervisor = Supervisor::new(config, Arc::new(backend), topology);
    let token = supervisor.cancellation_token();
    ctrlc::set_handler(move || token.cancel())
        .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    runtime.block_on(supervisor.run())?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalArgs {
        GlobalArgs {
            socket: None,
            cgroup_root: None,
            verbose: false,
        }
    }

    #[test]
    fn flags_override_defaults() {
        let args = MonitorArgs {
            idle_timeout_ms: Some(2_000),
            poll_interval_ms: Some(20),
            ..MonitorArgs::default()
        };
        let global = GlobalArgs {
            socket: Some("/tmp/p.sock".into()),
            cgroup_root: Some("/sys/fs/cgroup/test".into()),
            verbose: false,
        };
        let config = args.into_config(&global).unwrap();
        assert_eq!(config.idle_timeout_ms, 2_000);
        assert_eq!(config.poll_interval_ms, 20);
        assert_eq!(config.endpoint, Some(PathBuf::from("/tmp/p.sock")));
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup/test"));
    }

    #[test]
    fn file_values_survive_without_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procgov.json");
        std::fs::write(&path, r#"{"idle_timeout_ms": 1234}"#).unwrap();
        let args = MonitorArgs {
            config: Some(path),
            ..MonitorArgs::default()
        };
        let config = args.into_config(&global()).unwrap();
        assert_eq!(config.idle_timeout_ms, 1234);
        assert_eq!(config.poll_interval_ms, SupervisorConfig::default().poll_interval_ms);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let args = MonitorArgs {
            poll_interval_ms: Some(0),
            ..MonitorArgs::default()
        };
        assert!(args.into_config(&global()).is_err());
    }
}
