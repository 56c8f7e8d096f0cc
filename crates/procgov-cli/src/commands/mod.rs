//! CLI command definitions and dispatch.

pub mod monitor;
pub mod query;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use procgov_common::constants::DEFAULT_CGROUP_ROOT;

/// procgov: run processes under resource-limited jobs.
#[derive(Parser, Debug)]
#[command(
    name = "procgov",
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Subcommand to execute; without one, processes are launched or attached.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Run the job supervisor in the foreground.
    #[arg(long, conflicts_with_all = ["pids", "program"])]
    pub monitor: bool,

    /// Supervisor options, used with `--monitor`.
    #[command(flatten)]
    pub supervisor: monitor::MonitorArgs,

    /// Limits and targets.
    #[command(flatten)]
    pub run: run::RunArgs,

    /// Options shared by every command.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Supervisor socket; defaults to the per-user endpoint.
    #[arg(long, global = true, env = "PROCGOV_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Directory holding one cgroup per job [default: /sys/fs/cgroup/procgov].
    #[arg(long, global = true, env = "PROCGOV_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    /// The supervisor socket to use.
    pub fn socket_path(&self) -> PathBuf {
        procgov_ipc::endpoint::resolve(self.socket.as_deref())
    }

    /// The cgroup root to use.
    pub fn cgroup_root(&self) -> PathBuf {
        self.cgroup_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_ROOT))
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the job of a process or the limits of a job.
    Query(query::QueryArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match cli.command {
        Some(Command::Query(args)) => runtime.block_on(query::execute(args, &cli.global)),
        None if cli.monitor => monitor::execute(&runtime, cli.supervisor, &cli.global),
        None => runtime.block_on(run::execute(cli.run, &cli.global)),
    }
}
