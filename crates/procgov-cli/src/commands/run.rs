//! Default command: launch or attach processes under a limited job.
//!
//! Either `-p PID...` attaches running processes or `-- COMMAND ARGS...`
//! launches a new one tagged with the job marker. Unless `--nowait` is
//! given, the command then follows the job until it has no process left
//! and exits with the launched command's exit code.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitCode, ExitStatus};

use anyhow::Context;
use clap::Args;
use procgov_common::config::SupervisorConfig;
use procgov_common::constants::JOB_MARKER_ENV;
use procgov_common::types::{PriorityClass, generate_job_name};
use procgov_core::cgroup::CgroupBackend;
use procgov_core::job::JobBackend;
use procgov_core::process::ProcessInspector;
use procgov_core::sim::SimulatedBackend;
use procgov_core::topology::{LinuxTopology, SystemTopology};
use procgov_core::translator::set_limits;
use procgov_sdk::adoption::{Adopter, AdoptionReport, AdoptionRequest};
use procgov_sdk::builder::{JobRequest, JobSettingsBuilder};
use procgov_sdk::event::EventListener;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::GlobalArgs;
use crate::launcher;
use crate::output::{format_event, format_settings, parse_duration_ms, parse_mask, parse_size};

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// Limits and targets of the default command.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Processes to attach (repeat or separate with commas).
    #[arg(
        short = 'p',
        long = "pid",
        value_name = "PID",
        value_delimiter = ',',
        conflicts_with = "program"
    )]
    pub pids: Vec<u32>,

    /// Command to launch inside the job.
    #[arg(last = true, value_name = "COMMAND")]
    pub program: Vec<String>,

    /// Job name; processes already in a job keep theirs.
    #[arg(short = 'n', long = "job-name")]
    pub job_name: Option<String>,

    /// Memory limit of each process (e.g. 100M).
    #[arg(short = 'm', long = "maxmem", value_name = "SIZE", value_parser = parse_size)]
    pub max_process_memory: Option<u64>,

    /// Memory limit of the whole job (e.g. 1G).
    #[arg(long = "maxjobmem", value_name = "SIZE", value_parser = parse_size)]
    pub max_job_memory: Option<u64>,

    /// Minimum working set of the job.
    #[arg(
        long = "minws",
        value_name = "SIZE",
        value_parser = parse_size,
        requires = "max_working_set"
    )]
    pub min_working_set: Option<u64>,

    /// Maximum working set of the job.
    #[arg(
        long = "maxws",
        value_name = "SIZE",
        value_parser = parse_size,
        requires = "min_working_set"
    )]
    pub max_working_set: Option<u64>,

    /// Processor mask (e.g. 0xF0), relative to `--node` when given.
    #[arg(short = 'c', long = "cpu", value_name = "MASK", value_parser = parse_mask)]
    pub cpu_mask: Option<u64>,

    /// NUMA node to run on.
    #[arg(long = "node", value_name = "NODE")]
    pub numa_node: Option<u16>,

    /// CPU rate, in percent of the selected processors.
    #[arg(short = 'e', long = "cpurate", value_name = "PERCENT")]
    pub cpu_rate: Option<u32>,

    /// Outgoing bandwidth limit, in bytes per second (e.g. 10M).
    #[arg(long = "bandwidth", value_name = "SIZE", value_parser = parse_size)]
    pub bandwidth: Option<u64>,

    /// User-mode CPU time limit of each process (e.g. 30s).
    #[arg(long = "process-utime", value_name = "DURATION", value_parser = parse_duration_ms)]
    pub process_user_time: Option<u64>,

    /// User-mode CPU time limit of the job (e.g. 5m).
    #[arg(long = "job-utime", value_name = "DURATION", value_parser = parse_duration_ms)]
    pub job_user_time: Option<u64>,

    /// Wall-clock lifetime of the job; it is terminated afterwards.
    #[arg(
        short = 't',
        long = "timeout",
        value_name = "DURATION",
        value_parser = parse_duration_ms
    )]
    pub clock_time: Option<u64>,

    /// Keep child processes in the job.
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Maximum number of simultaneously active processes.
    #[arg(long = "max-processes", value_name = "N")]
    pub max_processes: Option<u32>,

    /// Priority class of every process (idle, below-normal, normal,
    /// above-normal, high, realtime).
    #[arg(long)]
    pub priority: Option<PriorityClass>,

    /// Return once the processes are in the job.
    #[arg(long)]
    pub nowait: bool,

    /// Print the limits that would be applied without touching any process.
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Validates the limits into a job request.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is out of range or the affinity cannot be
    /// resolved on this machine.
    pub fn job_request(&self, topology: &dyn SystemTopology) -> anyhow::Result<JobRequest> {
        let mut builder = JobSettingsBuilder::new()
            .propagate_on_child_processes(self.recursive)
            .max_process_memory(self.max_process_memory.unwrap_or(0))
            .max_job_memory(self.max_job_memory.unwrap_or(0))
            .working_set(
                self.min_working_set.unwrap_or(0),
                self.max_working_set.unwrap_or(0),
            )
            .max_bandwidth(self.bandwidth.unwrap_or(0))
            .process_user_time_ms(self.process_user_time.unwrap_or(0))
            .job_user_time_ms(self.job_user_time.unwrap_or(0))
            .clock_time_ms(self.clock_time.unwrap_or(0))
            .active_process_limit(self.max_processes.unwrap_or(0))
            .priority_class(self.priority.unwrap_or_default());
        if let Some(name) = &self.job_name {
            builder = builder.name(name.clone());
        }
        if let Some(node) = self.numa_node {
            builder = builder.numa_node(node);
        }
        if let Some(mask) = self.cpu_mask {
            builder = builder.affinity_mask(mask);
        }
        if let Some(rate) = self.cpu_rate {
            builder = builder.cpu_rate_percent(rate);
        }
        Ok(builder.build(topology)?)
    }
}

/// Executes the default command.
///
/// # Errors
///
/// Returns an error if the limits are invalid, the supervisor cannot be
/// reached, or the processes cannot be adopted.
pub async fn execute(args: RunArgs, global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let topology = LinuxTopology::new();
    let request = args.job_request(&topology)?;
    if args.dry_run {
        return dry_run(&request, &topology);
    }
    if args.pids.is_empty() && args.program.is_empty() {
        anyhow::bail!("nothing to govern: pass -p PID or -- COMMAND [ARGS...]");
    }

    let socket = global.socket_path();
    let cgroup_root = global.cgroup_root();
    let mut client = launcher::connect_or_start(&socket, &cgroup_root).await?;
    let backend = CgroupBackend::new(
        cgroup_root,
        topology.total_cores(),
        SupervisorConfig::default().poll_interval(),
    )?;
    let inspector = ProcessInspector::new();
    let adopter = Adopter::new(&backend, &inspector);

    let (adoption, launched) = if args.program.is_empty() {
        let adoption = AdoptionRequest {
            name: request.name,
            pids: args.pids,
            settings: request.settings,
        };
        (adoption, None)
    } else {
        let name = request.name.unwrap_or_else(generate_job_name);
        let launched = Launched::spawn(&args.program, &name)?;
        let adoption = AdoptionRequest {
            name: Some(name),
            pids: vec![launched.pid],
            settings: request.settings,
        };
        (adoption, Some(launched))
    };

    if args.nowait {
        let report = adopter.adopt(&mut client, &adoption).await;
        let report = abandon_on_error(report, launched.as_ref())?;
        print_report(&report);
        return Ok(ExitCode::SUCCESS);
    }

    let result = adopter.adopt_and_subscribe(client, &adoption).await;
    let (report, mut events) = abandon_on_error(result, launched.as_ref())?;
    print_report(&report);
    follow(&mut events).await?;

    match launched {
        Some(launched) => launched.exit_code().await,
        None => Ok(ExitCode::SUCCESS),
    }
}

/// A command launched inside the job, reaped in the background.
struct Launched {
    pid: u32,
    killer: CancellationToken,
    status: JoinHandle<std::io::Result<ExitStatus>>,
}

impl Launched {
    fn spawn(program: &[String], job: &str) -> anyhow::Result<Self> {
        let (exe, rest) = program.split_first().context("empty command")?;
        let mut child = tokio::process::Command::new(exe)
            .args(rest)
            .env(JOB_MARKER_ENV, job)
            .spawn()
            .with_context(|| format!("failed to launch {exe}"))?;
        let pid = child.id().context("launched process is already gone")?;
        tracing::debug!(pid, job, command = %exe, "command launched");

        let killer = CancellationToken::new();
        let kill = killer.clone();
        let status = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => status,
                () = kill.cancelled() => {
                    child.kill().await?;
                    child.wait().await
                }
            }
        });
        Ok(Self {
            pid,
            killer,
            status,
        })
    }

    async fn exit_code(self) -> anyhow::Result<ExitCode> {
        let status = self.status.await??;
        let code = match (status.code(), status.signal()) {
            (Some(code), _) => u8::try_from(code).unwrap_or(1),
            (None, Some(signal)) => u8::try_from(128 + signal).unwrap_or(1),
            (None, None) => 1,
        };
        Ok(ExitCode::from(code))
    }
}

/// Kills the launched command if it could not be placed in the job.
fn abandon_on_error<T>(
    result: procgov_common::error::Result<T>,
    launched: Option<&Launched>,
) -> anyhow::Result<T> {
    result.map_err(|e| {
        if let Some(launched) = launched {
            tracing::warn!(pid = launched.pid, "killing command that could not be governed");
            launched.killer.cancel();
        }
        e.into()
    })
}

#[allow(clippy::print_stderr)]
async fn follow(events: &mut EventListener<UnixStream>) -> anyhow::Result<()> {
    let interrupted = CancellationToken::new();
    let token = interrupted.clone();
    ctrlc::set_handler(move || token.cancel())
        .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    loop {
        let next = tokio::select! {
            () = interrupted.cancelled() => {
                eprintln!();
                eprintln!(
                    "  {YELLOW}Detached.{RESET} Job {BOLD}{}{RESET} keeps running under the supervisor.",
                    events.job()
                );
                return Ok(());
            }
            next = events.next() => next?,
        };
        match next {
            Some(event) => eprintln!("  {DIM}{}{RESET}", format_event(&event)),
            None => return Ok(()),
        }
    }
}

#[allow(clippy::print_stderr)]
fn print_report(report: &AdoptionReport) {
    eprintln!();
    eprintln!("  {GREEN}{BOLD}Job {}{RESET}", report.name);
    for pid in &report.assigned {
        eprintln!("    {GREEN}●{RESET} process {pid} assigned");
    }
    for pid in &report.already_members {
        eprintln!("    {DIM}●{RESET} process {pid} already in the job");
    }
    for pid in &report.skipped {
        eprintln!("    {YELLOW}●{RESET} process {pid} skipped");
    }
    eprintln!();
}

#[allow(clippy::print_stderr)]
fn dry_run(request: &JobRequest, topology: &dyn SystemTopology) -> anyhow::Result<ExitCode> {
    let backend = SimulatedBackend::new();
    let name = request.name.clone().unwrap_or_else(generate_job_name);
    let job = backend.create_job(&name)?;
    let count = set_limits(job.as_ref(), &request.settings, topology)?;

    eprintln!();
    eprintln!("  {BOLD}Dry run{RESET} for job {BOLD}{name}{RESET}");
    for line in format_settings(&request.settings) {
        eprintln!("    {line}");
    }
    eprintln!();
    eprintln!("  {count} native limit call(s):");
    for call in backend.applied_calls(&name) {
        eprintln!("    {DIM}{call:?}{RESET}");
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use procgov_common::types::GroupAffinity;
    use procgov_core::topology::StaticTopology;

    use super::*;
    use crate::commands::Cli;

    fn parse(args: &[&str]) -> RunArgs {
        let mut argv = vec!["procgov"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().run
    }

    #[test]
    fn limits_map_onto_settings() {
        let args = parse(&[
            "-m", "100M", "--maxjobmem", "1G", "-e", "20", "-c", "0xF", "-t", "10s", "-r",
            "--max-processes", "4", "--priority", "below-normal", "-n", "web", "-p", "12,13",
        ]);
        assert_eq!(args.pids, vec![12, 13]);

        let request = args.job_request(&StaticTopology::uniform(8)).unwrap();
        let settings = request.settings;
        assert_eq!(request.name.as_deref(), Some("web"));
        assert_eq!(settings.max_process_memory, 100 * 1024 * 1024);
        assert_eq!(settings.max_job_memory, 1024 * 1024 * 1024);
        assert_eq!(settings.cpu_max_rate, 2000);
        assert_eq!(settings.cpu_affinity, vec![GroupAffinity::new(0, 0xF)]);
        assert_eq!(settings.clock_time_limit_ms, 10_000);
        assert_eq!(settings.active_process_limit, 4);
        assert_eq!(settings.priority_class, PriorityClass::BelowNormal);
        assert!(settings.propagate_on_child_processes);
    }

    #[test]
    fn command_goes_after_the_separator() {
        let args = parse(&["--nowait", "--", "sleep", "10"]);
        assert!(args.nowait);
        assert_eq!(args.program, vec!["sleep".to_owned(), "10".to_owned()]);
        assert!(args.pids.is_empty());
    }

    #[test]
    fn pids_and_command_are_exclusive() {
        assert!(Cli::try_parse_from(["procgov", "-p", "1", "--", "true"]).is_err());
    }

    #[test]
    fn working_set_bounds_come_in_pairs() {
        assert!(Cli::try_parse_from(["procgov", "--minws", "1M", "-p", "1"]).is_err());
        let args = parse(&["--minws", "1M", "--maxws", "2M", "-p", "1"]);
        let request = args.job_request(&StaticTopology::uniform(2)).unwrap();
        assert_eq!(request.settings.min_working_set_size, 1024 * 1024);
    }

    #[test]
    fn invalid_cpu_rate_is_rejected() {
        let args = parse(&["-e", "150", "-p", "1"]);
        assert!(args.job_request(&StaticTopology::uniform(2)).is_err());
    }

    #[test]
    fn dry_run_applies_nothing_real() {
        let args = parse(&["--dry-run", "--maxjobmem", "64M"]);
        let topology = StaticTopology::uniform(4);
        let request = args.job_request(&topology).unwrap();
        assert_eq!(dry_run(&request, &topology).unwrap(), ExitCode::SUCCESS);
    }
}
