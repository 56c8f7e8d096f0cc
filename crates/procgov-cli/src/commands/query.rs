//! `procgov query`: show the job of a process or the limits of a job.

use std::process::ExitCode;

use clap::Args;

use super::GlobalArgs;
use crate::launcher;
use crate::output::format_settings;

/// Arguments for the `query` command.
#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("subject").required(true).args(["pid", "job"])))]
pub struct QueryArgs {
    /// Process whose job to show.
    #[arg(long)]
    pub pid: Option<u32>,

    /// Job whose limits to show.
    #[arg(long)]
    pub job: Option<String>,

    /// Print the limits as JSON.
    #[arg(long, requires = "job")]
    pub json: bool,
}

/// Executes the `query` command.
///
/// Exits with a failure code when the process or job is unknown.
///
/// # Errors
///
/// Returns an error if no supervisor is running or the query fails.
#[allow(clippy::print_stdout)]
pub async fn execute(args: QueryArgs, global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let mut client = launcher::connect(&global.socket_path()).await?;

    if let Some(pid) = args.pid {
        return match client.get_job_name(pid).await? {
            Some(name) => {
                println!("{name}");
                Ok(ExitCode::SUCCESS)
            }
            None => {
                println!("process {pid} is not governed by any job");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    let Some(job) = args.job else {
        return Ok(ExitCode::FAILURE);
    };
    let Some(settings) = client.get_job_settings(&job).await? else {
        println!("job '{job}' is not known to the supervisor");
        return Ok(ExitCode::FAILURE);
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("job: {job}");
    let lines = format_settings(&settings);
    if lines.is_empty() {
        println!("  no limits");
    }
    for line in lines {
        println!("  {line}");
    }
    Ok(ExitCode::SUCCESS)
}
