//! Process membership and process-count control via cgroups v2.
//!
//! Manages `cgroup.procs` and `pids.max`, and reads limit hits from
//! `pids.events`.

use std::collections::BTreeSet;
use std::path::Path;

use procgov_common::error::{ProcgovError, Result};

use super::{read_flat_keyed, write_control};

/// Caps the number of tasks in the cgroup.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn set_pids_max(cgroup_path: &Path, max: u32) -> Result<()> {
    write_control(cgroup_path, "pids.max", &max.to_string())
}

/// Number of times a fork failed because `pids.max` was reached.
#[must_use]
pub fn max_events(cgroup_path: &Path) -> u64 {
    read_flat_keyed(cgroup_path, "pids.events", "max")
}

/// Moves a process into the cgroup.
///
/// # Errors
///
/// Returns an error if writing to `cgroup.procs` fails.
pub fn add_process(cgroup_path: &Path, pid: u32) -> Result<()> {
    write_control(cgroup_path, "cgroup.procs", &pid.to_string())
}

/// Reads the member processes of the cgroup.
///
/// # Errors
///
/// Returns an error if `cgroup.procs` cannot be read.
pub fn read_procs(cgroup_path: &Path) -> Result<BTreeSet<u32>> {
    let content = std::fs::read_to_string(cgroup_path.join("cgroup.procs"))
        .map_err(|e| ProcgovError::native("cgroup.procs", &e))?;
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}
