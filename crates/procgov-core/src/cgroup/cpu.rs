//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.max` and `cpuset.cpus`, and reads consumed time from `cpu.stat`.

use std::path::Path;

use procgov_common::error::Result;

use super::{read_flat_keyed, write_control};

/// Sets the CPU bandwidth limit (max microseconds per period).
///
/// Writes `quota_us period_us` to `cpu.max`, where `quota_us` is the
/// maximum CPU time allowed per `period_us` window across all CPUs.
///
/// # Errors
///
/// Returns an error if writing to `cpu.max` fails.
pub fn set_cpu_max(cgroup_path: &Path, quota_us: u64, period_us: u64) -> Result<()> {
    write_control(cgroup_path, "cpu.max", &format!("{quota_us} {period_us}"))?;
    tracing::debug!(quota_us, period_us, "CPU max quota set");
    Ok(())
}

/// Restricts the cgroup to the CPUs of a kernel cpu list (`0-3,8`).
///
/// # Errors
///
/// Returns an error if writing to `cpuset.cpus` fails.
pub fn set_cpuset_cpus(cgroup_path: &Path, cpu_list: &str) -> Result<()> {
    write_control(cgroup_path, "cpuset.cpus", cpu_list)
}

/// User-mode CPU time consumed by the cgroup, in microseconds.
#[must_use]
pub fn user_usec(cgroup_path: &Path) -> u64 {
    read_flat_keyed(cgroup_path, "cpu.stat", "user_usec")
}

/// Total CPU time consumed by the cgroup, in microseconds.
#[must_use]
pub fn usage_usec(cgroup_path: &Path) -> u64 {
    read_flat_keyed(cgroup_path, "cpu.stat", "usage_usec")
}
