//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max`, `memory.high`, `memory.low`, and reads OOM kill
//! counts from `memory.events`.

use std::path::Path;

use procgov_common::error::Result;

use super::{read_flat_keyed, write_control};

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_control(cgroup_path, "memory.max", &bytes.to_string())
}

/// Sets the memory high watermark (throttling threshold).
///
/// # Errors
///
/// Returns an error if writing to `memory.high` fails.
pub fn set_memory_high(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_control(cgroup_path, "memory.high", &bytes.to_string())
}

/// Sets the protected memory floor.
///
/// # Errors
///
/// Returns an error if writing to `memory.low` fails.
pub fn set_memory_low(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_control(cgroup_path, "memory.low", &bytes.to_string())
}

/// Number of processes killed by the OOM killer inside the cgroup.
#[must_use]
pub fn oom_kill_count(cgroup_path: &Path) -> u64 {
    read_flat_keyed(cgroup_path, "memory.events", "oom_kill")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limits_are_written_as_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_memory_max(dir.path(), 1_048_576).expect("max");
        set_memory_high(dir.path(), 2048).expect("high");
        set_memory_low(dir.path(), 1024).expect("low");
        let read = |f: &str| std::fs::read_to_string(dir.path().join(f)).expect("read");
        assert_eq!(read("memory.max"), "1048576");
        assert_eq!(read("memory.high"), "2048");
        assert_eq!(read("memory.low"), "1024");
    }

    #[test]
    fn oom_kill_count_reads_memory_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(oom_kill_count(dir.path()), 0);
        std::fs::write(
            dir.path().join("memory.events"),
            "low 0\nhigh 4\nmax 2\noom 1\noom_kill 1\n",
        )
        .expect("events");
        assert_eq!(oom_kill_count(dir.path()), 1);
    }
}
