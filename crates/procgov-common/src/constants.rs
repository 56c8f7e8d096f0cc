//! System-wide constants and default paths.

/// Application name used in log output and generated names.
pub const APP_NAME: &str = "procgov";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "procgov";

/// Prefix of generated job names.
pub const JOB_NAME_PREFIX: &str = "procgov-";

/// Environment variable carrying the name of the job a process was started in.
pub const JOB_MARKER_ENV: &str = "PROCGOV_JOB";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Default parent cgroup under which one cgroup per job is created.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/procgov";

/// Socket used by supervisors running with an effective uid of 0.
pub const ELEVATED_SOCKET_PATH: &str = "/run/procgov/procgov-elevated.sock";

/// Directory for per-user sockets when `XDG_RUNTIME_DIR` is not set.
pub const FALLBACK_SOCKET_DIR: &str = "/tmp";

/// Default time the supervisor stays alive without any tracked job, in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;

/// Default completion-port poll timeout, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default bound on a single write to a subscriber, in milliseconds.
pub const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 5_000;

/// Native time unit: 100-nanosecond ticks per millisecond.
pub const TICKS_PER_MS: u64 = 10_000;

/// Scale of CPU rate values: hundredths of a percent.
pub const CPU_RATE_SCALE: u32 = 100;
