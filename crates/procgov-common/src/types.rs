//! Domain primitive types used across the procgov workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProcgovError;

/// Completion key identifying a native job inside one supervisor process.
///
/// Handles are never reused while the supervisor runs, so a late event for
/// a disposed job cannot be attributed to a newer job with the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(u64);

impl JobHandle {
    /// Wraps a raw completion key.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw completion key.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Generates a fresh job name for invocations that did not request one.
#[must_use]
pub fn generate_job_name() -> String {
    format!(
        "{}{}",
        crate::constants::JOB_NAME_PREFIX,
        uuid::Uuid::new_v4().simple()
    )
}

/// An affinity mask scoped to one processor group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupAffinity {
    /// Processor group number.
    pub group: u16,
    /// Bit mask of logical processors within the group.
    pub mask: u64,
}

impl GroupAffinity {
    /// Creates a new group affinity pair.
    #[must_use]
    pub const fn new(group: u16, mask: u64) -> Self {
        Self { group, mask }
    }

    /// Number of logical processors selected by the mask.
    #[must_use]
    pub const fn core_count(&self) -> u32 {
        self.mask.count_ones()
    }
}

/// Scheduling priority class applied to every member process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    /// No priority change requested.
    #[default]
    Unset,
    /// Runs only when the system is idle.
    Idle,
    /// Below normal priority.
    BelowNormal,
    /// Normal priority.
    Normal,
    /// Above normal priority.
    AboveNormal,
    /// High priority.
    High,
    /// Highest priority.
    Realtime,
}

impl PriorityClass {
    /// Maps the class to a Unix nice value, or `None` when unset.
    #[must_use]
    pub const fn nice_value(self) -> Option<i32> {
        match self {
            Self::Unset => None,
            Self::Idle => Some(19),
            Self::BelowNormal => Some(10),
            Self::Normal => Some(0),
            Self::AboveNormal => Some(-5),
            Self::High => Some(-10),
            Self::Realtime => Some(-20),
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unset => "unset",
            Self::Idle => "idle",
            Self::BelowNormal => "below-normal",
            Self::Normal => "normal",
            Self::AboveNormal => "above-normal",
            Self::High => "high",
            Self::Realtime => "realtime",
        };
        f.write_str(name)
    }
}

impl FromStr for PriorityClass {
    type Err = ProcgovError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "idle" => Ok(Self::Idle),
            "below-normal" | "belownormal" => Ok(Self::BelowNormal),
            "normal" => Ok(Self::Normal),
            "above-normal" | "abovenormal" => Ok(Self::AboveNormal),
            "high" => Ok(Self::High),
            "realtime" => Ok(Self::Realtime),
            other => Err(ProcgovError::validation(format!(
                "unknown priority class: {other}"
            ))),
        }
    }
}

/// Kind of limit reported by a limit-exceeded notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    /// Committed memory limit.
    Memory,
    /// User-mode CPU time limit.
    CpuTime,
    /// Number of simultaneously active processes.
    ActiveProcessNumber,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::CpuTime => write!(f, "CPU time"),
            Self::ActiveProcessNumber => write!(f, "active process number"),
        }
    }
}

/// Resource limits of a job.
///
/// A zero (or empty) field means "not set", never "limit of zero". The
/// value is replaced wholesale on update; see [`JobSettings::merge`].
/// Fields are listed in wire order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Committed memory ceiling per process, in bytes.
    pub max_process_memory: u64,
    /// Committed memory ceiling for the whole job, in bytes.
    pub max_job_memory: u64,
    /// Minimum working set size, in bytes.
    pub min_working_set_size: u64,
    /// Maximum working set size, in bytes.
    pub max_working_set_size: u64,
    /// Processor group and affinity mask pairs.
    pub cpu_affinity: Vec<GroupAffinity>,
    /// CPU rate cap in hundredths of a percent (`2000` = 20%).
    pub cpu_max_rate: u32,
    /// Outbound bandwidth cap in bytes per second.
    pub max_bandwidth: u64,
    /// User-mode CPU time per process, in milliseconds.
    pub process_user_time_limit_ms: u64,
    /// User-mode CPU time for the whole job, in milliseconds.
    pub job_user_time_limit_ms: u64,
    /// Wall-clock lifetime of the job, in milliseconds.
    pub clock_time_limit_ms: u64,
    /// Whether child processes stay in the job.
    pub propagate_on_child_processes: bool,
    /// Maximum number of simultaneously active processes.
    pub active_process_limit: u32,
    /// Priority class applied to members.
    pub priority_class: PriorityClass,
}

impl JobSettings {
    /// Merges `update` on top of `self`.
    ///
    /// Non-zero (or non-empty, or non-`Unset`) fields of `update` replace the
    /// stored value; zero fields keep it, so a later invocation can never
    /// clear a limit by omission. Propagation to children is sticky.
    #[must_use]
    pub fn merge(&self, update: &Self) -> Self {
        fn pick<T: Copy + PartialEq + Default>(old: T, new: T) -> T {
            if new == T::default() { old } else { new }
        }

        Self {
            max_process_memory: pick(self.max_process_memory, update.max_process_memory),
            max_job_memory: pick(self.max_job_memory, update.max_job_memory),
            min_working_set_size: pick(self.min_working_set_size, update.min_working_set_size),
            max_working_set_size: pick(self.max_working_set_size, update.max_working_set_size),
            cpu_affinity: if update.cpu_affinity.is_empty() {
                self.cpu_affinity.clone()
            } else {
                update.cpu_affinity.clone()
            },
            cpu_max_rate: pick(self.cpu_max_rate, update.cpu_max_rate),
            max_bandwidth: pick(self.max_bandwidth, update.max_bandwidth),
            process_user_time_limit_ms: pick(
                self.process_user_time_limit_ms,
                update.process_user_time_limit_ms,
            ),
            job_user_time_limit_ms: pick(self.job_user_time_limit_ms, update.job_user_time_limit_ms),
            clock_time_limit_ms: pick(self.clock_time_limit_ms, update.clock_time_limit_ms),
            propagate_on_child_processes: self.propagate_on_child_processes
                || update.propagate_on_child_processes,
            active_process_limit: pick(self.active_process_limit, update.active_process_limit),
            priority_class: pick(self.priority_class, update.priority_class),
        }
    }

    /// Returns whether no limit at all is configured.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        *self == Self::default()
    }

    /// Affinity pairs sorted by group, the form used for comparison.
    #[must_use]
    pub fn sorted_affinity(&self) -> Vec<GroupAffinity> {
        let mut affinity = self.cpu_affinity.clone();
        affinity.sort_unstable();
        affinity
    }

    /// Total number of logical processors selected by the affinity pairs.
    #[must_use]
    pub fn selected_cores(&self) -> u32 {
        self.cpu_affinity.iter().map(GroupAffinity::core_count).sum()
    }
}

/// Affinity lists compare independent of order.
impl PartialEq for JobSettings {
    fn eq(&self, other: &Self) -> bool {
        self.max_process_memory == other.max_process_memory
            && self.max_job_memory == other.max_job_memory
            && self.min_working_set_size == other.min_working_set_size
            && self.max_working_set_size == other.max_working_set_size
            && self.cpu_max_rate == other.cpu_max_rate
            && self.max_bandwidth == other.max_bandwidth
            && self.process_user_time_limit_ms == other.process_user_time_limit_ms
            && self.job_user_time_limit_ms == other.job_user_time_limit_ms
            && self.clock_time_limit_ms == other.clock_time_limit_ms
            && self.propagate_on_child_processes == other.propagate_on_child_processes
            && self.active_process_limit == other.active_process_limit
            && self.priority_class == other.priority_class
            && self.sorted_affinity() == other.sorted_affinity()
    }
}

impl Eq for JobSettings {}
