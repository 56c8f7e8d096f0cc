//! Fluent API for describing the limits of a job.

use procgov_common::constants::CPU_RATE_SCALE;
use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::{JobSettings, PriorityClass};
use procgov_core::topology::SystemTopology;
use procgov_core::translator::{AffinityRequest, resolve_affinity};

/// A validated job description, ready to be sent to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Desired job name; `None` lets the name be discovered or generated.
    pub name: Option<String>,
    /// Limits to apply.
    pub settings: JobSettings,
}

/// Builder for a job's limits.
#[derive(Debug, Default)]
pub struct JobSettingsBuilder {
    name: Option<String>,
    settings: JobSettings,
    affinity: AffinityRequest,
    cpu_rate_percent: Option<u32>,
}

impl JobSettingsBuilder {
    /// Creates a builder without any limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the job name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into()).filter(|n| !n.is_empty());
        self
    }

    /// Sets the committed memory limit of each process, in bytes.
    #[must_use]
    pub const fn max_process_memory(mut self, bytes: u64) -> Self {
        self.settings.max_process_memory = bytes;
        self
    }

    /// Sets the committed memory limit of the whole job, in bytes.
    #[must_use]
    pub const fn max_job_memory(mut self, bytes: u64) -> Self {
        self.settings.max_job_memory = bytes;
        self
    }

    /// Sets the working set bounds, in bytes.
    #[must_use]
    pub const fn working_set(mut self, min: u64, max: u64) -> Self {
        self.settings.min_working_set_size = min;
        self.settings.max_working_set_size = max;
        self
    }

    /// Restricts the job to a NUMA node.
    #[must_use]
    pub const fn numa_node(mut self, node: u16) -> Self {
        self.affinity.numa_node = Some(node);
        self
    }

    /// Restricts the job to the processors selected by `mask`.
    ///
    /// The mask is relative to the NUMA node when one is set.
    #[must_use]
    pub const fn affinity_mask(mut self, mask: u64) -> Self {
        self.affinity.mask = Some(mask);
        self
    }

    /// Sets the CPU rate, as a percentage of the selected processors.
    #[must_use]
    pub const fn cpu_rate_percent(mut self, percent: u32) -> Self {
        self.cpu_rate_percent = Some(percent);
        self
    }

    /// Sets the outgoing network bandwidth limit, in bytes per second.
    #[must_use]
    pub const fn max_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.settings.max_bandwidth = bytes_per_sec;
        self
    }

    /// Sets the user-mode CPU time limit of each process.
    #[must_use]
    pub const fn process_user_time_ms(mut self, ms: u64) -> Self {
        self.settings.process_user_time_limit_ms = ms;
        self
    }

    /// Sets the user-mode CPU time limit of the whole job.
    #[must_use]
    pub const fn job_user_time_ms(mut self, ms: u64) -> Self {
        self.settings.job_user_time_limit_ms = ms;
        self
    }

    /// Sets the wall-clock lifetime of the job.
    #[must_use]
    pub const fn clock_time_ms(mut self, ms: u64) -> Self {
        self.settings.clock_time_limit_ms = ms;
        self
    }

    /// Sets whether child processes stay in the job.
    #[must_use]
    pub const fn propagate_on_child_processes(mut self, propagate: bool) -> Self {
        self.settings.propagate_on_child_processes = propagate;
        self
    }

    /// Sets the maximum number of simultaneously active processes.
    #[must_use]
    pub const fn active_process_limit(mut self, limit: u32) -> Self {
        self.settings.active_process_limit = limit;
        self
    }

    /// Sets the scheduling priority class of every member.
    #[must_use]
    pub const fn priority_class(mut self, class: PriorityClass) -> Self {
        self.settings.priority_class = class;
        self
    }

    /// Validates the limits and resolves the affinity against `topology`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the working set bounds are
    /// inconsistent, the CPU rate is outside `1..=100`, or the affinity
    /// cannot be resolved.
    pub fn build(self, topology: &dyn SystemTopology) -> Result<JobRequest> {
        let mut settings = self.settings;

        let (min_ws, max_ws) = (settings.min_working_set_size, settings.max_working_set_size);
        if (min_ws == 0) != (max_ws == 0) {
            return Err(ProcgovError::validation(
                "minimum and maximum working set must be set together",
            ));
        }
        if min_ws > max_ws {
            return Err(ProcgovError::validation(format!(
                "minimum working set ({min_ws}) exceeds maximum ({max_ws})"
            )));
        }

        if let Some(percent) = self.cpu_rate_percent {
            if !(1..=100).contains(&percent) {
                return Err(ProcgovError::validation(format!(
                    "CPU rate must be between 1 and 100 percent, got {percent}"
                )));
            }
            settings.cpu_max_rate = percent * CPU_RATE_SCALE;
        }

        settings.cpu_affinity = resolve_affinity(&self.affinity, topology)?;
        Ok(JobRequest {
            name: self.name,
            settings,
        })
    }
}
