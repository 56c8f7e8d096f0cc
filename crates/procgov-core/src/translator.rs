//! Resource-limit translator.
//!
//! Maps [`JobSettings`] to the sequence of native [`LimitCall`]s that
//! configure a job. The mapping is pure; [`set_limits`] applies it.
//!
//! A settings field of zero (or an empty list) leaves the corresponding
//! limit unset. Native time limits are expressed in 100-nanosecond ticks
//! and the native CPU rate cap is relative to the whole machine, so a rate
//! requested for an affinity subset is scaled down accordingly.

use procgov_common::constants::{CPU_RATE_SCALE, TICKS_PER_MS};
use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::{GroupAffinity, JobSettings, PriorityClass};

use crate::job::{ExtendedLimits, LimitCall, LimitFlags, NativeJob};
use crate::topology::SystemTopology;

/// Highest native CPU rate value (100%).
pub const MAX_CPU_RATE: u32 = 100 * CPU_RATE_SCALE;

/// Affinity as requested on the command line, before resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AffinityRequest {
    /// NUMA node to run on.
    pub numa_node: Option<u16>,
    /// Processor mask, relative to the node (when given) or to the caller's group.
    pub mask: Option<u64>,
}

/// Resolves an affinity request into group affinity pairs.
///
/// - node and mask: the mask is shifted to the node's first processor and
///   intersected with the node's processors;
/// - node only: all processors of the node;
/// - mask only: the mask intersected with the caller's primary group.
///
/// # Errors
///
/// Returns a validation error if the node does not exist or the resolved
/// affinity selects no processor.
pub fn resolve_affinity(
    request: &AffinityRequest,
    topology: &dyn SystemTopology,
) -> Result<Vec<GroupAffinity>> {
    let resolved = match (request.numa_node, request.mask) {
        (None, None) => return Ok(Vec::new()),
        (Some(node), mask) => {
            let node_groups = topology.numa_node_affinity(node).ok_or_else(|| {
                ProcgovError::validation(format!("NUMA node {node} does not exist"))
            })?;
            match mask {
                None => node_groups,
                Some(mask) => node_groups
                    .iter()
                    .map(|g| {
                        let shifted = mask.checked_shl(g.mask.trailing_zeros()).unwrap_or(0);
                        GroupAffinity::new(g.group, shifted & g.mask)
                    })
                    .collect(),
            }
        }
        (None, Some(mask)) => {
            let visible = topology.visible_affinity();
            let primary = visible.first().ok_or_else(|| {
                ProcgovError::validation("no processor is visible to the caller")
            })?;
            vec![GroupAffinity::new(primary.group, mask & primary.mask)]
        }
    };

    let resolved: Vec<GroupAffinity> = resolved.into_iter().filter(|g| g.mask != 0).collect();
    if resolved.is_empty() {
        return Err(ProcgovError::validation(
            "affinity mask selects no available processor",
        ));
    }
    Ok(resolved)
}

/// Scales a CPU rate requested for `selected_cores` to a machine-wide rate.
///
/// The divisor is the integer ratio `total_cores / selected_cores`; the
/// result is clamped to the native range `1..=10000`.
#[must_use]
pub fn scale_cpu_rate(rate: u32, total_cores: u32, selected_cores: u32) -> u32 {
    let ratio = if selected_cores == 0 || selected_cores >= total_cores {
        1
    } else {
        total_cores / selected_cores
    };
    (rate / ratio).clamp(1, MAX_CPU_RATE)
}

/// Converts milliseconds to native 100-nanosecond ticks.
#[must_use]
pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms.saturating_mul(TICKS_PER_MS)
}

/// Translates settings into native limit calls, in application order.
#[must_use]
pub fn translate(settings: &JobSettings, topology: &dyn SystemTopology) -> Vec<LimitCall> {
    let mut calls = Vec::new();
    let mut limits = ExtendedLimits::default();

    if settings.max_process_memory > 0 {
        limits.flags.insert(LimitFlags::PROCESS_MEMORY);
        limits.process_memory = settings.max_process_memory;
    }
    if settings.max_job_memory > 0 {
        limits.flags.insert(LimitFlags::JOB_MEMORY);
        limits.job_memory = settings.max_job_memory;
    }
    if settings.max_working_set_size > 0 {
        limits.flags.insert(LimitFlags::WORKINGSET);
        limits.min_working_set = settings.min_working_set_size;
        limits.max_working_set = settings.max_working_set_size;
    }
    if settings.process_user_time_limit_ms > 0 {
        limits.flags.insert(LimitFlags::PROCESS_TIME);
        limits.per_process_user_time = ms_to_ticks(settings.process_user_time_limit_ms);
    }
    if settings.job_user_time_limit_ms > 0 {
        limits.flags.insert(LimitFlags::JOB_TIME);
        limits.per_job_user_time = ms_to_ticks(settings.job_user_time_limit_ms);
    }
    if settings.active_process_limit > 0 {
        limits.flags.insert(LimitFlags::ACTIVE_PROCESS);
        limits.active_process_limit = settings.active_process_limit;
    }
    if settings.priority_class != PriorityClass::Unset {
        limits.flags.insert(LimitFlags::PRIORITY_CLASS);
        limits.priority_class = settings.priority_class;
    }
    if !settings.propagate_on_child_processes {
        limits.flags.insert(LimitFlags::SILENT_BREAKAWAY_OK);
    }
    calls.push(LimitCall::Extended(limits));

    if !settings.cpu_affinity.is_empty() {
        calls.push(LimitCall::Affinity(settings.sorted_affinity()));
    }

    if settings.cpu_max_rate > 0 {
        let selected = if settings.cpu_affinity.is_empty() {
            0
        } else {
            settings.selected_cores()
        };
        let hard_cap = scale_cpu_rate(settings.cpu_max_rate, topology.total_cores(), selected);
        calls.push(LimitCall::CpuRate { hard_cap });
    }

    if settings.max_bandwidth > 0 {
        calls.push(LimitCall::NetRate {
            max_bandwidth: settings.max_bandwidth,
        });
    }

    calls
}

/// Applies `settings` to `job`, stopping at the first failing call.
///
/// Returns the number of calls applied.
///
/// # Errors
///
/// Returns the first native error, which carries the OS error code.
pub fn set_limits(
    job: &dyn NativeJob,
    settings: &JobSettings,
    topology: &dyn SystemTopology,
) -> Result<usize> {
    let calls = translate(settings, topology);
    for call in &calls {
        job.apply(call).inspect_err(|e| {
            tracing::error!(job = %job.name(), ?call, error = %e, "setting job limits failed");
        })?;
    }
    tracing::debug!(job = %job.name(), calls = calls.len(), "job limits applied");
    Ok(calls.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;

    fn extended(calls: &[LimitCall]) -> &ExtendedLimits {
        match &calls[0] {
            LimitCall::Extended(limits) => limits,
            other => panic!("expected extended limits first, got {other:?}"),
        }
    }

    #[test]
    fn cpu_rate_is_scaled_to_affinity_subset() {
        let settings = JobSettings {
            cpu_max_rate: 2000,
            cpu_affinity: vec![GroupAffinity::new(0, 0b1111)],
            ..JobSettings::default()
        };
        let calls = translate(&settings, &StaticTopology::uniform(8));
        assert!(calls.contains(&LimitCall::CpuRate { hard_cap: 1000 }));
    }

    #[test]
    fn cpu_rate_without_affinity_is_unscaled() {
        let settings = JobSettings {
            cpu_max_rate: 2000,
            ..JobSettings::default()
        };
        let calls = translate(&settings, &StaticTopology::uniform(8));
        assert!(calls.contains(&LimitCall::CpuRate { hard_cap: 2000 }));
    }

    #[test]
    fn scale_cpu_rate_uses_integer_ratio_and_clamps() {
        assert_eq!(scale_cpu_rate(3000, 8, 3), 1500);
        assert_eq!(scale_cpu_rate(1, 64, 1), 1);
        assert_eq!(scale_cpu_rate(20_000, 4, 4), MAX_CPU_RATE);
    }

    #[test]
    fn time_limits_use_100ns_ticks() {
        let settings = JobSettings {
            process_user_time_limit_ms: 1500,
            job_user_time_limit_ms: 2,
            ..JobSettings::default()
        };
        let calls = translate(&settings, &StaticTopology::uniform(2));
        let limits = extended(&calls);
        assert_eq!(limits.per_process_user_time, 15_000_000);
        assert_eq!(limits.per_job_user_time, 20_000);
        assert!(limits.flags.contains(LimitFlags::PROCESS_TIME));
        assert!(limits.flags.contains(LimitFlags::JOB_TIME));
    }

    #[test]
    fn zero_fields_leave_limits_unset() {
        let calls = translate(&JobSettings::default(), &StaticTopology::uniform(2));
        assert_eq!(calls.len(), 1);
        let limits = extended(&calls);
        assert_eq!(limits.flags, LimitFlags::SILENT_BREAKAWAY_OK);
        assert_eq!(limits.job_memory, 0);
    }

    #[test]
    fn propagation_clears_breakaway_flag() {
        let settings = JobSettings {
            propagate_on_child_processes: true,
            max_job_memory: 1 << 30,
            ..JobSettings::default()
        };
        let calls = translate(&settings, &StaticTopology::uniform(2));
        let limits = extended(&calls);
        assert!(!limits.flags.contains(LimitFlags::SILENT_BREAKAWAY_OK));
        assert!(limits.flags.contains(LimitFlags::JOB_MEMORY));
    }

    #[test]
    fn bandwidth_and_affinity_produce_dedicated_calls() {
        let settings = JobSettings {
            max_bandwidth: 1_000_000,
            cpu_affinity: vec![GroupAffinity::new(1, 0x3), GroupAffinity::new(0, 0x1)],
            ..JobSettings::default()
        };
        let calls = translate(&settings, &StaticTopology::uniform(128));
        assert_eq!(
            calls[1],
            LimitCall::Affinity(vec![GroupAffinity::new(0, 0x1), GroupAffinity::new(1, 0x3)])
        );
        assert_eq!(calls[2], LimitCall::NetRate { max_bandwidth: 1_000_000 });
    }

    fn two_node_topology() -> StaticTopology {
        StaticTopology {
            total_cores: 8,
            visible: vec![GroupAffinity::new(0, 0xFF)],
            numa_nodes: vec![
                vec![GroupAffinity::new(0, 0x0F)],
                vec![GroupAffinity::new(0, 0xF0)],
            ],
        }
    }

    #[test]
    fn affinity_mask_is_aligned_to_node() {
        let request = AffinityRequest {
            numa_node: Some(1),
            mask: Some(0b0011),
        };
        let resolved = resolve_affinity(&request, &two_node_topology()).unwrap();
        assert_eq!(resolved, vec![GroupAffinity::new(0, 0b0011_0000)]);
    }

    #[test]
    fn affinity_node_only_uses_whole_node() {
        let request = AffinityRequest {
            numa_node: Some(0),
            mask: None,
        };
        let resolved = resolve_affinity(&request, &two_node_topology()).unwrap();
        assert_eq!(resolved, vec![GroupAffinity::new(0, 0x0F)]);
    }

    #[test]
    fn affinity_mask_only_intersects_visible() {
        let topology = StaticTopology {
            visible: vec![GroupAffinity::new(0, 0x0F)],
            ..two_node_topology()
        };
        let request = AffinityRequest {
            numa_node: None,
            mask: Some(0x3C),
        };
        let resolved = resolve_affinity(&request, &topology).unwrap();
        assert_eq!(resolved, vec![GroupAffinity::new(0, 0x0C)]);
    }

    #[test]
    fn affinity_rejects_unknown_node_and_empty_result() {
        let unknown = AffinityRequest {
            numa_node: Some(7),
            mask: None,
        };
        assert!(matches!(
            resolve_affinity(&unknown, &two_node_topology()),
            Err(ProcgovError::Validation { .. })
        ));

        let outside = AffinityRequest {
            numa_node: None,
            mask: Some(0xF00),
        };
        assert!(resolve_affinity(&outside, &two_node_topology()).is_err());
    }

    #[test]
    fn no_affinity_request_resolves_to_nothing() {
        let resolved =
            resolve_affinity(&AffinityRequest::default(), &two_node_topology()).unwrap();
        assert!(resolved.is_empty());
    }
}
