//! System topology: core count, caller affinity, and NUMA nodes.
//!
//! Logical CPUs are grouped into processor groups of 64 so that an
//! affinity can be expressed as `(group, mask)` pairs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::GroupAffinity;

/// Logical processors per processor group.
pub const GROUP_SIZE: u32 = 64;

/// Source of topology information for the translator.
pub trait SystemTopology: Send + Sync {
    /// Number of logical processors in the machine.
    fn total_cores(&self) -> u32;

    /// Affinity of the calling process.
    fn visible_affinity(&self) -> Vec<GroupAffinity>;

    /// Processors of a NUMA node, or `None` if the node does not exist.
    fn numa_node_affinity(&self, node: u16) -> Option<Vec<GroupAffinity>>;
}

/// A fixed topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTopology {
    /// Number of logical processors.
    pub total_cores: u32,
    /// Affinity of the caller.
    pub visible: Vec<GroupAffinity>,
    /// Processors per NUMA node, indexed by node number.
    pub numa_nodes: Vec<Vec<GroupAffinity>>,
}

impl StaticTopology {
    /// A single-node machine with `cores` processors, all visible.
    #[must_use]
    pub fn uniform(cores: u32) -> Self {
        let cpus: Vec<u32> = (0..cores).collect();
        let all = cpus_to_groups(&cpus);
        Self {
            total_cores: cores,
            visible: all.clone(),
            numa_nodes: vec![all],
        }
    }
}

impl SystemTopology for StaticTopology {
    fn total_cores(&self) -> u32 {
        self.total_cores
    }

    fn visible_affinity(&self) -> Vec<GroupAffinity> {
        self.visible.clone()
    }

    fn numa_node_affinity(&self, node: u16) -> Option<Vec<GroupAffinity>> {
        self.numa_nodes.get(usize::from(node)).cloned()
    }
}

/// Topology read from sysfs and the scheduler.
#[derive(Debug, Clone)]
pub struct LinuxTopology {
    sysfs_root: PathBuf,
}

impl LinuxTopology {
    /// Reads topology from `/sys`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sysfs_root("/sys")
    }

    /// Reads topology from an alternate sysfs mount.
    #[must_use]
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
        }
    }

    fn read_cpu_list(&self, relative: &str) -> Option<Vec<u32>> {
        let path = self.sysfs_root.join(relative);
        let content = std::fs::read_to_string(&path).ok()?;
        match parse_cpu_list(&content) {
            Ok(cpus) => Some(cpus),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cpu list");
                None
            }
        }
    }
}

impl Default for LinuxTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTopology for LinuxTopology {
    fn total_cores(&self) -> u32 {
        self.read_cpu_list("devices/system/cpu/online")
            .and_then(|cpus| u32::try_from(cpus.len()).ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .ok()
                    .and_then(|n| u32::try_from(n.get()).ok())
                    .unwrap_or(1)
            })
    }

    fn visible_affinity(&self) -> Vec<GroupAffinity> {
        let cpus = scheduler_affinity().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "sched_getaffinity failed, assuming all online cpus");
            (0..self.total_cores()).collect()
        });
        cpus_to_groups(&cpus)
    }

    fn numa_node_affinity(&self, node: u16) -> Option<Vec<GroupAffinity>> {
        self.read_cpu_list(&format!("devices/system/node/node{node}/cpulist"))
            .map(|cpus| cpus_to_groups(&cpus))
    }
}

#[cfg(target_os = "linux")]
fn scheduler_affinity() -> Result<Vec<u32>> {
    use nix::sched::{CpuSet, sched_getaffinity};
    use nix::unistd::Pid;

    let set = sched_getaffinity(Pid::from_raw(0)).map_err(|e| ProcgovError::Native {
        operation: "sched_getaffinity",
        code: e as i32,
    })?;
    Ok((0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .filter_map(|cpu| u32::try_from(cpu).ok())
        .collect())
}

#[cfg(not(target_os = "linux"))]
fn scheduler_affinity() -> Result<Vec<u32>> {
    Err(ProcgovError::Config {
        message: "Linux required for native job operations".into(),
    })
}

/// Parses a kernel cpu list such as `0-3,8,10-11`.
///
/// # Errors
///
/// Returns a validation error on malformed ranges.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let bad = || ProcgovError::validation(format!("invalid cpu list entry: {part}"));
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.trim().parse().map_err(|_| bad())?;
            let end: u32 = end.trim().parse().map_err(|_| bad())?;
            if end < start {
                return Err(bad());
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.trim().parse().map_err(|_| bad())?);
        }
    }
    Ok(cpus)
}

/// Groups logical CPU numbers into per-group masks.
#[must_use]
pub fn cpus_to_groups(cpus: &[u32]) -> Vec<GroupAffinity> {
    let mut groups: BTreeMap<u16, u64> = BTreeMap::new();
    for &cpu in cpus {
        let Ok(group) = u16::try_from(cpu / GROUP_SIZE) else {
            continue;
        };
        *groups.entry(group).or_default() |= 1u64 << (cpu % GROUP_SIZE);
    }
    groups
        .into_iter()
        .map(|(group, mask)| GroupAffinity::new(group, mask))
        .collect()
}

/// Expands group masks back into logical CPU numbers.
#[must_use]
pub fn groups_to_cpus(groups: &[GroupAffinity]) -> Vec<u32> {
    let mut cpus: Vec<u32> = groups
        .iter()
        .flat_map(|g| {
            (0..GROUP_SIZE)
                .filter(move |bit| g.mask & (1u64 << bit) != 0)
                .map(move |bit| u32::from(g.group) * GROUP_SIZE + bit)
        })
        .collect();
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

/// Formats group masks as a kernel cpu list (`0-3,8`).
#[must_use]
pub fn format_cpu_list(groups: &[GroupAffinity]) -> String {
    let cpus = groups_to_cpus(groups);
    let mut ranges: Vec<String> = Vec::new();
    let mut iter = cpus.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            let _ = iter.next();
        }
        ranges.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    ranges.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cpu_list_ranges_and_singles() {
        assert_eq!(parse_cpu_list("0-3,8,10-11\n").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert!(parse_cpu_list("").unwrap().is_empty());
    }

    #[test]
    fn parse_cpu_list_rejects_reversed_range() {
        assert!(parse_cpu_list("5-2").is_err());
        assert!(parse_cpu_list("a").is_err());
    }

    #[test]
    fn cpus_split_into_groups_of_64() {
        let groups = cpus_to_groups(&[0, 1, 64, 65, 127]);
        assert_eq!(
            groups,
            vec![
                GroupAffinity::new(0, 0b11),
                GroupAffinity::new(1, 0b11 | (1 << 63)),
            ]
        );
        assert_eq!(groups_to_cpus(&groups), vec![0, 1, 64, 65, 127]);
    }

    #[test]
    fn format_cpu_list_collapses_ranges() {
        let groups = vec![GroupAffinity::new(0, 0b1_0000_1111)];
        assert_eq!(format_cpu_list(&groups), "0-3,8");
    }

    #[test]
    fn uniform_topology_exposes_all_cores() {
        let topo = StaticTopology::uniform(8);
        assert_eq!(topo.total_cores(), 8);
        assert_eq!(topo.visible_affinity(), vec![GroupAffinity::new(0, 0xFF)]);
        assert!(topo.numa_node_affinity(1).is_none());
    }

    #[test]
    fn linux_topology_reads_fake_sysfs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cpu_dir = dir.path().join("devices/system/cpu");
        let node_dir = dir.path().join("devices/system/node/node1");
        std::fs::create_dir_all(&cpu_dir).expect("cpu dir");
        std::fs::create_dir_all(&node_dir).expect("node dir");
        std::fs::write(cpu_dir.join("online"), "0-7\n").expect("online");
        std::fs::write(node_dir.join("cpulist"), "4-7\n").expect("cpulist");

        let topo = LinuxTopology::with_sysfs_root(dir.path());
        assert_eq!(topo.total_cores(), 8);
        assert_eq!(
            topo.numa_node_affinity(1),
            Some(vec![GroupAffinity::new(0, 0xF0)])
        );
        assert!(topo.numa_node_affinity(3).is_none());
    }
}
