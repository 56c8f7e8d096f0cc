//! Cgroups v2 job backend.
//!
//! Each job is a cgroup directory under a common parent (by default
//! `/sys/fs/cgroup/procgov`). Limit calls are written to the cgroup's
//! control files; the limits cgroups cannot express per process are applied
//! with rlimits and nice values to every member. A watcher thread samples
//! the cgroups and posts completion messages on the backend's port.

pub mod cpu;
pub mod memory;
pub mod pids;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use procgov_common::constants::{CPU_RATE_SCALE, TICKS_PER_MS};
use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::JobHandle;

use crate::job::{
    ChannelCompletionPort, CompletionPort, CompletionSender, ExtendedLimits, HandleAllocator,
    JobBackend, LimitCall, LimitFlags, NativeJob, completion_channel,
};
use crate::topology::format_cpu_list;
use watcher::{MemberLimits, WatchTable, WatchedCgroup, Watcher};

/// CPU bandwidth period written to `cpu.max`, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Controllers enabled for job cgroups.
const CONTROLLERS: &str = "+cpu +cpuset +memory +pids";

pub(crate) fn write_control(cgroup: &Path, file: &'static str, value: &str) -> Result<()> {
    let path = cgroup.join(file);
    std::fs::write(&path, value).map_err(|e| ProcgovError::native(file, &e))?;
    tracing::trace!(path = %path.display(), value, "cgroup control written");
    Ok(())
}

/// Reads `key` from a flat-keyed control file; missing files or keys read as 0.
pub(crate) fn read_flat_keyed(cgroup: &Path, file: &str, key: &str) -> u64 {
    std::fs::read_to_string(cgroup.join(file))
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                let (k, v) = line.split_once(' ')?;
                (k == key).then(|| v.trim().parse().ok()).flatten()
            })
        })
        .unwrap_or(0)
}

/// Kills every process in the cgroup.
pub(crate) fn kill_cgroup(cgroup: &Path) -> Result<()> {
    if write_control(cgroup, "cgroup.kill", "1").is_ok() {
        return Ok(());
    }
    // Kernels before 5.14 have no cgroup.kill.
    for pid in pids::read_procs(cgroup)? {
        signal_kill(pid);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn signal_kill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "SIGKILL failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn signal_kill(pid: u32) {
    tracing::debug!(pid, "signals require Linux");
}

fn validate_job_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ProcgovError::validation(format!(
            "'{name}' is not a valid job name"
        )));
    }
    Ok(())
}

/// Job backend on top of the cgroups v2 unified hierarchy.
#[derive(Debug)]
pub struct CgroupBackend {
    root: PathBuf,
    total_cores: u32,
    poll_interval: Duration,
    handles: HandleAllocator,
    sender: CompletionSender,
    port: Arc<ChannelCompletionPort>,
    table: WatchTable,
    watcher: Mutex<Option<Watcher>>,
}

impl CgroupBackend {
    /// Creates a backend whose jobs live under `root`.
    ///
    /// `total_cores` scales CPU rate caps to `cpu.max` quotas;
    /// `poll_interval` is the watcher's sampling interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent cgroup cannot be created.
    pub fn new(root: impl Into<PathBuf>, total_cores: u32, poll_interval: Duration) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ProcgovError::Io {
            path: root.clone(),
            source: e,
        })?;
        if root.join("cgroup.subtree_control").exists() {
            if let Err(e) = write_control(&root, "cgroup.subtree_control", CONTROLLERS) {
                tracing::warn!(root = %root.display(), error = %e, "could not enable cgroup controllers");
            }
        }
        let (sender, port) = completion_channel();
        tracing::info!(root = %root.display(), "cgroup job backend ready");
        Ok(Self {
            root,
            total_cores: total_cores.max(1),
            poll_interval,
            handles: HandleAllocator::new(),
            sender,
            port: Arc::new(port),
            table: Arc::default(),
            watcher: Mutex::new(None),
        })
    }

    /// Parent directory of all job cgroups.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_watcher(&self) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(
                Watcher::spawn(Arc::clone(&self.table), self.sender.clone(), self.poll_interval)
                    .map_err(|e| ProcgovError::native("spawn watcher", &e))?,
            );
        }
        Ok(())
    }

    fn job(&self, handle: JobHandle, name: &str, owned: bool) -> CgroupJob {
        CgroupJob {
            handle,
            name: name.to_owned(),
            path: self.root.join(name),
            owned,
            total_cores: self.total_cores,
            table: Arc::clone(&self.table),
        }
    }
}

impl JobBackend for CgroupBackend {
    fn create_job(&self, name: &str) -> Result<Arc<dyn NativeJob>> {
        validate_job_name(name)?;
        let path = self.root.join(name);
        std::fs::create_dir_all(&path).map_err(|e| ProcgovError::native("create job", &e))?;

        let handle = self.handles.allocate();
        let members = pids::read_procs(&path).unwrap_or_default();
        let mut watched = WatchedCgroup::new(path.clone(), members);
        watched.usage_usec = cpu::usage_usec(&path);
        let _ = self.table.lock().insert(handle, watched);
        self.ensure_watcher()?;

        tracing::info!(job = %name, %handle, path = %path.display(), "job cgroup created");
        Ok(Arc::new(self.job(handle, name, true)))
    }

    fn open_job(&self, name: &str) -> Result<Option<Arc<dyn NativeJob>>> {
        validate_job_name(name)?;
        let path = self.root.join(name);
        if !path.is_dir() {
            return Ok(None);
        }
        let handle = self
            .table
            .lock()
            .iter()
            .find(|(_, watched)| watched.path == path)
            .map_or_else(|| self.handles.allocate(), |(handle, _)| *handle);
        Ok(Some(Arc::new(self.job(handle, name, false))))
    }

    fn completion_port(&self) -> Arc<dyn CompletionPort> {
        self.port.clone()
    }
}

/// A job backed by one cgroup directory.
#[derive(Debug)]
pub struct CgroupJob {
    handle: JobHandle,
    name: String,
    path: PathBuf,
    owned: bool,
    total_cores: u32,
    table: WatchTable,
}

impl CgroupJob {
    /// Directory of this job's cgroup.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_extended(&self, limits: &ExtendedLimits) -> Result<()> {
        let flags = limits.flags;
        if flags.contains(LimitFlags::JOB_MEMORY) {
            memory::set_memory_max(&self.path, limits.job_memory)?;
        }
        if flags.contains(LimitFlags::WORKINGSET) {
            memory::set_memory_high(&self.path, limits.max_working_set)?;
            if limits.min_working_set > 0 {
                memory::set_memory_low(&self.path, limits.min_working_set)?;
            }
        }
        if flags.contains(LimitFlags::ACTIVE_PROCESS) {
            pids::set_pids_max(&self.path, limits.active_process_limit)?;
        }
        if flags.contains(LimitFlags::SILENT_BREAKAWAY_OK) {
            tracing::debug!(job = %self.name, "children always stay in the cgroup of their parent");
        }

        let member_limits = MemberLimits {
            address_space: flags
                .contains(LimitFlags::PROCESS_MEMORY)
                .then_some(limits.process_memory),
            cpu_time_ms: flags
                .contains(LimitFlags::PROCESS_TIME)
                .then_some(limits.per_process_user_time / TICKS_PER_MS),
            nice: flags
                .contains(LimitFlags::PRIORITY_CLASS)
                .then(|| limits.priority_class.nice_value())
                .flatten(),
        };
        let job_time_limit_usec = flags
            .contains(LimitFlags::JOB_TIME)
            .then_some(limits.per_job_user_time / 10);

        if let Some(watched) = self.table.lock().get_mut(&self.handle) {
            watched.member_limits = member_limits;
            if watched.job_time_limit_usec != job_time_limit_usec {
                watched.job_time_limit_usec = job_time_limit_usec;
                watched.job_time_reported = false;
            }
        }
        if !member_limits.is_empty() {
            for pid in pids::read_procs(&self.path)? {
                member_limits.apply_to(pid);
            }
        }
        Ok(())
    }
}

impl NativeJob for CgroupJob {
    fn handle(&self) -> JobHandle {
        self.handle
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, call: &LimitCall) -> Result<()> {
        match call {
            LimitCall::Extended(limits) => self.apply_extended(limits),
            LimitCall::Affinity(groups) => cpu::set_cpuset_cpus(&self.path, &format_cpu_list(groups)),
            LimitCall::CpuRate { hard_cap } => {
                let quota = u64::from(*hard_cap) * CPU_PERIOD_US * u64::from(self.total_cores)
                    / u64::from(100 * CPU_RATE_SCALE);
                cpu::set_cpu_max(&self.path, quota.max(1_000), CPU_PERIOD_US)
            }
            LimitCall::NetRate { max_bandwidth } => {
                tracing::warn!(
                    job = %self.name,
                    max_bandwidth,
                    "outbound bandwidth limits are not enforced by cgroups v2"
                );
                Ok(())
            }
        }
    }

    fn assign_process(&self, pid: u32) -> Result<()> {
        pids::add_process(&self.path, pid)?;
        tracing::debug!(job = %self.name, pid, "process assigned to job cgroup");
        Ok(())
    }

    fn contains_process(&self, pid: u32) -> Result<bool> {
        Ok(pids::read_procs(&self.path)?.contains(&pid))
    }

    fn processes(&self) -> Result<Vec<u32>> {
        if !self.path.join("cgroup.procs").exists() {
            return Ok(Vec::new());
        }
        Ok(pids::read_procs(&self.path)?.into_iter().collect())
    }

    /// Kills every member with SIGKILL. Cgroups cannot set the exit code of
    /// the killed processes, so `exit_code` is only logged.
    fn terminate(&self, exit_code: u32) -> Result<()> {
        tracing::info!(
            job = %self.name,
            exit_code,
            "terminating job; members exit by SIGKILL, not with the requested code"
        );
        kill_cgroup(&self.path)
    }
}

impl Drop for CgroupJob {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let _ = self.table.lock().remove(&self.handle);
        match std::fs::remove_dir(&self.path) {
            Ok(()) => tracing::info!(job = %self.name, "job cgroup removed"),
            Err(e) => tracing::warn!(
                job = %self.name,
                path = %self.path.display(),
                error = %e,
                "job cgroup left in place"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgov_common::types::{GroupAffinity, PriorityClass};

    fn backend(dir: &Path, cores: u32) -> CgroupBackend {
        CgroupBackend::new(dir.join("procgov"), cores, Duration::from_millis(10)).expect("backend")
    }

    fn read(job: &CgroupJob, file: &str) -> String {
        std::fs::read_to_string(job.path().join(file)).expect("control file")
    }

    fn fake_job(dir: &Path, cores: u32) -> CgroupJob {
        let backend = backend(dir, cores);
        let path = backend.root().join("fake");
        std::fs::create_dir_all(&path).expect("job dir");
        std::fs::write(path.join("cgroup.procs"), "").expect("procs");
        let handle = backend.handles.allocate();
        let _ = backend
            .table
            .lock()
            .insert(handle, WatchedCgroup::new(path, Default::default()));
        backend.job(handle, "fake", false)
    }

    #[test]
    fn job_names_cannot_escape_the_root() {
        assert!(validate_job_name("../etc").is_err());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("build-42").is_ok());
    }

    #[test]
    fn extended_limits_map_to_control_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 4);
        let mut limits = ExtendedLimits::default();
        limits.flags.insert(LimitFlags::JOB_MEMORY);
        limits.flags.insert(LimitFlags::ACTIVE_PROCESS);
        limits.flags.insert(LimitFlags::WORKINGSET);
        limits.job_memory = 512 << 20;
        limits.active_process_limit = 8;
        limits.min_working_set = 1 << 20;
        limits.max_working_set = 64 << 20;

        job.apply(&LimitCall::Extended(limits)).expect("apply");
        assert_eq!(read(&job, "memory.max"), (512u64 << 20).to_string());
        assert_eq!(read(&job, "memory.high"), (64u64 << 20).to_string());
        assert_eq!(read(&job, "memory.low"), (1u64 << 20).to_string());
        assert_eq!(read(&job, "pids.max"), "8");
    }

    #[test]
    fn member_limits_and_job_time_are_recorded_for_the_watcher() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 4);
        let mut limits = ExtendedLimits::default();
        limits.flags.insert(LimitFlags::PRIORITY_CLASS);
        limits.flags.insert(LimitFlags::JOB_TIME);
        limits.priority_class = PriorityClass::Idle;
        limits.per_job_user_time = 20_000_000;

        job.apply(&LimitCall::Extended(limits)).expect("apply");
        let table = job.table.lock();
        let watched = table.get(&job.handle()).expect("watched");
        assert_eq!(watched.member_limits.nice, Some(19));
        assert_eq!(watched.job_time_limit_usec, Some(2_000_000));
    }

    #[test]
    fn cpu_rate_becomes_machine_wide_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 8);
        job.apply(&LimitCall::CpuRate { hard_cap: 1000 }).expect("apply");
        assert_eq!(read(&job, "cpu.max"), "80000 100000");
    }

    #[test]
    fn affinity_becomes_cpuset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 8);
        job.apply(&LimitCall::Affinity(vec![GroupAffinity::new(0, 0b1011)]))
            .expect("apply");
        assert_eq!(read(&job, "cpuset.cpus"), "0-1,3");
    }

    #[test]
    fn bandwidth_is_accepted_without_native_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 2);
        assert!(job.apply(&LimitCall::NetRate { max_bandwidth: 1024 }).is_ok());
    }

    #[test]
    fn create_and_open_share_the_cgroup_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path(), 2);
        let created = backend.create_job("web").expect("create");
        assert!(backend.root().join("web").is_dir());

        let opened = backend.open_job("web").expect("open").expect("exists");
        assert_eq!(opened.handle(), created.handle());
        assert!(backend.open_job("missing").expect("open").is_none());
    }

    #[test]
    fn terminate_writes_cgroup_kill_whatever_the_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 2);
        job.terminate(7).expect("terminate");
        assert_eq!(read(&job, "cgroup.kill"), "1");
    }

    #[test]
    fn short_lived_member_still_ends_the_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path(), 2);
        let job = backend.create_job("brief").expect("create");
        let cgroup = backend.root().join("brief");

        // The member joins, runs briefly and leaves before the watcher looks.
        job.assign_process(4242).expect("assign");
        std::fs::write(cgroup.join("cpu.stat"), "usage_usec 350\nuser_usec 300\n").expect("stat");
        std::fs::write(cgroup.join("cgroup.procs"), "").expect("procs");

        let port = backend.completion_port();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while std::time::Instant::now() < deadline {
            if let Some(raw) = port.poll(Duration::from_millis(20)).expect("poll") {
                seen.push((raw.message, raw.pid));
                if raw.message == crate::job::message::ACTIVE_PROCESS_ZERO {
                    break;
                }
            }
        }
        assert_eq!(seen.last(), Some(&(crate::job::message::ACTIVE_PROCESS_ZERO, 0)));
        assert!(job.processes().expect("processes").is_empty());
    }

    #[test]
    fn membership_reads_cgroup_procs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = fake_job(dir.path(), 2);
        job.assign_process(77).expect("assign");
        assert!(job.contains_process(77).expect("contains"));
        assert!(!job.contains_process(78).expect("contains"));
    }
}
