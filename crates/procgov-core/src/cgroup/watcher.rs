//! Cgroup watcher.
//!
//! Cgroups do not post completion messages, so a dedicated thread samples
//! every watched cgroup at a fixed interval and posts the messages a job
//! facility would have posted for the observed changes.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use procgov_common::types::JobHandle;

use super::{cpu, memory, pids};
use crate::job::{CompletionSender, message};

/// Limits the cgroup hierarchy cannot enforce; applied to each member process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberLimits {
    /// Address space limit, in bytes.
    pub address_space: Option<u64>,
    /// CPU time limit, in milliseconds.
    pub cpu_time_ms: Option<u64>,
    /// Nice value.
    pub nice: Option<i32>,
}

impl MemberLimits {
    /// Applies the limits to one process. Failures are logged and skipped.
    pub fn apply_to(&self, pid: u32) {
        if let Some(bytes) = self.address_space {
            if let Err(e) = crate::process::set_address_space_limit(pid, bytes) {
                tracing::warn!(pid, error = %e, "failed to limit process memory");
            }
        }
        if let Some(ms) = self.cpu_time_ms {
            if let Err(e) = crate::process::set_cpu_time_limit(pid, ms) {
                tracing::warn!(pid, error = %e, "failed to limit process CPU time");
            }
        }
        if let Some(nice) = self.nice {
            if let Err(e) = crate::process::set_nice(pid, nice) {
                tracing::warn!(pid, nice, error = %e, "failed to set process priority");
            }
        }
    }

    /// Returns whether no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.address_space.is_none() && self.cpu_time_ms.is_none() && self.nice.is_none()
    }
}

/// Last observed state of a watched cgroup.
#[derive(Debug, Clone)]
pub struct WatchedCgroup {
    /// Directory of the cgroup.
    pub path: PathBuf,
    /// Members seen in the previous sample.
    pub members: BTreeSet<u32>,
    /// OOM kill counter seen in the previous sample.
    pub oom_kills: u64,
    /// `pids.max` hit counter seen in the previous sample.
    pub pids_max_hits: u64,
    /// Job-wide user time limit, in microseconds.
    pub job_time_limit_usec: Option<u64>,
    /// Whether the job time limit was already reported.
    pub job_time_reported: bool,
    /// Total CPU usage seen in the previous sample, in microseconds.
    pub usage_usec: u64,
    /// Whether the cgroup was reported empty and nothing has joined since.
    pub zero_reported: bool,
    /// Limits applied to every new member.
    pub member_limits: MemberLimits,
}

impl WatchedCgroup {
    /// Starts watching a cgroup with its current members as the baseline.
    #[must_use]
    pub fn new(path: PathBuf, members: BTreeSet<u32>) -> Self {
        Self {
            path,
            members,
            oom_kills: 0,
            pids_max_hits: 0,
            job_time_limit_usec: None,
            job_time_reported: false,
            usage_usec: 0,
            zero_reported: false,
            member_limits: MemberLimits::default(),
        }
    }
}

/// One sample of a cgroup's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Members, or `None` if the cgroup disappeared.
    pub procs: Option<BTreeSet<u32>>,
    /// OOM kill counter.
    pub oom_kills: u64,
    /// `pids.max` hit counter.
    pub pids_max_hits: u64,
    /// Consumed user time, in microseconds.
    pub user_usec: u64,
    /// Total consumed CPU time, in microseconds.
    pub usage_usec: u64,
}

impl Observation {
    /// Samples the cgroup at `path`.
    #[must_use]
    pub fn sample(path: &Path) -> Self {
        Self {
            procs: pids::read_procs(path).ok(),
            oom_kills: memory::oom_kill_count(path),
            pids_max_hits: pids::max_events(path),
            user_usec: cpu::user_usec(path),
            usage_usec: cpu::usage_usec(path),
        }
    }
}

/// Messages and actions derived from one observation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WatchOutcome {
    /// `(message, pid)` pairs to post, in order.
    pub messages: Vec<(u32, u32)>,
    /// Processes that joined since the previous sample.
    pub new_members: Vec<u32>,
    /// Whether the job must be killed for exceeding its time limit.
    pub kill: bool,
}

/// Compares an observation with the previous state and updates the state.
pub fn diff(state: &mut WatchedCgroup, observation: Observation) -> WatchOutcome {
    let mut outcome = WatchOutcome::default();
    let procs = observation.procs.unwrap_or_default();

    for &pid in procs.difference(&state.members) {
        outcome.messages.push((message::NEW_PROCESS, pid));
        outcome.new_members.push(pid);
    }
    // cgroup.procs carries no exit status, so no exit is reported abnormal.
    for &pid in state.members.difference(&procs) {
        outcome.messages.push((message::EXIT_PROCESS, pid));
    }
    // Processes that joined and exited between two samples never show up
    // in cgroup.procs, but their CPU time does.
    let ran_unseen = observation.usage_usec > state.usage_usec;
    if procs.is_empty() {
        if !state.members.is_empty() || (ran_unseen && !state.zero_reported) {
            outcome.messages.push((message::ACTIVE_PROCESS_ZERO, 0));
            state.zero_reported = true;
        }
    } else {
        state.zero_reported = false;
    }
    state.members = procs;
    state.usage_usec = state.usage_usec.max(observation.usage_usec);

    if observation.oom_kills > state.oom_kills {
        outcome.messages.push((message::JOB_MEMORY_LIMIT, 0));
        state.oom_kills = observation.oom_kills;
    }
    if observation.pids_max_hits > state.pids_max_hits {
        outcome.messages.push((message::ACTIVE_PROCESS_LIMIT, 0));
        state.pids_max_hits = observation.pids_max_hits;
    }
    if let Some(limit) = state.job_time_limit_usec {
        if observation.user_usec >= limit && !state.job_time_reported {
            outcome.messages.push((message::END_OF_JOB_TIME, 0));
            state.job_time_reported = true;
            outcome.kill = true;
        }
    }
    outcome
}

pub(crate) type WatchTable = Arc<Mutex<HashMap<JobHandle, WatchedCgroup>>>;

/// Background sampling thread; stopped and joined on drop.
#[derive(Debug)]
pub(crate) struct Watcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    pub(crate) fn spawn(
        table: WatchTable,
        sender: CompletionSender,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("procgov-cgroup-watcher".into())
            .spawn(move || {
                tracing::debug!(?interval, "cgroup watcher started");
                while !flag.load(Ordering::Relaxed) {
                    sample_all(&table, &sender);
                    std::thread::sleep(interval);
                }
                tracing::debug!("cgroup watcher stopped");
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("cgroup watcher panicked");
            }
        }
    }
}

fn sample_all(table: &WatchTable, sender: &CompletionSender) {
    let targets: Vec<(JobHandle, PathBuf)> = table
        .lock()
        .iter()
        .map(|(handle, watched)| (*handle, watched.path.clone()))
        .collect();

    for (handle, path) in targets {
        let observation = Observation::sample(&path);
        let (outcome, limits) = {
            let mut table = table.lock();
            let Some(state) = table.get_mut(&handle) else {
                continue;
            };
            (diff(state, observation), state.member_limits)
        };

        if !limits.is_empty() {
            for &pid in &outcome.new_members {
                limits.apply_to(pid);
            }
        }
        if outcome.kill {
            if let Err(e) = super::kill_cgroup(&path) {
                tracing::warn!(%handle, error = %e, "failed to kill job over its time limit");
            }
        }
        for (msg, pid) in outcome.messages {
            sender.post(handle, msg, pid);
        }
    }
}
