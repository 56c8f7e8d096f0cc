//! Job registry.
//!
//! Three indices (handle to job, name to handle, pid to handle) behind a
//! single mutex. Every operation updates all affected indices before the
//! lock is released, and nothing outside this module touches the maps.
//! Native handles removed from the registry are dropped after the lock is
//! released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use procgov_common::types::{JobHandle, JobSettings};
use procgov_core::job::NativeJob;

#[derive(Debug)]
struct JobEntry {
    job: Arc<dyn NativeJob>,
    name: String,
    settings: JobSettings,
    members: usize,
    created_at: Instant,
    deadline: Option<Instant>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job: Arc::clone(&self.job),
            handle: self.job.handle(),
            name: self.name.clone(),
            settings: self.settings.clone(),
            members: self.members,
        }
    }
}

fn deadline_for(created_at: Instant, settings: &JobSettings) -> Option<Instant> {
    (settings.clock_time_limit_ms > 0)
        .then(|| created_at + Duration::from_millis(settings.clock_time_limit_ms))
}

/// Point-in-time copy of a registered job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Native job.
    pub job: Arc<dyn NativeJob>,
    /// Completion key.
    pub handle: JobHandle,
    /// Job name.
    pub name: String,
    /// Stored settings.
    pub settings: JobSettings,
    /// Tracked member count.
    pub members: usize,
}

/// Result of a member join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberJoin {
    /// Members of the joined job.
    pub members: usize,
    /// Job removed because its last member moved to the joined job.
    pub vacated: Option<String>,
}

/// Result of a member exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberExit {
    /// Job the process belonged to.
    pub handle: JobHandle,
    /// Name of that job.
    pub name: String,
    /// Members left; `0` means the job was removed.
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    jobs: HashMap<JobHandle, JobEntry>,
    names: HashMap<String, JobHandle>,
    pids: HashMap<u32, JobHandle>,
}

impl RegistryState {
    fn detach(&mut self, handle: JobHandle) -> Option<JobEntry> {
        let entry = self.jobs.remove(&handle)?;
        if self.names.get(&entry.name) == Some(&handle) {
            let _ = self.names.remove(&entry.name);
        }
        let before = self.pids.len();
        self.pids.retain(|_, h| *h != handle);
        let stale = before - self.pids.len();
        if stale > 0 {
            tracing::warn!(job = %entry.name, stale, "removed job still had pid entries");
        }
        Some(entry)
    }
}

/// Authoritative in-memory state of the supervisor.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job or replaces the settings of the job with that name.
    ///
    /// A different job already registered under the same name is removed
    /// first. Returns the number of tracked jobs.
    pub fn upsert(&self, job: Arc<dyn NativeJob>, settings: JobSettings) -> usize {
        let handle = job.handle();
        let name = job.name().to_owned();
        let (count, displaced) = {
            let mut state = self.state.lock();
            let displaced = match state.names.get(&name).copied() {
                Some(existing) if existing != handle => state.detach(existing),
                _ => None,
            };
            if let Some(entry) = state.jobs.get_mut(&handle) {
                entry.deadline = deadline_for(entry.created_at, &settings);
                entry.settings = settings;
            } else {
                let created_at = Instant::now();
                let _ = state.names.insert(name.clone(), handle);
                let _ = state.jobs.insert(
                    handle,
                    JobEntry {
                        job,
                        name: name.clone(),
                        deadline: deadline_for(created_at, &settings),
                        settings,
                        members: 0,
                        created_at,
                    },
                );
            }
            (state.jobs.len(), displaced)
        };
        if let Some(old) = displaced {
            tracing::warn!(job = %name, old = %old.job.handle(), "replaced job registered under the same name");
        }
        count
    }

    /// Replaces the settings of a registered job. Returns `false` if unknown.
    pub fn update_settings(&self, handle: JobHandle, settings: JobSettings) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.jobs.get_mut(&handle) else {
            return false;
        };
        entry.deadline = deadline_for(entry.created_at, &settings);
        entry.settings = settings;
        true
    }

    /// Records that `pid` joined the job. Returns `None` if the job is not
    /// registered.
    ///
    /// A pid tracked under another job is moved; that job is removed if the
    /// move left it without members.
    pub fn member_joined(&self, pid: u32, handle: JobHandle) -> Option<MemberJoin> {
        let (join, vacated) = {
            let mut state = self.state.lock();
            if !state.jobs.contains_key(&handle) {
                return None;
            }
            let mut vacated = None;
            match state.pids.insert(pid, handle) {
                Some(previous) if previous == handle => {}
                Some(previous) => {
                    tracing::warn!(pid, from = %previous, to = %handle, "process moved between jobs");
                    let emptied = state.jobs.get_mut(&previous).is_some_and(|old| {
                        old.members = old.members.saturating_sub(1);
                        old.members == 0
                    });
                    if emptied {
                        vacated = state.detach(previous);
                    }
                    state.jobs.get_mut(&handle)?.members += 1;
                }
                None => state.jobs.get_mut(&handle)?.members += 1,
            }
            let members = state.jobs.get(&handle).map_or(0, |entry| entry.members);
            let join = MemberJoin {
                members,
                vacated: vacated.as_ref().map(|entry| entry.name.clone()),
            };
            (join, vacated)
        };
        if let Some(old) = vacated {
            tracing::info!(job = %old.name, "last member moved away, job removed");
        }
        Some(join)
    }

    /// Records that `pid` exited. Removes its job when no member is left.
    ///
    /// Returns `None` if the pid was not tracked.
    pub fn member_exited(&self, pid: u32) -> Option<MemberExit> {
        let (exit, removed) = {
            let mut state = self.state.lock();
            let handle = state.pids.remove(&pid)?;
            let entry = state.jobs.get_mut(&handle)?;
            entry.members = entry.members.saturating_sub(1);
            let exit = MemberExit {
                handle,
                name: entry.name.clone(),
                remaining: entry.members,
            };
            let removed = if exit.remaining == 0 {
                state.detach(handle)
            } else {
                None
            };
            (exit, removed)
        };
        if removed.is_some() {
            tracing::info!(job = %exit.name, "last member exited, job removed");
        }
        Some(exit)
    }

    /// Removes a job and all pid entries pointing at it.
    ///
    /// Returns the removed job's name, or `None` if it was not registered.
    pub fn remove(&self, handle: JobHandle) -> Option<String> {
        let removed = self.state.lock().detach(handle)?;
        tracing::info!(job = %removed.name, %handle, "job removed");
        Some(removed.name)
    }

    /// Looks up a job by completion key.
    #[must_use]
    pub fn job_by_handle(&self, handle: JobHandle) -> Option<JobSnapshot> {
        self.state.lock().jobs.get(&handle).map(JobEntry::snapshot)
    }

    /// Looks up a job by name.
    #[must_use]
    pub fn job_by_name(&self, name: &str) -> Option<JobSnapshot> {
        let state = self.state.lock();
        let handle = state.names.get(name)?;
        state.jobs.get(handle).map(JobEntry::snapshot)
    }

    /// Looks up the job a process belongs to.
    #[must_use]
    pub fn job_for_pid(&self, pid: u32) -> Option<JobSnapshot> {
        let state = self.state.lock();
        let handle = state.pids.get(&pid)?;
        state.jobs.get(handle).map(JobEntry::snapshot)
    }

    /// Pids tracked for a job, sorted.
    #[must_use]
    pub fn pids_of(&self, handle: JobHandle) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .state
            .lock()
            .pids
            .iter()
            .filter_map(|(pid, h)| (*h == handle).then_some(*pid))
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Number of tracked jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Returns whether no job is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    /// Jobs that never had a member and were registered at least `grace`
    /// before `now`.
    #[must_use]
    pub fn memberless(&self, now: Instant, grace: Duration) -> Vec<JobSnapshot> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|entry| {
                entry.members == 0 && now.saturating_duration_since(entry.created_at) >= grace
            })
            .map(JobEntry::snapshot)
            .collect()
    }

    /// Removes a job if it still has no member. Returns its name if removed.
    pub fn remove_if_memberless(&self, handle: JobHandle) -> Option<String> {
        let removed = {
            let mut state = self.state.lock();
            if state.jobs.get(&handle)?.members > 0 {
                return None;
            }
            state.detach(handle)?
        };
        tracing::info!(job = %removed.name, %handle, "memberless job removed");
        Some(removed.name)
    }

    /// Jobs whose clock deadline passed. Each deadline is reported once.
    pub fn take_expired(&self, now: Instant) -> Vec<JobSnapshot> {
        let mut state = self.state.lock();
        state
            .jobs
            .values_mut()
            .filter(|entry| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|entry| {
                entry.deadline = None;
                entry.snapshot()
            })
            .collect()
    }

    /// Removes every job, returning the native handles for disposal.
    pub fn drain(&self) -> Vec<Arc<dyn NativeJob>> {
        let mut state = self.state.lock();
        state.names.clear();
        state.pids.clear();
        state.jobs.drain().map(|(_, entry)| entry.job).collect()
    }
}
