//! In-memory job facility.
//!
//! [`SimulatedBackend`] behaves like a native facility without touching the
//! OS: jobs track their members in memory, every limit call is recorded,
//! and lifecycle messages are posted on a real completion port. It backs
//! the `--dry-run` mode and the supervisor tests, which drive process
//! lifecycles through the `exit_process`, `spawn_child` and `inject` hooks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::JobHandle;

use crate::job::{
    ChannelCompletionPort, CompletionPort, CompletionSender, HandleAllocator, JobBackend,
    LimitCall, LimitFlags, NativeJob, completion_channel, message,
};

#[derive(Debug)]
struct SimJobState {
    handle: JobHandle,
    members: Mutex<BTreeSet<u32>>,
    applied: Mutex<Vec<LimitCall>>,
    fail_next_apply: Mutex<Option<i32>>,
    released: AtomicBool,
    terminated_with: Mutex<Option<u32>>,
}

impl SimJobState {
    fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            members: Mutex::default(),
            applied: Mutex::default(),
            fail_next_apply: Mutex::default(),
            released: AtomicBool::new(false),
            terminated_with: Mutex::default(),
        }
    }

    /// Children stay in the job unless the last extended call allowed breakaway.
    fn keeps_children(&self) -> bool {
        self.applied
            .lock()
            .iter()
            .rev()
            .find_map(|call| match call {
                LimitCall::Extended(limits) => {
                    Some(!limits.flags.contains(LimitFlags::SILENT_BREAKAWAY_OK))
                }
                _ => None,
            })
            .unwrap_or(true)
    }

    fn active_process_limit(&self) -> Option<u32> {
        self.applied.lock().iter().rev().find_map(|call| match call {
            LimitCall::Extended(limits) if limits.flags.contains(LimitFlags::ACTIVE_PROCESS) => {
                Some(limits.active_process_limit)
            }
            _ => None,
        })
    }
}

/// Simulated job facility.
#[derive(Debug)]
pub struct SimulatedBackend {
    handles: HandleAllocator,
    sender: CompletionSender,
    port: Arc<ChannelCompletionPort>,
    jobs: Mutex<HashMap<String, Arc<SimJobState>>>,
    created: Mutex<Vec<String>>,
    vanished: Arc<Mutex<BTreeSet<u32>>>,
}

impl SimulatedBackend {
    /// Creates an empty facility.
    #[must_use]
    pub fn new() -> Self {
        let (sender, port) = completion_channel();
        Self {
            handles: HandleAllocator::new(),
            sender,
            port: Arc::new(port),
            jobs: Mutex::default(),
            created: Mutex::default(),
            vanished: Arc::default(),
        }
    }

    fn state(&self, name: &str) -> Option<Arc<SimJobState>> {
        self.jobs.lock().get(name).cloned()
    }

    fn live_state(&self, name: &str) -> Result<Arc<SimJobState>> {
        self.state(name)
            .filter(|state| !state.released.load(Ordering::SeqCst))
            .ok_or_else(|| ProcgovError::NotFound {
                kind: "job",
                id: name.to_owned(),
            })
    }

    /// Names passed to [`JobBackend::create_job`], in call order.
    #[must_use]
    pub fn created_jobs(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Limit calls applied to a job, in order.
    #[must_use]
    pub fn applied_calls(&self, name: &str) -> Vec<LimitCall> {
        self.state(name)
            .map(|state| state.applied.lock().clone())
            .unwrap_or_default()
    }

    /// Current members of a job.
    #[must_use]
    pub fn members(&self, name: &str) -> BTreeSet<u32> {
        self.state(name)
            .map(|state| state.members.lock().clone())
            .unwrap_or_default()
    }

    /// Returns whether the owning handle of a job was dropped.
    #[must_use]
    pub fn is_released(&self, name: &str) -> bool {
        self.state(name)
            .is_some_and(|state| state.released.load(Ordering::SeqCst))
    }

    /// Exit code passed to [`NativeJob::terminate`], if the job was terminated.
    #[must_use]
    pub fn terminated_with(&self, name: &str) -> Option<u32> {
        self.state(name).and_then(|state| *state.terminated_with.lock())
    }

    /// Makes the next limit call on a job fail with `code`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::NotFound`] if the job does not exist.
    pub fn fail_next_apply(&self, name: &str, code: i32) -> Result<()> {
        *self.live_state(name)?.fail_next_apply.lock() = Some(code);
        Ok(())
    }

    /// Makes assignments of `pid` to any job fail as if it had exited.
    pub fn vanish_process(&self, pid: u32) {
        let _ = self.vanished.lock().insert(pid);
    }

    /// Removes a process from a job as if it exited.
    ///
    /// Posts the exit message and, when the job becomes empty, the
    /// active-process-zero message. Unknown pids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::NotFound`] if the job does not exist.
    pub fn exit_process(&self, name: &str, pid: u32) -> Result<()> {
        let state = self.live_state(name)?;
        let mut members = state.members.lock();
        if members.remove(&pid) {
            self.sender.post(state.handle, message::EXIT_PROCESS, pid);
            if members.is_empty() {
                self.sender.post(state.handle, message::ACTIVE_PROCESS_ZERO, 0);
            }
        }
        Ok(())
    }

    /// Starts `child` from member `parent`.
    ///
    /// The child joins the job (and a new-process message is posted) only if
    /// the job keeps children. Returns whether the child joined.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::NotFound`] if the job does not exist, or a
    /// validation error if `parent` is not a member.
    pub fn spawn_child(&self, name: &str, parent: u32, child: u32) -> Result<bool> {
        let state = self.live_state(name)?;
        if !state.members.lock().contains(&parent) {
            return Err(ProcgovError::validation(format!(
                "process {parent} is not a member of job '{name}'"
            )));
        }
        if !state.keeps_children() {
            return Ok(false);
        }
        let _ = state.members.lock().insert(child);
        self.sender.post(state.handle, message::NEW_PROCESS, child);
        Ok(true)
    }

    /// Posts an arbitrary completion message.
    pub fn inject(&self, key: JobHandle, msg: u32, pid: u32) {
        self.sender.post(key, msg, pid);
    }

    fn job(&self, name: &str, state: Arc<SimJobState>, owned: bool) -> SimulatedJob {
        SimulatedJob {
            name: name.to_owned(),
            state,
            sender: self.sender.clone(),
            vanished: Arc::clone(&self.vanished),
            owned,
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBackend for SimulatedBackend {
    fn create_job(&self, name: &str) -> Result<Arc<dyn NativeJob>> {
        if name.is_empty() {
            return Err(ProcgovError::validation("job name must not be empty"));
        }
        let state = Arc::new(SimJobState::new(self.handles.allocate()));
        let _ = self.jobs.lock().insert(name.to_owned(), Arc::clone(&state));
        self.created.lock().push(name.to_owned());
        tracing::debug!(job = %name, handle = %state.handle, "simulated job created");
        Ok(Arc::new(self.job(name, state, true)))
    }

    fn open_job(&self, name: &str) -> Result<Option<Arc<dyn NativeJob>>> {
        Ok(self
            .state(name)
            .filter(|state| !state.released.load(Ordering::SeqCst))
            .map(|state| Arc::new(self.job(name, state, false)) as Arc<dyn NativeJob>))
    }

    fn completion_port(&self) -> Arc<dyn CompletionPort> {
        self.port.clone()
    }
}

/// Handle to a simulated job.
#[derive(Debug)]
pub struct SimulatedJob {
    name: String,
    state: Arc<SimJobState>,
    sender: CompletionSender,
    vanished: Arc<Mutex<BTreeSet<u32>>>,
    owned: bool,
}

impl NativeJob for SimulatedJob {
    fn handle(&self) -> JobHandle {
        self.state.handle
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, call: &LimitCall) -> Result<()> {
        if let Some(code) = self.state.fail_next_apply.lock().take() {
            return Err(ProcgovError::Native {
                operation: "set information job object",
                code,
            });
        }
        self.state.applied.lock().push(call.clone());
        Ok(())
    }

    fn assign_process(&self, pid: u32) -> Result<()> {
        if self.vanished.lock().contains(&pid) {
            return Err(ProcgovError::Native {
                operation: "assign process to job object",
                code: libc::ESRCH,
            });
        }
        let limit = self.state.active_process_limit();
        let mut members = self.state.members.lock();
        if members.contains(&pid) {
            return Ok(());
        }
        if limit.is_some_and(|limit| members.len() >= limit as usize) {
            self.sender
                .post(self.state.handle, message::ACTIVE_PROCESS_LIMIT, 0);
            return Err(ProcgovError::Native {
                operation: "assign process to job object",
                code: libc::EAGAIN,
            });
        }
        let _ = members.insert(pid);
        self.sender.post(self.state.handle, message::NEW_PROCESS, pid);
        Ok(())
    }

    fn contains_process(&self, pid: u32) -> Result<bool> {
        Ok(self.state.members.lock().contains(&pid))
    }

    fn processes(&self) -> Result<Vec<u32>> {
        Ok(self.state.members.lock().iter().copied().collect())
    }

    fn terminate(&self, exit_code: u32) -> Result<()> {
        *self.state.terminated_with.lock() = Some(exit_code);
        let mut members = self.state.members.lock();
        if members.is_empty() {
            return Ok(());
        }
        for pid in std::mem::take(&mut *members) {
            self.sender.post(self.state.handle, message::EXIT_PROCESS, pid);
        }
        self.sender
            .post(self.state.handle, message::ACTIVE_PROCESS_ZERO, 0);
        Ok(())
    }
}

impl Drop for SimulatedJob {
    fn drop(&mut self) {
        if self.owned {
            self.state.released.store(true, Ordering::SeqCst);
            tracing::debug!(job = %self.name, "simulated job released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::{ExtendedLimits, RawCompletion};

    fn drain(backend: &SimulatedBackend) -> Vec<(u32, u32)> {
        let port = backend.completion_port();
        let mut out = Vec::new();
        while let Some(RawCompletion { message, pid, .. }) =
            port.poll(Duration::from_millis(1)).unwrap()
        {
            out.push((message, pid));
        }
        out
    }

    fn breakaway() -> LimitCall {
        let mut limits = ExtendedLimits::default();
        limits.flags.insert(LimitFlags::SILENT_BREAKAWAY_OK);
        LimitCall::Extended(limits)
    }

    #[test]
    fn assign_and_exit_post_lifecycle_messages() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        job.assign_process(10).unwrap();
        backend.exit_process("a", 10).unwrap();
        assert_eq!(
            drain(&backend),
            vec![
                (message::NEW_PROCESS, 10),
                (message::EXIT_PROCESS, 10),
                (message::ACTIVE_PROCESS_ZERO, 0),
            ]
        );
    }

    #[test]
    fn children_follow_propagation_setting() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        job.assign_process(1).unwrap();
        assert!(backend.spawn_child("a", 1, 2).unwrap());

        job.apply(&breakaway()).unwrap();
        assert!(!backend.spawn_child("a", 1, 3).unwrap());
        assert_eq!(backend.members("a"), [1, 2].into_iter().collect());
    }

    #[test]
    fn failing_apply_is_reported_once() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        backend.fail_next_apply("a", 5).unwrap();
        assert!(matches!(
            job.apply(&breakaway()),
            Err(ProcgovError::Native { code: 5, .. })
        ));
        job.apply(&breakaway()).unwrap();
        assert_eq!(backend.applied_calls("a").len(), 1);
    }

    #[test]
    fn dropping_owner_releases_job() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        let opened = backend.open_job("a").unwrap().unwrap();
        drop(opened);
        assert!(!backend.is_released("a"));
        drop(job);
        assert!(backend.is_released("a"));
        assert!(backend.open_job("a").unwrap().is_none());
    }

    #[test]
    fn active_process_limit_rejects_extra_members() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        let mut limits = ExtendedLimits::default();
        limits.flags.insert(LimitFlags::ACTIVE_PROCESS);
        limits.active_process_limit = 1;
        job.apply(&LimitCall::Extended(limits)).unwrap();

        job.assign_process(1).unwrap();
        assert!(job.assign_process(2).is_err());
        assert!(drain(&backend).contains(&(message::ACTIVE_PROCESS_LIMIT, 0)));
    }

    #[test]
    fn vanished_process_cannot_be_assigned() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        backend.vanish_process(9);
        assert!(matches!(
            job.assign_process(9),
            Err(ProcgovError::Native { code: libc::ESRCH, .. })
        ));
        job.assign_process(3).unwrap();
        assert_eq!(job.processes().unwrap(), vec![3]);
    }

    #[test]
    fn terminate_empties_the_job() {
        let backend = SimulatedBackend::new();
        let job = backend.create_job("a").unwrap();
        job.assign_process(1).unwrap();
        job.assign_process(2).unwrap();
        job.terminate(1).unwrap();
        assert!(backend.members("a").is_empty());
        assert_eq!(backend.terminated_with("a"), Some(1));
        assert_eq!(drain(&backend).last(), Some(&(message::ACTIVE_PROCESS_ZERO, 0)));
    }
}
