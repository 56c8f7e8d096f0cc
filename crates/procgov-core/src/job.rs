//! Job facility abstraction.
//!
//! A job is a kernel-backed resource container: a named group of processes
//! against which limits are enforced. Backends create jobs, configure them
//! through [`LimitCall`]s, and report lifecycle and limit-violation events
//! for all of their jobs on a single [`CompletionPort`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::{GroupAffinity, JobHandle, PriorityClass};

/// Completion message codes posted by the job facility.
pub mod message {
    /// The job exceeded its user-mode CPU time limit.
    pub const END_OF_JOB_TIME: u32 = 1;
    /// A process exceeded its user-mode CPU time limit.
    pub const END_OF_PROCESS_TIME: u32 = 2;
    /// Starting a process would exceed the active process limit.
    pub const ACTIVE_PROCESS_LIMIT: u32 = 3;
    /// The last member process exited.
    pub const ACTIVE_PROCESS_ZERO: u32 = 4;
    /// A process joined the job.
    pub const NEW_PROCESS: u32 = 6;
    /// A member process exited.
    pub const EXIT_PROCESS: u32 = 7;
    /// A member process exited abnormally.
    pub const ABNORMAL_EXIT_PROCESS: u32 = 8;
    /// A process exceeded its committed memory limit.
    pub const PROCESS_MEMORY_LIMIT: u32 = 9;
    /// The job exceeded its committed memory limit.
    pub const JOB_MEMORY_LIMIT: u32 = 10;
}

/// A raw completion packet as posted by the job facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    /// Completion key of the job the message concerns.
    pub key: JobHandle,
    /// One of the [`message`] codes, or an unknown value from a newer facility.
    pub message: u32,
    /// Process the message concerns; `0` for job-wide messages.
    pub pid: u32,
}

/// Flags selecting which fields of [`ExtendedLimits`] are in effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LimitFlags(u32);

impl LimitFlags {
    /// Working set bounds are set.
    pub const WORKINGSET: Self = Self(0x0000_0001);
    /// Per-process user time is limited.
    pub const PROCESS_TIME: Self = Self(0x0000_0002);
    /// Job-wide user time is limited.
    pub const JOB_TIME: Self = Self(0x0000_0004);
    /// Active process count is limited.
    pub const ACTIVE_PROCESS: Self = Self(0x0000_0008);
    /// Priority class is set.
    pub const PRIORITY_CLASS: Self = Self(0x0000_0020);
    /// Per-process committed memory is limited.
    pub const PROCESS_MEMORY: Self = Self(0x0000_0100);
    /// Job-wide committed memory is limited.
    pub const JOB_MEMORY: Self = Self(0x0000_0200);
    /// Child processes silently leave the job.
    pub const SILENT_BREAKAWAY_OK: Self = Self(0x0000_1000);

    /// No flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Returns whether no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Basic and extended limits, applied in a single native call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedLimits {
    /// Which of the fields below are in effect.
    pub flags: LimitFlags,
    /// Committed memory per process, in bytes.
    pub process_memory: u64,
    /// Committed memory for the job, in bytes.
    pub job_memory: u64,
    /// Minimum working set, in bytes.
    pub min_working_set: u64,
    /// Maximum working set, in bytes.
    pub max_working_set: u64,
    /// Maximum number of active processes.
    pub active_process_limit: u32,
    /// Priority class of members.
    pub priority_class: PriorityClass,
    /// Per-process user time, in 100-nanosecond ticks.
    pub per_process_user_time: u64,
    /// Job-wide user time, in 100-nanosecond ticks.
    pub per_job_user_time: u64,
}

/// One native configuration call. Each call is applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitCall {
    /// Memory, time, process count, priority and propagation limits.
    Extended(ExtendedLimits),
    /// Processor affinity per processor group.
    Affinity(Vec<GroupAffinity>),
    /// Hard CPU rate cap in hundredths of a percent of the whole machine.
    CpuRate {
        /// Cap value, `1..=10000`.
        hard_cap: u32,
    },
    /// Outbound network bandwidth cap.
    NetRate {
        /// Bytes per second.
        max_bandwidth: u64,
    },
}

/// A native job handle.
///
/// Handles returned by [`JobBackend::create_job`] own the job: dropping the
/// last reference releases it. Handles returned by [`JobBackend::open_job`]
/// only refer to it.
pub trait NativeJob: Send + Sync + fmt::Debug {
    /// Completion key of this job.
    fn handle(&self) -> JobHandle;

    /// Job name.
    fn name(&self) -> &str;

    /// Applies one limit call.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] with the OS error code if the call fails.
    fn apply(&self, call: &LimitCall) -> Result<()>;

    /// Moves a process into the job.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] if the process cannot be assigned.
    fn assign_process(&self, pid: u32) -> Result<()>;

    /// Returns whether a process currently belongs to the job.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] if membership cannot be queried.
    fn contains_process(&self, pid: u32) -> Result<bool>;

    /// Current member processes, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] if membership cannot be queried.
    fn processes(&self) -> Result<Vec<u32>>;

    /// Terminates every member process.
    ///
    /// Facilities that kill by signal cannot hand `exit_code` to the
    /// members; it is then only reported in logs.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] if termination fails.
    fn terminate(&self, exit_code: u32) -> Result<()>;
}

/// Single listener for completion messages of all jobs of a backend.
pub trait CompletionPort: Send + Sync {
    /// Waits up to `timeout` for the next completion.
    ///
    /// Returns `Ok(None)` when the timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is closed; the listener cannot recover.
    fn poll(&self, timeout: Duration) -> Result<Option<RawCompletion>>;
}

/// Platform job facility.
pub trait JobBackend: Send + Sync + fmt::Debug {
    /// Creates a job and associates it with the completion port.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] if the job cannot be created.
    fn create_job(&self, name: &str) -> Result<Arc<dyn NativeJob>>;

    /// Opens an existing job by name, or returns `None` if no such job exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Native`] if the lookup itself fails.
    fn open_job(&self, name: &str) -> Result<Option<Arc<dyn NativeJob>>>;

    /// The completion port all jobs of this backend report to.
    fn completion_port(&self) -> Arc<dyn CompletionPort>;
}

/// Hands out completion keys, starting at 1.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    /// Creates a new allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next unused handle.
    pub fn allocate(&self) -> JobHandle {
        JobHandle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of a [`ChannelCompletionPort`].
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<RawCompletion>,
}

impl CompletionSender {
    /// Posts a completion. Posting after the port is gone is a no-op.
    pub fn post(&self, key: JobHandle, message: u32, pid: u32) {
        if self.tx.send(RawCompletion { key, message, pid }).is_err() {
            tracing::trace!(%key, message, pid, "completion port closed, dropping message");
        }
    }
}

/// Completion port backed by an unbounded channel.
#[derive(Debug)]
pub struct ChannelCompletionPort {
    rx: Receiver<RawCompletion>,
}

/// Creates a connected sender/port pair.
#[must_use]
pub fn completion_channel() -> (CompletionSender, ChannelCompletionPort) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (CompletionSender { tx }, ChannelCompletionPort { rx })
}

impl CompletionPort for ChannelCompletionPort {
    fn poll(&self, timeout: Duration) -> Result<Option<RawCompletion>> {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => Ok(Some(completion)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ProcgovError::Native {
                operation: "get queued completion status",
                code: libc::EPIPE,
            }),
        }
    }
}
