//! Completion multiplexer.
//!
//! One dedicated thread drains the backend's completion port for all jobs.
//! Raw completions are classified, applied to the registry and forwarded
//! as [`Notification`]s to the fanout task. The port is polled with a
//! bounded timeout so the cancellation token is checked every cycle; the
//! same loop terminates jobs past their clock deadline, drops jobs that
//! never gained a member within the grace period, and cancels the
//! supervisor once the registry stayed empty for the idle window.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use procgov_common::error::Result;
use procgov_common::types::{JobHandle, LimitKind};
use procgov_core::job::{CompletionPort, RawCompletion, message};
use procgov_ipc::protocol::Notification;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// Exit code given to jobs terminated for exceeding their clock time.
pub const CLOCK_LIMIT_EXIT_CODE: u32 = 1;

/// A classified completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A process joined.
    NewProcess {
        /// Joining process.
        pid: u32,
    },
    /// A member exited.
    ExitProcess {
        /// Exited process.
        pid: u32,
        /// Whether it exited abnormally.
        abnormal: bool,
    },
    /// The job has no member left.
    NoActiveProcesses,
    /// A job-wide limit was hit.
    JobLimit(LimitKind),
    /// A per-process limit was hit.
    ProcessLimit {
        /// Offending process.
        pid: u32,
        /// Exceeded limit.
        kind: LimitKind,
    },
}

impl JobEvent {
    /// Classifies a raw message code. Returns `None` for unknown codes.
    #[must_use]
    pub const fn classify(code: u32, pid: u32) -> Option<Self> {
        Some(match code {
            message::NEW_PROCESS => Self::NewProcess { pid },
            message::EXIT_PROCESS => Self::ExitProcess {
                pid,
                abnormal: false,
            },
            message::ABNORMAL_EXIT_PROCESS => Self::ExitProcess {
                pid,
                abnormal: true,
            },
            message::ACTIVE_PROCESS_ZERO => Self::NoActiveProcesses,
            message::ACTIVE_PROCESS_LIMIT => Self::JobLimit(LimitKind::ActiveProcessNumber),
            message::JOB_MEMORY_LIMIT => Self::JobLimit(LimitKind::Memory),
            message::END_OF_JOB_TIME => Self::JobLimit(LimitKind::CpuTime),
            message::PROCESS_MEMORY_LIMIT => Self::ProcessLimit {
                pid,
                kind: LimitKind::Memory,
            },
            message::END_OF_PROCESS_TIME => Self::ProcessLimit {
                pid,
                kind: LimitKind::CpuTime,
            },
            _ => return None,
        })
    }
}

/// Drains the completion port and keeps the registry current.
pub struct Multiplexer {
    registry: Arc<Registry>,
    port: Arc<dyn CompletionPort>,
    events: UnboundedSender<Notification>,
    cancel: CancellationToken,
    poll_interval: Duration,
    idle_timeout: Duration,
    memberless_grace: Duration,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("poll_interval", &self.poll_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("memberless_grace", &self.memberless_grace)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Creates a multiplexer.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        port: Arc<dyn CompletionPort>,
        events: UnboundedSender<Notification>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            port,
            events,
            cancel,
            poll_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(10),
            memberless_grace: Duration::from_secs(10),
        }
    }

    /// Sets the completion-port poll timeout.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long the registry may stay empty before shutdown.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets how long a job may stay without members before it is dropped.
    #[must_use]
    pub const fn memberless_grace(mut self, grace: Duration) -> Self {
        self.memberless_grace = grace;
        self
    }

    /// Starts the loop on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<()>>> {
        std::thread::Builder::new()
            .name("procgov-multiplexer".into())
            .spawn(move || self.run())
    }

    /// Runs until cancelled, idle, or the completion port fails.
    ///
    /// # Errors
    ///
    /// Returns the port error; the supervisor is cancelled as well.
    pub fn run(self) -> Result<()> {
        tracing::info!(idle_timeout = ?self.idle_timeout, "multiplexer started");
        let mut last_busy = Instant::now();
        while !self.cancel.is_cancelled() {
            match self.port.poll(self.poll_interval) {
                Ok(Some(raw)) => {
                    let events = self.process(raw);
                    self.forward(events);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "completion port failed, shutting down");
                    self.cancel.cancel();
                    return Err(e);
                }
            }

            let now = Instant::now();
            self.enforce_deadlines(now);
            let reaped = self.reap_memberless(now);
            self.forward(reaped);
            if !self.registry.is_empty() {
                last_busy = now;
            } else if now.duration_since(last_busy) >= self.idle_timeout {
                tracing::info!("no job tracked for the idle window, shutting down");
                self.cancel.cancel();
            }
        }
        tracing::info!("multiplexer stopped");
        Ok(())
    }

    fn forward(&self, events: Vec<Notification>) {
        for event in events {
            if self.events.send(event).is_err() {
                tracing::debug!("fanout closed, notification dropped");
            }
        }
    }

    /// Applies one raw completion and returns the notifications it produces.
    pub fn process(&self, raw: RawCompletion) -> Vec<Notification> {
        let Some(event) = JobEvent::classify(raw.message, raw.pid) else {
            tracing::warn!(job = %raw.key, code = raw.message, pid = raw.pid, "unknown completion message");
            return Vec::new();
        };
        tracing::debug!(job = %raw.key, ?event, "completion");

        match event {
            JobEvent::NewProcess { pid } => {
                let Some(name) = self.job_name(raw.key) else {
                    return Vec::new();
                };
                let vacated = self
                    .registry
                    .member_joined(pid, raw.key)
                    .and_then(|join| join.vacated);
                let mut events = vec![Notification::NewProcess { name, pid }];
                if let Some(name) = vacated {
                    events.push(Notification::NoActiveProcesses { name });
                }
                events
            }
            JobEvent::ExitProcess { pid, abnormal } => self.exited(raw.key, pid, abnormal),
            JobEvent::NoActiveProcesses => self
                .registry
                .remove(raw.key)
                .map(|name| Notification::NoActiveProcesses { name })
                .into_iter()
                .collect(),
            JobEvent::JobLimit(kind) => self
                .job_name(raw.key)
                .map(|name| Notification::JobLimitExceeded { name, kind })
                .into_iter()
                .collect(),
            JobEvent::ProcessLimit { pid, kind } => self
                .job_name(raw.key)
                .map(|name| Notification::ProcessLimitExceeded { name, pid, kind })
                .into_iter()
                .collect(),
        }
    }

    fn exited(&self, key: JobHandle, pid: u32, abnormal: bool) -> Vec<Notification> {
        if let Some(exit) = self.registry.member_exited(pid) {
            let mut events = vec![Notification::ExitProcess {
                name: exit.name.clone(),
                pid,
                abnormal,
            }];
            if exit.remaining == 0 {
                events.push(Notification::NoActiveProcesses { name: exit.name });
            }
            return events;
        }
        // Members that joined before the job was registered are not indexed.
        self.job_name(key)
            .map(|name| Notification::ExitProcess {
                name,
                pid,
                abnormal,
            })
            .into_iter()
            .collect()
    }

    fn job_name(&self, key: JobHandle) -> Option<String> {
        let name = self.registry.job_by_handle(key).map(|job| job.name);
        if name.is_none() {
            tracing::debug!(job = %key, "completion for an untracked job");
        }
        name
    }

    /// Checks jobs that stayed without members past the grace period.
    ///
    /// Processes the job holds natively but the registry never heard about
    /// are indexed; a job that is empty natively too is removed and its
    /// subscribers get the terminal event.
    pub fn reap_memberless(&self, now: Instant) -> Vec<Notification> {
        let mut events = Vec::new();
        for job in self.registry.memberless(now, self.memberless_grace) {
            let pids = job.job.processes().unwrap_or_else(|e| {
                tracing::warn!(job = %job.name, error = %e, "cannot list job members");
                Vec::new()
            });
            if pids.is_empty() {
                if let Some(name) = self.registry.remove_if_memberless(job.handle) {
                    events.push(Notification::NoActiveProcesses { name });
                }
                continue;
            }
            tracing::debug!(job = %job.name, count = pids.len(), "indexing unreported members");
            for pid in pids {
                if let Some(join) = self.registry.member_joined(pid, job.handle) {
                    events.push(Notification::NewProcess {
                        name: job.name.clone(),
                        pid,
                    });
                    if let Some(name) = join.vacated {
                        events.push(Notification::NoActiveProcesses { name });
                    }
                }
            }
        }
        events
    }

    fn enforce_deadlines(&self, now: Instant) {
        for job in self.registry.take_expired(now) {
            tracing::warn!(job = %job.name, "clock time limit reached, terminating job");
            if let Err(e) = job.job.terminate(CLOCK_LIMIT_EXIT_CODE) {
                tracing::error!(job = %job.name, error = %e, "failed to terminate job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgov_common::types::JobSettings;
    use procgov_core::job::JobBackend;
    use procgov_core::sim::SimulatedBackend;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<SimulatedBackend>, Arc<Registry>, Multiplexer, JobHandle) {
        let backend = Arc::new(SimulatedBackend::new());
        let registry = Arc::new(Registry::new());
        let job = backend.create_job("j").unwrap();
        let handle = job.handle();
        let _ = registry.upsert(job, JobSettings::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(
            Arc::clone(&registry),
            backend.completion_port(),
            tx,
            CancellationToken::new(),
        );
        (backend, registry, mux, handle)
    }

    fn raw(key: JobHandle, message: u32, pid: u32) -> RawCompletion {
        RawCompletion { key, message, pid }
    }

    #[test]
    fn classify_known_and_unknown_codes() {
        assert_eq!(
            JobEvent::classify(message::ABNORMAL_EXIT_PROCESS, 4),
            Some(JobEvent::ExitProcess {
                pid: 4,
                abnormal: true
            })
        );
        assert_eq!(
            JobEvent::classify(message::JOB_MEMORY_LIMIT, 0),
            Some(JobEvent::JobLimit(LimitKind::Memory))
        );
        assert_eq!(JobEvent::classify(5, 0), None);
        assert_eq!(JobEvent::classify(42, 0), None);
    }

    #[test]
    fn last_exit_synthesizes_no_active_processes() {
        let (_backend, registry, mux, handle) = setup();
        let _ = mux.process(raw(handle, message::NEW_PROCESS, 1));
        let events = mux.process(raw(handle, message::EXIT_PROCESS, 1));
        assert_eq!(
            events,
            vec![
                Notification::ExitProcess {
                    name: "j".into(),
                    pid: 1,
                    abnormal: false
                },
                Notification::NoActiveProcesses { name: "j".into() },
            ]
        );
        assert!(registry.is_empty());

        // The facility's own zero-members message now finds nothing to do.
        assert!(mux.process(raw(handle, message::ACTIVE_PROCESS_ZERO, 0)).is_empty());
    }

    #[test]
    fn limit_events_carry_the_job_name() {
        let (_backend, _registry, mux, handle) = setup();
        assert_eq!(
            mux.process(raw(handle, message::END_OF_PROCESS_TIME, 9)),
            vec![Notification::ProcessLimitExceeded {
                name: "j".into(),
                pid: 9,
                kind: LimitKind::CpuTime
            }]
        );
        assert_eq!(
            mux.process(raw(handle, message::ACTIVE_PROCESS_LIMIT, 0)),
            vec![Notification::JobLimitExceeded {
                name: "j".into(),
                kind: LimitKind::ActiveProcessNumber
            }]
        );
    }

    #[test]
    fn unknown_codes_and_jobs_are_ignored() {
        let (_backend, registry, mux, handle) = setup();
        assert!(mux.process(raw(handle, 77, 0)).is_empty());
        assert!(mux.process(raw(JobHandle::new(999), message::NEW_PROCESS, 3)).is_empty());
        assert!(registry.job_for_pid(3).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn expired_jobs_are_terminated() {
        let (backend, registry, mux, handle) = setup();
        let job = registry.job_by_handle(handle).unwrap().job;
        job.assign_process(5).unwrap();
        let settings = JobSettings {
            clock_time_limit_ms: 1,
            ..JobSettings::default()
        };
        assert!(registry.update_settings(handle, settings));
        mux.enforce_deadlines(Instant::now() + Duration::from_secs(1));
        assert_eq!(backend.terminated_with("j"), Some(CLOCK_LIMIT_EXIT_CODE));
        assert!(backend.members("j").is_empty());
    }

    #[test]
    fn job_without_members_is_dropped_after_grace() {
        let (backend, registry, mux, _handle) = setup();
        let mux = mux.memberless_grace(Duration::from_secs(1));

        assert!(mux.reap_memberless(Instant::now()).is_empty());
        assert_eq!(registry.len(), 1);

        let events = mux.reap_memberless(Instant::now() + Duration::from_secs(2));
        assert_eq!(events, vec![Notification::NoActiveProcesses { name: "j".into() }]);
        assert!(registry.is_empty());
        assert!(backend.is_released("j"));
    }

    #[test]
    fn unreported_native_members_are_indexed_instead_of_dropped() {
        let (_backend, registry, mux, handle) = setup();
        let mux = mux.memberless_grace(Duration::ZERO);
        registry.job_by_handle(handle).unwrap().job.assign_process(12).unwrap();

        let events = mux.reap_memberless(Instant::now());
        assert_eq!(events, vec![Notification::NewProcess { name: "j".into(), pid: 12 }]);
        assert_eq!(registry.job_for_pid(12).unwrap().members, 1);

        // The backend's own new-process message is then a no-op for the count.
        let _ = mux.process(raw(handle, message::NEW_PROCESS, 12));
        assert_eq!(registry.job_by_handle(handle).unwrap().members, 1);
    }

    #[test]
    fn moving_a_pid_ends_the_job_it_left() {
        let (backend, registry, mux, first) = setup();
        let second_job = backend.create_job("k").unwrap();
        let second = second_job.handle();
        let _ = registry.upsert(second_job, JobSettings::default());

        let _ = mux.process(raw(first, message::NEW_PROCESS, 3));
        let events = mux.process(raw(second, message::NEW_PROCESS, 3));
        assert_eq!(
            events,
            vec![
                Notification::NewProcess { name: "k".into(), pid: 3 },
                Notification::NoActiveProcesses { name: "j".into() },
            ]
        );
        assert!(registry.job_by_handle(first).is_none());
    }

    #[test]
    fn idle_registry_cancels_the_supervisor() {
        let backend = SimulatedBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mux = Multiplexer::new(
            Arc::new(Registry::new()),
            backend.completion_port(),
            tx,
            cancel.clone(),
        )
        .poll_interval(Duration::from_millis(5))
        .idle_timeout(Duration::from_millis(30));

        let started = Instant::now();
        mux.run().unwrap();
        assert!(cancel.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
