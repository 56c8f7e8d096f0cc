//! Placing processes under a job.
//!
//! Adoption runs in the client. Target processes that already run in a
//! job pull the request into that job instead of creating a new one:
//!
//! 1. every target is validated (it exists and matches the governor's
//!    bitness);
//! 2. each target's job is discovered, first from the supervisor and then
//!    from the job marker in the process environment, which is only
//!    trusted if the job still contains the process;
//! 3. one discovered job is adopted, two distinct ones are a conflict, and
//!    a requested name must match the discovered one;
//! 4. the job is created or updated through the supervisor and the targets
//!    that are not members yet are assigned to it.
//!
//! Nothing is mutated until the first three steps succeed. A target that
//! cannot be assigned in the last step is logged and skipped.

use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::{JobSettings, generate_job_name};
use procgov_core::job::JobBackend;
use procgov_core::process::ProcessInspector;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::GatewayClient;
use crate::event::EventListener;

/// What to adopt and under which limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdoptionRequest {
    /// Desired job name.
    pub name: Option<String>,
    /// Target processes.
    pub pids: Vec<u32>,
    /// Limits merged onto the job.
    pub settings: JobSettings,
}

/// Outcome of an adoption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdoptionReport {
    /// Resolved job name.
    pub name: String,
    /// Targets assigned to the job by this adoption.
    pub assigned: Vec<u32>,
    /// Targets that were members already.
    pub already_members: Vec<u32>,
    /// Targets that could not be assigned.
    pub skipped: Vec<u32>,
}

/// Adopts processes through a supervisor connection and a job facility.
#[derive(Debug, Clone, Copy)]
pub struct Adopter<'a> {
    backend: &'a dyn JobBackend,
    inspector: &'a ProcessInspector,
}

impl<'a> Adopter<'a> {
    /// Creates an adopter.
    #[must_use]
    pub const fn new(backend: &'a dyn JobBackend, inspector: &'a ProcessInspector) -> Self {
        Self { backend, inspector }
    }

    /// Adopts the targets of `request`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid targets,
    /// [`ProcgovError::JobConflict`] or [`ProcgovError::JobNameMismatch`]
    /// when discovery disagrees, the supervisor's rejection of the settings,
    /// or [`ProcgovError::NothingAssigned`] if no target could be assigned.
    pub async fn adopt<S>(
        &self,
        client: &mut GatewayClient<S>,
        request: &AdoptionRequest,
    ) -> Result<AdoptionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.resolve(client, request).await?;
        let name = client.monitor_job(&name, &request.settings).await?;
        self.assign(&name, &request.pids)
    }

    /// Adopts the targets of `request` and subscribes to the job before
    /// assigning them, so that no notification is missed.
    ///
    /// # Errors
    ///
    /// Same as [`adopt`](Self::adopt).
    pub async fn adopt_and_subscribe<S>(
        &self,
        mut client: GatewayClient<S>,
        request: &AdoptionRequest,
    ) -> Result<(AdoptionReport, EventListener<S>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.resolve(&mut client, request).await?;
        let listener = client.subscribe(&name, &request.settings).await?;
        let report = self.assign(listener.job(), &request.pids)?;
        Ok((report, listener))
    }

    /// Rejects targets that do not exist or whose bitness differs from
    /// the governor's.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first invalid target.
    pub fn validate_targets(&self, pids: &[u32]) -> Result<()> {
        if pids.is_empty() {
            return Err(ProcgovError::validation("no target process given"));
        }
        for &pid in pids {
            if !self.inspector.exists(pid) {
                return Err(ProcgovError::validation(format!(
                    "process {pid} does not exist"
                )));
            }
            self.inspector.ensure_same_bitness(pid)?;
        }
        Ok(())
    }

    /// Finds the job `pid` already runs in.
    ///
    /// # Errors
    ///
    /// Returns the transport or protocol error of the supervisor query.
    pub async fn discover<S>(
        &self,
        client: &mut GatewayClient<S>,
        pid: u32,
    ) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(name) = client.get_job_name(pid).await? {
            tracing::debug!(pid, job = %name, "supervisor tracks process");
            return Ok(Some(name));
        }

        let marker = match self.inspector.job_marker(pid) {
            Ok(Some(marker)) => marker,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::debug!(pid, error = %e, "job marker unreadable");
                return Ok(None);
            }
        };
        let contains = self
            .backend
            .open_job(&marker)
            .and_then(|job| job.map_or(Ok(false), |job| job.contains_process(pid)));
        match contains {
            Ok(true) => {
                tracing::debug!(pid, job = %marker, "job marker verified");
                Ok(Some(marker))
            }
            Ok(false) => {
                tracing::debug!(pid, job = %marker, "ignoring stale job marker");
                Ok(None)
            }
            Err(e) => {
                tracing::debug!(pid, job = %marker, error = %e, "job marker not verifiable");
                Ok(None)
            }
        }
    }

    async fn resolve<S>(
        &self,
        client: &mut GatewayClient<S>,
        request: &AdoptionRequest,
    ) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.validate_targets(&request.pids)?;
        let mut discovered: Vec<String> = Vec::new();
        for &pid in &request.pids {
            if let Some(name) = self.discover(client, pid).await? {
                if !discovered.contains(&name) {
                    discovered.push(name);
                }
            }
        }
        resolve_job_name(request.name.as_deref(), &discovered)
    }

    fn assign(&self, name: &str, pids: &[u32]) -> Result<AdoptionReport> {
        let job = self
            .backend
            .open_job(name)?
            .ok_or_else(|| ProcgovError::NotFound {
                kind: "job",
                id: name.to_owned(),
            })?;

        let mut report = AdoptionReport {
            name: name.to_owned(),
            ..AdoptionReport::default()
        };
        for &pid in pids {
            if report.assigned.contains(&pid) || report.already_members.contains(&pid) {
                continue;
            }
            if job.contains_process(pid).unwrap_or(false) {
                report.already_members.push(pid);
                continue;
            }
            match job.assign_process(pid) {
                Ok(()) => {
                    tracing::info!(job = %name, pid, "process assigned");
                    report.assigned.push(pid);
                }
                Err(e) => {
                    tracing::warn!(job = %name, pid, error = %e, "failed to assign process, skipping");
                    report.skipped.push(pid);
                }
            }
        }

        // The job already exists at this point; the supervisor drops it
        // once it stayed without members for its grace period.
        if report.assigned.is_empty() && report.already_members.is_empty() {
            return Err(ProcgovError::NothingAssigned {
                job: name.to_owned(),
                failed: report.skipped.len(),
            });
        }
        Ok(report)
    }
}

/// Chooses the job name from the requested and the discovered names.
///
/// # Errors
///
/// Returns [`ProcgovError::JobConflict`] if more than one job was
/// discovered, or [`ProcgovError::JobNameMismatch`] if the requested name
/// differs from the discovered one.
pub fn resolve_job_name(requested: Option<&str>, discovered: &[String]) -> Result<String> {
    let requested = requested.filter(|name| !name.is_empty());
    match (discovered, requested) {
        ([first, second, ..], _) => Err(ProcgovError::JobConflict {
            first: first.clone(),
            second: second.clone(),
        }),
        ([found], Some(requested)) if found != requested => Err(ProcgovError::JobNameMismatch {
            requested: requested.to_owned(),
            discovered: found.clone(),
        }),
        ([found], _) => Ok(found.clone()),
        ([], Some(requested)) => Ok(requested.to_owned()),
        ([], None) => Ok(generate_job_name()),
    }
}
