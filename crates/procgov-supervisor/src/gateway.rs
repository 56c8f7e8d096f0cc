//! IPC gateway.
//!
//! Each accepted connection runs a small state machine: requests are read
//! and answered one at a time until the peer disconnects, the supervisor is
//! cancelled, or a `MonitorJob` with `subscribe` set hands the write side
//! of the connection to the [`Notifier`]. Transport and protocol errors end
//! only the connection they occur on.

use std::sync::Arc;

use futures::StreamExt;
use procgov_common::error::Result;
use procgov_common::types::{JobSettings, generate_job_name};
use procgov_core::job::JobBackend;
use procgov_core::topology::SystemTopology;
use procgov_core::translator::set_limits;
use procgov_ipc::codec::{WireCodec, encode_message};
use procgov_ipc::protocol::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::notifier::Notifier;
use crate::registry::Registry;

/// Request dispatcher shared by all connections.
pub struct Gateway {
    registry: Arc<Registry>,
    notifier: Arc<Notifier>,
    backend: Arc<dyn JobBackend>,
    topology: Arc<dyn SystemTopology>,
    cancel: CancellationToken,
    monitor: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.registry)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Creates a gateway over the shared supervisor state.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        notifier: Arc<Notifier>,
        backend: Arc<dyn JobBackend>,
        topology: Arc<dyn SystemTopology>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            notifier,
            backend,
            topology,
            cancel,
            monitor: tokio::sync::Mutex::new(()),
        }
    }

    /// Accepts connections until cancelled, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let gateway = Arc::clone(&self);
                        let _task = tokio::spawn(async move {
                            if let Err(e) = gateway.handle_connection(stream).await {
                                tracing::warn!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
        tracing::debug!("gateway stopped accepting connections");
    }

    /// Runs the request loop of one connection.
    ///
    /// # Errors
    ///
    /// Returns the transport or protocol error that ended the connection.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut requests = FramedRead::new(reader, WireCodec::<Request>::new());

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                next = requests.next() => next,
            };
            let Some(request) = next else {
                tracing::trace!("client disconnected");
                return Ok(());
            };

            match request? {
                Request::MonitorJob {
                    name,
                    subscribe,
                    settings,
                } => {
                    let response = match self.monitor_job(&name, &settings).await {
                        Ok(name) => Response::MonitorJob { name },
                        Err(e) => {
                            tracing::warn!(job = %name, error = %e, "MonitorJob failed");
                            Response::Error {
                                message: e.to_string(),
                            }
                        }
                    };
                    write_response(&mut writer, &response).await?;
                    if let (true, Response::MonitorJob { name }) = (subscribe, &response) {
                        let _ = self.notifier.subscribe(name, writer);
                        return Ok(());
                    }
                }
                Request::GetJobName { pid } => {
                    let name = self.get_job_name(pid);
                    write_response(&mut writer, &Response::GetJobName { name }).await?;
                }
                Request::GetJobSettings { name } => {
                    let response = self.get_job_settings(&name);
                    write_response(&mut writer, &response).await?;
                }
            }
        }
    }

    /// Creates the job or merges `settings` onto the existing one, then
    /// applies the result. Returns the resolved job name.
    ///
    /// Calls are serialized so concurrent requests for one name cannot both
    /// create it.
    ///
    /// # Errors
    ///
    /// Returns the native error of a failed creation or limit call.
    pub async fn monitor_job(&self, name: &str, settings: &JobSettings) -> Result<String> {
        let _serialized = self.monitor.lock().await;
        let name = if name.is_empty() {
            generate_job_name()
        } else {
            name.to_owned()
        };

        if let Some(existing) = self.registry.job_by_name(&name) {
            let merged = existing.settings.merge(settings);
            if merged == existing.settings {
                tracing::debug!(job = %name, "settings unchanged");
                return Ok(name);
            }
            let _ = set_limits(existing.job.as_ref(), &merged, self.topology.as_ref())?;
            let _ = self.registry.update_settings(existing.handle, merged);
            tracing::info!(job = %name, "job settings updated");
            return Ok(name);
        }

        let job = self.backend.create_job(&name)?;
        let _ = set_limits(job.as_ref(), settings, self.topology.as_ref())?;
        let handle = job.handle();
        let count = self.registry.upsert(job, settings.clone());
        tracing::info!(job = %name, %handle, jobs = count, "job created");
        Ok(name)
    }

    /// Name of the job governing `pid`, or empty if none.
    #[must_use]
    pub fn get_job_name(&self, pid: u32) -> String {
        self.registry
            .job_for_pid(pid)
            .map(|job| job.name)
            .unwrap_or_default()
    }

    /// Settings of job `name`; the response name is empty if it is unknown.
    #[must_use]
    pub fn get_job_settings(&self, name: &str) -> Response {
        self.registry.job_by_name(name).map_or_else(
            || Response::GetJobSettings {
                name: String::new(),
                settings: JobSettings::default(),
            },
            |job| Response::GetJobSettings {
                name: job.name,
                settings: job.settings,
            },
        )
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(response)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
