//! Supervisor wiring.
//!
//! Builds the registry, notifier and gateway around one backend and runs
//! them under a shared cancellation token. The token is cancelled by the
//! caller (signals), by the multiplexer when idle, or when the completion
//! port fails. On the way out every tracked job handle is released and
//! subscriber channels are shut down.

use std::sync::Arc;
use std::thread::JoinHandle;

use procgov_common::config::SupervisorConfig;
use procgov_common::error::{ProcgovError, Result};
use procgov_core::job::JobBackend;
use procgov_core::topology::SystemTopology;
use procgov_ipc::endpoint;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::gateway::Gateway;
use crate::multiplexer::Multiplexer;
use crate::notifier::Notifier;
use crate::registry::Registry;

/// The job supervisor.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    backend: Arc<dyn JobBackend>,
    registry: Arc<Registry>,
    notifier: Arc<Notifier>,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
}

/// Background half of a running supervisor: the multiplexer thread and the
/// fanout task.
#[derive(Debug)]
pub struct EventLoop {
    multiplexer: JoinHandle<Result<()>>,
    fanout: tokio::task::JoinHandle<()>,
}

impl EventLoop {
    /// Waits for the multiplexer to stop and pending notifications to be
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns the multiplexer's error, if it stopped on one.
    pub async fn join(self) -> Result<()> {
        let multiplexer = self.multiplexer;
        let outcome = tokio::task::spawn_blocking(move || multiplexer.join())
            .await
            .map_err(|e| ProcgovError::Config {
                message: format!("multiplexer join task failed: {e}"),
            })?;
        if let Err(e) = self.fanout.await {
            tracing::error!(error = %e, "fanout task failed");
        }
        outcome.unwrap_or_else(|_| {
            Err(ProcgovError::Config {
                message: "multiplexer thread panicked".into(),
            })
        })
    }
}

impl Supervisor {
    /// Creates a supervisor over `backend`.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        backend: Arc<dyn JobBackend>,
        topology: Arc<dyn SystemTopology>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        let notifier = Arc::new(Notifier::new().write_timeout(config.notify_timeout()));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&registry),
            Arc::clone(&notifier),
            Arc::clone(&backend),
            topology,
            cancel.clone(),
        ));
        Self {
            config,
            backend,
            registry,
            notifier,
            gateway,
            cancel,
        }
    }

    /// Token that stops the supervisor when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The job registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The notifier.
    #[must_use]
    pub const fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// The request gateway.
    #[must_use]
    pub const fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Starts the multiplexer thread and the fanout task.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the multiplexer thread cannot be spawned.
    pub fn start_event_loop(&self) -> Result<EventLoop> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let multiplexer = Multiplexer::new(
            Arc::clone(&self.registry),
            self.backend.completion_port(),
            tx,
            self.cancel.clone(),
        )
        .poll_interval(self.config.poll_interval())
        .idle_timeout(self.config.idle_timeout())
        .memberless_grace(self.config.memberless_grace())
        .spawn()
        .map_err(|e| ProcgovError::native("spawn multiplexer", &e))?;

        let notifier = Arc::clone(&self.notifier);
        let fanout = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                notifier.notify(&event).await;
            }
        });
        Ok(EventLoop {
            multiplexer,
            fanout,
        })
    }

    /// Binds the configured endpoint and runs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be bound or the completion
    /// port fails.
    pub async fn run(self) -> Result<()> {
        let path = endpoint::resolve(self.config.endpoint.as_deref());
        let listener = endpoint::bind(&path).await?;
        let result = self.serve(listener).await;
        if let Err(e) = endpoint::remove_socket(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove socket");
        }
        result
    }

    /// Runs on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the completion port fails.
    pub async fn serve(self, listener: UnixListener) -> Result<()> {
        let events = self.start_event_loop()?;
        tracing::info!("supervisor started");

        Arc::clone(&self.gateway).serve(listener).await;
        let result = events.join().await;
        self.shutdown().await;
        result
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let jobs = self.registry.drain();
        tracing::info!(jobs = jobs.len(), "releasing tracked jobs");
        drop(jobs);
        self.notifier.shutdown().await;
        tracing::info!("supervisor stopped");
    }
}
