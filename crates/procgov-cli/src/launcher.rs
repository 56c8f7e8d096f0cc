//! On-demand supervisor startup.
//!
//! Clients connect to the supervisor socket; if nobody listens there the
//! current executable is started again in `--monitor` mode, detached from
//! the terminal's process group, and the connection is retried. The
//! supervisor outlives the client; the runtime reaps it if it stops first.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use procgov_sdk::client::GatewayClient;
use tokio::process::Command;

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connects to the supervisor on `socket`, starting one if needed.
///
/// # Errors
///
/// Returns an error if the supervisor cannot be started or does not start
/// listening in time.
pub async fn connect_or_start(
    socket: &Path,
    cgroup_root: &Path,
) -> anyhow::Result<GatewayClient> {
    match GatewayClient::connect(socket).await {
        Ok(client) => return Ok(client),
        Err(e) => tracing::debug!(socket = %socket.display(), error = %e, "no supervisor listening"),
    }

    let exe = std::env::current_exe().context("failed to locate the procgov executable")?;
    let child = Command::new(exe)
        .arg("--monitor")
        .arg("--socket")
        .arg(socket)
        .arg("--cgroup-root")
        .arg(cgroup_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("failed to start the supervisor")?;
    tracing::info!(pid = ?child.id(), socket = %socket.display(), "supervisor started");

    for _ in 0..CONNECT_ATTEMPTS {
        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        if let Ok(client) = GatewayClient::connect(socket).await {
            return Ok(client);
        }
    }
    anyhow::bail!(
        "supervisor did not start listening on {} in time",
        socket.display()
    )
}

/// Connects to a running supervisor without starting one.
///
/// # Errors
///
/// Returns an error if no supervisor listens on `socket`.
pub async fn connect(socket: &Path) -> anyhow::Result<GatewayClient> {
    GatewayClient::connect(socket)
        .await
        .with_context(|| format!("no supervisor is listening on {}", socket.display()))
}
