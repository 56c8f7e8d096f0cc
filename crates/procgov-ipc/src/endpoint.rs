//! Privilege-scoped socket endpoints.
//!
//! Elevated sessions share one well-known socket owned by root; every
//! unprivileged user gets a socket of their own, so jobs governed by root
//! are invisible to unprivileged clients.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use procgov_common::constants::{APP_NAME, ELEVATED_SOCKET_PATH, FALLBACK_SOCKET_DIR};
use procgov_common::error::{ProcgovError, Result};
use tokio::net::{UnixListener, UnixStream};

/// Socket path for a given effective uid and runtime directory.
#[must_use]
pub fn endpoint_for(euid: u32, runtime_dir: Option<&Path>) -> PathBuf {
    if euid == 0 {
        return PathBuf::from(ELEVATED_SOCKET_PATH);
    }
    runtime_dir
        .filter(|dir| dir.is_absolute())
        .unwrap_or_else(|| Path::new(FALLBACK_SOCKET_DIR))
        .join(format!("{APP_NAME}-{euid}.sock"))
}

/// Socket path of the calling process's session.
#[must_use]
pub fn default_endpoint() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    endpoint_for(nix::unistd::geteuid().as_raw(), runtime_dir.as_deref())
}

/// The override if given, otherwise [`default_endpoint`].
#[must_use]
pub fn resolve(endpoint: Option<&Path>) -> PathBuf {
    endpoint.map_or_else(default_endpoint, Path::to_path_buf)
}

/// Connects to the supervisor listening on `path`.
///
/// # Errors
///
/// Returns [`ProcgovError::Transport`] if nobody listens there.
pub async fn connect(path: &Path) -> Result<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}

/// Binds the supervisor socket, replacing a stale socket file.
///
/// The socket is only accessible to its owner.
///
/// # Errors
///
/// Returns [`ProcgovError::Config`] if another supervisor already listens
/// on `path`, or an I/O error if the socket cannot be created.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ProcgovError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(ProcgovError::Config {
                message: format!("a supervisor is already listening on {}", path.display()),
            });
        }
        tracing::debug!(path = %path.display(), "removing stale socket");
        remove_socket(path)?;
    }

    let listener = UnixListener::bind(path).map_err(|e| ProcgovError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        ProcgovError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    tracing::info!(path = %path.display(), "listening");
    Ok(listener)
}

/// Removes the socket file; a missing file is not an error.
///
/// # Errors
///
/// Returns an I/O error if the file exists but cannot be removed.
pub fn remove_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(ProcgovError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}
