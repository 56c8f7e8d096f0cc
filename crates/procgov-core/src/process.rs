//! Process inspection and per-process limits.
//!
//! Reads target process state from procfs (existence, executable bitness,
//! the job marker left in its environment) and applies the limits that
//! cgroups cannot express per process: address-space and CPU-time rlimits
//! and the nice value.

use std::io::Read;
use std::path::PathBuf;

use procgov_common::constants::JOB_MARKER_ENV;
use procgov_common::error::{ProcgovError, Result};

/// Executable word size of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    /// 32-bit executable.
    Bits32,
    /// 64-bit executable.
    Bits64,
}

impl Bitness {
    /// Bitness of the running governor.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Bits64
        } else {
            Self::Bits32
        }
    }
}

/// Reads process information from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcessInspector {
    proc_root: PathBuf,
}

impl ProcessInspector {
    /// Inspects processes through `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Inspects processes through an alternate procfs mount.
    #[must_use]
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn pid_path(&self, pid: u32, entry: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(entry)
    }

    /// Returns whether the process exists.
    #[must_use]
    pub fn exists(&self, pid: u32) -> bool {
        self.proc_root.join(pid.to_string()).is_dir()
    }

    /// Determines the bitness of the process executable from its ELF header.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be read or is not ELF.
    pub fn bitness(&self, pid: u32) -> Result<Bitness> {
        let path = self.pid_path(pid, "exe");
        let mut header = [0u8; 5];
        std::fs::File::open(&path)
            .and_then(|mut f| f.read_exact(&mut header))
            .map_err(|e| ProcgovError::Io {
                path: path.clone(),
                source: e,
            })?;
        if &header[..4] != b"\x7fELF" {
            return Err(ProcgovError::validation(format!(
                "process {pid} does not run an ELF executable"
            )));
        }
        match header[4] {
            1 => Ok(Bitness::Bits32),
            2 => Ok(Bitness::Bits64),
            class => Err(ProcgovError::validation(format!(
                "process {pid} has unknown ELF class {class}"
            ))),
        }
    }

    /// Rejects targets whose bitness differs from the governor's.
    ///
    /// # Errors
    ///
    /// Returns a validation error on mismatch, or an error if the target
    /// cannot be inspected.
    pub fn ensure_same_bitness(&self, pid: u32) -> Result<()> {
        let target = self.bitness(pid)?;
        if target == Bitness::current() {
            Ok(())
        } else {
            Err(ProcgovError::validation(format!(
                "process {pid} is {target:?} but the governor is {:?}",
                Bitness::current()
            )))
        }
    }

    /// Returns the job name recorded in the process environment, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment of an existing process cannot be read.
    pub fn job_marker(&self, pid: u32) -> Result<Option<String>> {
        let path = self.pid_path(pid, "environ");
        let environ = std::fs::read(&path).map_err(|e| ProcgovError::Io {
            path: path.clone(),
            source: e,
        })?;
        let prefix = format!("{JOB_MARKER_ENV}=");
        Ok(environ
            .split(|&b| b == 0)
            .filter_map(|entry| std::str::from_utf8(entry).ok())
            .find_map(|entry| entry.strip_prefix(&prefix))
            .filter(|name| !name.is_empty())
            .map(str::to_owned))
    }
}

impl Default for ProcessInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// Limits an existing process's address space, in bytes.
///
/// # Errors
///
/// Returns [`ProcgovError::Native`] if `prlimit(2)` fails.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_address_space_limit(pid: u32, bytes: u64) -> Result<()> {
    prlimit_with(pid, bytes, |pid, limit| {
        // SAFETY: `limit` points to a valid rlimit for the duration of the
        // call and the old-limit pointer is null, which prlimit(2) accepts.
        unsafe { libc::prlimit(pid, libc::RLIMIT_AS, limit, std::ptr::null_mut()) }
    })
}

/// Limits an existing process's CPU time, in whole seconds (rounded up).
///
/// # Errors
///
/// Returns [`ProcgovError::Native`] if `prlimit(2)` fails.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_cpu_time_limit(pid: u32, ms: u64) -> Result<()> {
    prlimit_with(pid, ms.div_ceil(1000).max(1), |pid, limit| {
        // SAFETY: as in `set_address_space_limit`.
        unsafe { libc::prlimit(pid, libc::RLIMIT_CPU, limit, std::ptr::null_mut()) }
    })
}

#[cfg(target_os = "linux")]
fn prlimit_with(
    pid: u32,
    value: u64,
    call: impl FnOnce(libc::pid_t, *const libc::rlimit) -> libc::c_int,
) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| ProcgovError::validation(format!("pid {pid} out of range")))?;
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    if call(pid, &limit) == 0 {
        Ok(())
    } else {
        Err(ProcgovError::native("prlimit", &std::io::Error::last_os_error()))
    }
}

/// Sets the nice value of an existing process.
///
/// # Errors
///
/// Returns [`ProcgovError::Native`] if `setpriority(2)` fails.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_nice(pid: u32, nice: i32) -> Result<()> {
    // SAFETY: setpriority(2) takes plain integers and has no memory effects.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid, nice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(ProcgovError::native("setpriority", &std::io::Error::last_os_error()))
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; per-process limits require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_address_space_limit(_pid: u32, _bytes: u64) -> Result<()> {
    Err(unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; per-process limits require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_cpu_time_limit(_pid: u32, _ms: u64) -> Result<()> {
    Err(unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; per-process limits require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_nice(_pid: u32, _nice: i32) -> Result<()> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> ProcgovError {
    ProcgovError::Config {
        message: "Linux required for native job operations".into(),
    }
}
