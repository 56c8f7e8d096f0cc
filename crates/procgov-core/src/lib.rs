//! # procgov-core
//!
//! Native job facility for the procgov supervisor.
//!
//! This crate provides:
//! - **Job facility traits**: [`job::JobBackend`], [`job::NativeJob`] and
//!   [`job::CompletionPort`], the seam between the supervisor and the OS.
//! - **Cgroups v2 backend**: one cgroup per job, with a watcher thread that
//!   turns cgroup state changes into completion messages.
//! - **Simulated backend**: an in-memory job facility for tests and dry runs.
//! - **Translator**: the mapping from [`JobSettings`](procgov_common::types::JobSettings)
//!   to native limit calls, including CPU-rate and affinity arithmetic.
//! - **Topology** and **process inspection** helpers read from `/sys` and `/proc`.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod cgroup;
pub mod job;
pub mod process;
pub mod sim;
pub mod topology;
pub mod translator;
