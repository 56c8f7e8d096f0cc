//! # procgov-sdk
//!
//! Public SDK for governing processes through a running procgov supervisor.
//!
//! Provides four main entry points:
//! - [`JobSettingsBuilder`](builder::JobSettingsBuilder): Fluent API for describing job limits.
//! - [`GatewayClient`](client::GatewayClient): Request/response client for the supervisor socket.
//! - [`EventListener`](event::EventListener): Receives the notifications of a subscribed job.
//! - [`adopt`](adoption::adopt): Places processes under a new or already existing job.
//!
//! # Example
//!
//! ```rust,no_run
//! use procgov_core::topology::LinuxTopology;
//! use procgov_sdk::builder::JobSettingsBuilder;
//!
//! let request = JobSettingsBuilder::new()
//!     .name("builds")
//!     .max_job_memory(512 * 1024 * 1024)
//!     .cpu_rate_percent(50)
//!     .build(&LinuxTopology::new());
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod adoption;
pub mod builder;
pub mod client;
pub mod event;
