//! # procgov-supervisor
//!
//! The long-lived job supervisor. It owns every job it creates and
//! coordinates four components:
//!
//! - [`Registry`](registry::Registry): the authoritative name, handle and
//!   pid indices, updated atomically under one lock.
//! - [`Multiplexer`](multiplexer::Multiplexer): a dedicated thread draining
//!   the backend's completion port, updating the registry and emitting
//!   typed notifications. It also enforces clock deadlines and the idle
//!   shutdown.
//! - [`Notifier`](notifier::Notifier): per-job subscriber lists and fanout.
//! - [`Gateway`](gateway::Gateway): the per-connection request/response
//!   state machine.
//!
//! [`Supervisor`](supervisor::Supervisor) wires them together around a
//! single cancellation token.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod gateway;
pub mod multiplexer;
pub mod notifier;
pub mod registry;
pub mod supervisor;

pub use supervisor::Supervisor;
