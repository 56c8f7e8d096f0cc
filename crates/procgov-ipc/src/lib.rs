//! # procgov-ipc
//!
//! The byte-stream protocol spoken between procgov clients and the job
//! supervisor.
//!
//! - [`protocol`]: request, response and notification messages, each
//!   carrying a fixed small-integer tag.
//! - [`codec`]: a [`tokio_util::codec`] codec for self-delimiting JSON frames.
//! - [`endpoint`]: privilege-scoped socket paths and listener binding.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod codec;
pub mod endpoint;
pub mod protocol;
