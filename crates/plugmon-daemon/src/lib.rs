//! Plugmon daemon library providing the socket server and control requests.
//!
//! This crate hosts the [`ServiceRegistry`](plugmon_core::ServiceRegistry)
//! behind a Unix socket (and optionally TCP). Plugins attach to services and
//! exchange events; control clients register, inspect and drive services.

pub mod control;
pub mod error;
pub mod server;

pub use error::{DaemonError, Result};
pub use server::{DaemonState, Server, ServerOptions, run};
