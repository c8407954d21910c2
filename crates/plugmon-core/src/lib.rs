//! Connection and event core for plugmon.
//!
//! - [`ServiceRegistry`]: identity resolution, creation on first use and
//!   persistence of services
//! - [`Service`]: handlers, live connections, dispatch and broadcast
//! - [`ClientConnection`]: receive/send/forward loops over bounded queues
//!   with coordinated close
//! - [`Handler`]: asynchronous sinks for up-events

pub mod config;
pub mod handler;

mod connection;
mod error;
mod registry;
mod service;
mod store;

#[cfg(test)]
mod tests;

pub use connection::{ClientConnection, ConnectionSettings};
pub use error::{Error, Result};
pub use handler::{FileReportHandler, Handler, HandlerKind, HandlerSpec, LogHandler};
pub use registry::{RegistryOptions, ServiceRegistry};
pub use service::{ClientSummary, DispatchSummary, Service, ServiceInfo};
pub use store::{STORE_VERSION, ServiceRecord, ServiceStore};

pub use plugmon_types::*;
