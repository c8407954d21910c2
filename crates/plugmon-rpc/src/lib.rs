//! Wire protocol and clients for plugmon.
//!
//! This crate provides the framing codec, the handshake/control protocol and
//! client helpers for talking to the plugmon daemon over Unix sockets.
//!
//! # Architecture
//!
//! - [`transport`]: Length-prefixed codec carrying one JSON object per frame
//! - [`protocol`]: The [`Hello`] handshake and [`ControlRequest`] operations
//! - [`client`]: [`PluginClient`] and [`ControlClient`]
//! - [`error`]: Client error type
//!
//! # Example
//!
//! ```no_run
//! use plugmon_rpc::PluginClient;
//! use plugmon_types::{ReportEvent, ReportLevel, ServiceLocator};
//!
//! # async fn example() -> Result<(), plugmon_rpc::ClientError> {
//! let locator: ServiceLocator = "name/plugin-a".parse().expect("valid locator");
//! let mut client = PluginClient::connect(locator, None).await?;
//!
//! client
//!     .report(ReportEvent::new(ReportLevel::Error, "boom"))
//!     .await?;
//!
//! while let Some(event) = client.recv().await? {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{ControlClient, PluginClient, dev_socket_path, socket_path};
pub use error::{ClientError, Result};
pub use protocol::{ControlRequest, Hello, POLICY_VIOLATION};
pub use transport::{CodecError, FrameCodec, MAX_FRAME_SIZE};
