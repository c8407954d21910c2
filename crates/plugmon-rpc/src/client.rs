//! Client helpers for connecting to the plugmon daemon.
//!
//! [`PluginClient`] attaches to a service and exchanges events;
//! [`ControlClient`] issues control requests and reads envelopes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use plugmon_types::{
    ClientInfo, ConnectionId, DownEvent, Envelope, ReportEvent, ServiceId, ServiceLocator,
    StatusEvent, UpEvent,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::protocol::{ControlRequest, Hello};
use crate::transport::FrameCodec;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

fn is_dev_socket() -> bool {
    let Ok(exe) = std::env::current_exe() else {
        return false;
    };

    let Some(parent) = exe.parent() else {
        return false;
    };

    if !parent.ends_with("target/debug") {
        return false;
    }

    let Some(name) = exe.file_name().and_then(|file| file.to_str()) else {
        return false;
    };

    matches!(name, "plugmon" | "plugmon-daemon")
}

/// Get the socket path for the plugmon daemon in dev mode.
#[must_use]
pub fn dev_socket_path() -> PathBuf {
    runtime_dir().join("plugmon-dev.sock")
}

/// Get the socket path for the plugmon daemon.
///
/// Prefers `$XDG_RUNTIME_DIR`, falling back to the system temp directory.
#[must_use]
pub fn socket_path() -> PathBuf {
    let socket_name = if is_dev_socket() {
        "plugmon-dev.sock"
    } else {
        "plugmon.sock"
    };

    runtime_dir().join(socket_name)
}

async fn next_frame<S>(framed: &mut Framed<S, FrameCodec>) -> Result<Value>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e.into()),
        None => Err(ClientError::ConnectionClosed),
    }
}

/// Frames without a `type` are envelopes; on a plugin connection those only
/// ever carry a rejection.
fn decode_down(frame: Value) -> Result<DownEvent> {
    if frame.get("type").is_none() {
        let envelope: Envelope = serde_json::from_value(frame)?;
        return Err(ClientError::Rejected {
            code: envelope.code,
            message: envelope.msg.unwrap_or_default(),
        });
    }
    Ok(serde_json::from_value(frame)?)
}

/// A plugin-side connection bound to one service
pub struct PluginClient<S = UnixStream> {
    framed: Framed<S, FrameCodec>,
    status: StatusEvent,
}

impl PluginClient<UnixStream> {
    /// Attach to a service through the daemon at the default socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be reached or the daemon rejects
    /// the handshake.
    pub async fn connect(locator: ServiceLocator, info: Option<ClientInfo>) -> Result<Self> {
        Self::connect_to(&socket_path(), locator, info).await
    }

    /// Attach to a service through the daemon at a custom socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be reached or the daemon rejects
    /// the handshake.
    pub async fn connect_to(
        path: &Path,
        locator: ServiceLocator,
        info: Option<ClientInfo>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let hello = Hello::Plugin {
            service: locator,
            connection_id: None,
            info,
        };
        Self::handshake(stream, &hello).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PluginClient<S> {
    /// Send `hello` over an established stream and wait for the status greeting.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the daemon answers with an error
    /// envelope, or [`ClientError::UnexpectedFrame`] if the first frame is
    /// not a status event.
    pub async fn handshake(stream: S, hello: &Hello) -> Result<Self> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(hello).await?;

        match decode_down(next_frame(&mut framed).await?)? {
            DownEvent::Status(status) => {
                debug!(
                    "[{}] attached to service {}",
                    status
                        .connection_id
                        .map_or_else(|| "?".to_string(), |c| c.to_string()),
                    status.service_id
                );
                Ok(Self { framed, status })
            }
            other => Err(ClientError::UnexpectedFrame(other.kind().to_string())),
        }
    }

    /// The greeting received on attach
    #[must_use]
    pub fn status(&self) -> &StatusEvent {
        &self.status
    }

    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        self.status.service_id
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.status.connection_id
    }

    /// Send an up-event.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn send(&mut self, event: &UpEvent) -> Result<()> {
        trace!("sending {} event", event.event_type());
        self.framed.send(event).await?;
        Ok(())
    }

    /// Send a report event.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn report(&mut self, report: ReportEvent) -> Result<()> {
        self.send(&UpEvent::Report(report)).await
    }

    /// Send an arbitrary JSON frame, bypassing the typed event model.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn send_raw(&mut self, frame: &Value) -> Result<()> {
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Receive the next down-event. Returns `Ok(None)` once the daemon has
    /// closed the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be read or decoded.
    pub async fn recv(&mut self) -> Result<Option<DownEvent>> {
        match self.framed.next().await {
            Some(Ok(frame)) => decode_down(frame).map(Some),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Flush and close the write half.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<&UpEvent>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// A control connection for operator requests
pub struct ControlClient<S = UnixStream> {
    framed: Framed<S, FrameCodec>,
}

impl ControlClient<UnixStream> {
    /// Connect to the daemon at the default socket path.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the socket connection fails.
    pub async fn connect() -> Result<Self> {
        Self::connect_to(&socket_path()).await
    }

    /// Connect to the daemon at a custom socket path.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the socket connection fails.
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Self::from_stream(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ControlClient<S> {
    /// Announce the control role over an established stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the hello frame cannot be written.
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(&Hello::Control).await?;
        Ok(Self { framed })
    }

    /// Send a request and wait for its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails, the connection closes, the reply
    /// does not arrive within 30 seconds, or the reply is not an envelope.
    pub async fn request(&mut self, request: &ControlRequest) -> Result<Envelope> {
        trace!("control request op={}", request.op());
        self.framed.send(request).await?;

        let frame = tokio::time::timeout(REQUEST_TIMEOUT, next_frame(&mut self.framed))
            .await
            .map_err(|_| ClientError::Timeout)??;

        Ok(serde_json::from_value(frame)?)
    }
}
