//! Socket server implementation for the plugmon daemon.
//!
//! Accepts connections on a Unix socket (and optionally TCP), reads the
//! [`Hello`] frame and routes the stream either to a service as a plugin
//! connection or into the control request loop.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use plugmon_core::ServiceRegistry;
use plugmon_rpc::{ControlRequest, FrameCodec, Hello};
use plugmon_types::{ClientInfo, ConnectionId, Envelope, ServiceLocator};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::control;
use crate::error::{DaemonError, Result};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every connection task
pub struct DaemonState {
    pub registry: Arc<ServiceRegistry>,
    shutdown: CancellationToken,
}

impl DaemonState {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ask the accept loop to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Where the daemon listens
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    pub tcp_listen: Option<SocketAddr>,
}

impl ServerOptions {
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            tcp_listen: None,
        }
    }
}

/// A bound daemon, ready to [`serve`](Server::serve)
pub struct Server {
    state: Arc<DaemonState>,
    listener: UnixListener,
    tcp: Option<TcpListener>,
    socket_path: PathBuf,
}

impl Server {
    /// Bind the listeners, replacing a stale socket file if one is left over.
    ///
    /// # Errors
    ///
    /// Returns an error if another daemon answers on the socket path or a
    /// listener cannot be bound.
    pub async fn bind(options: &ServerOptions, registry: Arc<ServiceRegistry>) -> Result<Self> {
        let path = options.socket_path.clone();

        cleanup_stale_socket(&path).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&path)?;
        info!("Daemon listening on {:?}", path);

        let tcp = match options.tcp_listen {
            Some(addr) => {
                let tcp = TcpListener::bind(addr).await?;
                info!("Daemon listening on tcp://{}", tcp.local_addr()?);
                Some(tcp)
            }
            None => None,
        };

        Ok(Self {
            state: Arc::new(DaemonState::new(registry)),
            listener,
            tcp,
            socket_path: path,
        })
    }

    #[must_use]
    pub fn state(&self) -> Arc<DaemonState> {
        Arc::clone(&self.state)
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Address of the TCP listener, if one was requested
    #[must_use]
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|tcp| tcp.local_addr().ok())
    }

    /// Accept connections until shutdown is requested, then close every
    /// connection, save the registry and remove the socket file.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be saved on the way out.
    pub async fn serve(self) -> Result<()> {
        info!("Ready to accept connections");

        loop {
            tokio::select! {
                () = self.state.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => spawn_connection::<UnixStream>(stream, &self.state),
                    Err(e) => error!("Accept error: {}", e),
                },
                accepted = accept_tcp(self.tcp.as_ref()) => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted tcp connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        spawn_connection::<TcpStream>(stream, &self.state);
                    }
                    Err(e) => error!("TCP accept error: {}", e),
                },
            }
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> Result<()> {
        info!("Shutting down");
        let registry = &self.state.registry;

        registry.close_all().await;
        let saved = registry.save().await;
        if let Err(e) = &saved {
            error!("Failed to save services: {}", e);
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("Failed to remove socket {:?}: {}", self.socket_path, e);
        }

        saved.map_err(DaemonError::from)
    }
}

/// Bind and serve until Ctrl-C, SIGTERM or a control `shutdown`.
///
/// # Errors
///
/// See [`Server::bind`] and [`Server::serve`].
pub async fn run(options: ServerOptions, registry: Arc<ServiceRegistry>) -> Result<()> {
    let server = Server::bind(&options, registry).await?;
    let state = server.state();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, stopping");
        state.request_shutdown();
    });

    server.serve().await
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        _ = terminate.recv() => {}
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn cleanup_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "Another daemon is already running",
            )));
        }
        info!("Removing stale socket at {}", path.display());
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn spawn_connection<S>(stream: S, state: &Arc<DaemonState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, state).await {
            debug!("Connection ended with error: {}", e);
        }
    });
}

/// Read the hello frame and route the stream by role.
async fn handle_connection<S>(stream: S, state: Arc<DaemonState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec::new());

    let frame = match tokio::time::timeout(HELLO_TIMEOUT, framed.next()).await {
        Err(_) => return Err(DaemonError::HandshakeTimeout),
        Ok(None) => {
            trace!("Peer left before saying hello");
            return Ok(());
        }
        Ok(Some(frame)) => frame?,
    };

    let hello = match serde_json::from_value::<Hello>(frame) {
        Ok(hello) => hello,
        Err(e) => {
            debug!("Invalid hello: {}", e);
            framed
                .send(Envelope::bad_request(format!("Invalid hello: {e}")))
                .await?;
            return Ok(());
        }
    };

    match hello {
        Hello::Plugin {
            service,
            connection_id,
            info,
        } => serve_plugin(framed, &state, &service, connection_id, info).await,
        Hello::Control => serve_control(framed, &state).await,
    }
}

async fn serve_plugin<S>(
    mut framed: Framed<S, FrameCodec>,
    state: &DaemonState,
    locator: &ServiceLocator,
    connection_id: Option<ConnectionId>,
    info: Option<ClientInfo>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if state.is_shutting_down() {
        framed
            .send(Envelope::internal("Daemon is shutting down"))
            .await?;
        return Ok(());
    }

    let attached = match state.registry.locate(locator).await {
        Ok(service) => service
            .attach(connection_id, info)
            .map(|connection| (service, connection)),
        Err(e) => Err(e),
    };
    let (service, connection) = match attached {
        Ok(attached) => attached,
        Err(e) => {
            let err = DaemonError::from(e);
            warn!("Refusing plugin for {}: {}", locator, err);
            framed.send(Envelope::from(err)).await?;
            return Ok(());
        }
    };

    info!(
        "[{}] plugin '{}' attached to service {}",
        connection.id(),
        connection.info().name,
        service.id()
    );

    let result = connection.run_framed(framed).await;
    info!("[{}] plugin detached", connection.id());
    result.map_err(DaemonError::from)
}

async fn serve_control<S>(mut framed: Framed<S, FrameCodec>, state: &DaemonState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Control client connected");

    loop {
        let frame = tokio::select! {
            () = state.shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };

        let request = match serde_json::from_value::<ControlRequest>(frame?) {
            Ok(request) => request,
            Err(e) => {
                framed
                    .send(Envelope::bad_request(format!("Invalid request: {e}")))
                    .await?;
                continue;
            }
        };

        let stop = matches!(request, ControlRequest::Shutdown);
        let reply = control::handle(&state.registry, request).await;
        framed.send(reply).await?;

        if stop {
            info!("Shutdown requested by control client");
            state.request_shutdown();
            break;
        }
    }

    debug!("Control client disconnected");
    Ok(())
}
