//! Test fixtures and helpers

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use plugmon_rpc::FrameCodec;
use plugmon_types::UpEvent;
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::connection::{ClientConnection, ConnectionSettings};
use crate::handler::{Handler, HandlerKind};
use crate::registry::{RegistryOptions, ServiceRegistry};
use crate::service::Service;
use crate::{Error, Result};

pub const WAIT: Duration = Duration::from_secs(5);

pub type Peer = Framed<DuplexStream, FrameCodec>;

/// Registry persisting into `dir`, with no default handlers
pub fn registry_in(dir: &Path) -> ServiceRegistry {
    registry_with(dir, ConnectionSettings::default())
}

pub fn registry_with(dir: &Path, connection: ConnectionSettings) -> ServiceRegistry {
    ServiceRegistry::new(RegistryOptions {
        connection,
        ..RegistryOptions::new(dir.join("services.json"))
    })
}

/// Small queues and a short close timeout
pub fn tight_settings(queue_capacity: usize) -> ConnectionSettings {
    ConnectionSettings {
        queue_capacity,
        close_timeout: Duration::from_millis(200),
    }
}

/// Records every event it receives
pub struct RecordingHandler {
    kind: HandlerKind,
    events: Mutex<Vec<UpEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new(kind: HandlerKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn events(&self) -> Vec<UpEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Wait until at least `n` events have been recorded
    pub async fn wait_for(&self, n: usize) {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("handler did not receive enough events");
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn kind(&self) -> HandlerKind {
        self.kind
    }

    async fn emit(&self, event: &UpEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Always fails
pub struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Any
    }

    async fn emit(&self, _event: &UpEvent) -> Result<()> {
        Err(Error::handler("failing", "always fails"))
    }
}

/// Panics on every event
pub struct PanickingHandler;

#[async_trait]
impl Handler for PanickingHandler {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Any
    }

    async fn emit(&self, _event: &UpEvent) -> Result<()> {
        panic!("handler exploded");
    }
}

/// Attach a connection to `service`, run it over an in-memory pipe and
/// consume the greeting.
pub async fn connect(
    service: &Arc<Service>,
) -> (Arc<ClientConnection>, JoinHandle<Result<()>>, Peer, Value) {
    let connection = service.attach(None, None).unwrap();
    let (server_side, client_side) = tokio::io::duplex(64 * 1024);

    let runner = Arc::clone(&connection);
    let handle = tokio::spawn(async move { runner.run(server_side).await });

    let mut peer = Framed::new(client_side, FrameCodec::new());
    let greeting = next_frame(&mut peer).await;
    (connection, handle, peer, greeting)
}

/// Next frame from the server side, failing the test after [`WAIT`]
pub async fn next_frame(peer: &mut Peer) -> Value {
    tokio::time::timeout(WAIT, peer.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("frame decodes")
}

/// Await `future`, failing the test after [`WAIT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}
