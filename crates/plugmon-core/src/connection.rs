//! Live duplex connection between a plugin and its service.
//!
//! [`ClientConnection::run`] drives three loops over one framed transport:
//!
//! - receive: greet the peer, decode inbound frames, stamp them and push
//!   them onto the up-queue
//! - send: pop down-queue items and write them until the disconnect sentinel
//! - forward: pop up-events in order and dispatch them through the service
//!
//! All three are joined before `run` returns. [`ClientConnection::close`]
//! signals shutdown, waits for `run` to finish and forces the send loop if
//! that takes longer than the configured close timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use plugmon_rpc::{FrameCodec, POLICY_VIOLATION};
use plugmon_types::{ClientInfo, ConnectionId, DownEvent, ServiceId, StatusEvent, UpEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY};
use crate::service::Service;
use crate::{Error, Result};

const GREETING: &str = "Connected to server";

/// Queue sizing and close behaviour shared by every connection of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub queue_capacity: usize,
    pub close_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
        }
    }
}

/// Items on the down-queue. `Disconnect` never reaches the wire.
#[derive(Debug)]
pub(crate) enum Outbound {
    Event(DownEvent),
    Disconnect,
}

pub struct ClientConnection {
    id: ConnectionId,
    service_id: ServiceId,
    service: Weak<Service>,
    info: ClientInfo,
    close_timeout: Duration,
    up_capacity: usize,
    down_tx: mpsc::Sender<Outbound>,
    // Taken by the first `run`, or dropped by closing a connection that never ran
    down_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    force: CancellationToken,
    active_loops: AtomicUsize,
    done: watch::Sender<bool>,
}

impl ClientConnection {
    pub(crate) fn new(
        id: ConnectionId,
        service: &Arc<Service>,
        info: ClientInfo,
        settings: ConnectionSettings,
    ) -> Self {
        let capacity = settings.queue_capacity.max(1);
        let (down_tx, down_rx) = mpsc::channel(capacity);
        let (done, _) = watch::channel(false);

        Self {
            id,
            service_id: service.id(),
            service: Arc::downgrade(service),
            info,
            close_timeout: settings.close_timeout,
            up_capacity: capacity,
            down_tx,
            down_rx: Mutex::new(Some(down_rx)),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            active_loops: AtomicUsize::new(0),
            done,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    #[must_use]
    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    /// Number of loops currently running (0 to 3)
    #[must_use]
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Whether `run` has finished, or the connection was closed before it ran
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }

    /// Queue a down-event, waiting for space when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the connection is closing.
    pub async fn send(&self, event: DownEvent) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            () = self.shutdown.cancelled() => Err(Error::ConnectionClosed),
            sent = self.down_tx.send(Outbound::Event(event)) => {
                sent.map_err(|_| Error::ConnectionClosed)
            }
        }
    }

    /// Queue a down-event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the queue is full, or
    /// [`Error::ConnectionClosed`] once the connection is closing.
    pub fn try_send(&self, event: DownEvent) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        self.down_tx
            .try_send(Outbound::Event(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::CapacityExceeded,
                mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed,
            })
    }

    /// Close the connection and wait until its loops have finished and it
    /// has been removed from the service. Safe to call more than once and
    /// from several tasks at the same time.
    pub async fn close(&self) {
        if self.begin_close() {
            debug!("[{}] closing", self.id);
            let never_ran = self.down_rx.lock().take().is_some();
            if never_ran {
                self.finish();
                return;
            }
        }

        if tokio::time::timeout(self.close_timeout, self.wait_closed())
            .await
            .is_err()
        {
            warn!(
                "[{}] loops still running after {:?}, forcing disconnect",
                self.id, self.close_timeout
            );
            self.force.cancel();
            self.wait_closed().await;
        }
    }

    /// Wait for the connection to finish without initiating a close
    pub async fn wait_closed(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Serve the connection over a raw byte transport.
    ///
    /// # Errors
    ///
    /// See [`ClientConnection::run_framed`].
    pub async fn run<T>(&self, transport: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.run_framed(Framed::new(transport, FrameCodec::new()))
            .await
    }

    /// Serve the connection over an already framed transport. Frames still
    /// buffered in `framed` are consumed as up-events.
    ///
    /// Returns once all three loops have finished. The connection is removed
    /// from its service even if this future is dropped before completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] on a second call,
    /// [`Error::ConnectionClosed`] if the connection was closed before it ran,
    /// a codec error if the greeting cannot be written, and a decode or codec
    /// error if the peer sent a frame that is not a valid up-event.
    pub async fn run_framed<T>(&self, mut framed: Framed<T, FrameCodec>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mut down_rx) = self.down_rx.lock().take() else {
            return Err(if self.is_closed() {
                Error::ConnectionClosed
            } else {
                Error::AlreadyRunning
            });
        };
        let _finish = FinishGuard(self);

        tokio::select! {
            () = self.force.cancelled() => {
                debug!("[{}] peer never took the greeting", self.id);
                return Ok(());
            }
            sent = framed.send(self.greeting()) => sent?,
        }
        trace!("[{}] greeted peer", self.id);

        let (mut sink, mut stream) = framed.split::<DownEvent>();
        let (up_tx, mut up_rx) = mpsc::channel::<UpEvent>(self.up_capacity);

        let receive = async move {
            let _active = self.enter_loop();
            let result = loop {
                let frame = tokio::select! {
                    () = self.shutdown.cancelled() => break Ok(()),
                    frame = stream.next() => frame,
                };

                let decoded = match frame {
                    None => {
                        debug!("[{}] peer closed the stream", self.id);
                        break Ok(());
                    }
                    Some(Err(e)) => Err(Error::from(e)),
                    Some(Ok(frame)) => UpEvent::from_frame(frame).map_err(Error::from),
                };

                let mut event = match decoded {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("[{}] rejecting peer: {}", self.id, e);
                        self.reject(&e);
                        break Err(e);
                    }
                };
                event.stamp(self.service_id, self.id);
                trace!("[{}] received {} event", self.id, event.event_type());

                tokio::select! {
                    () = self.shutdown.cancelled() => break Ok(()),
                    sent = up_tx.send(event) => {
                        if sent.is_err() {
                            break Ok(());
                        }
                    }
                }
            };
            drop(up_tx);
            self.begin_close();
            result
        };

        let send = async move {
            let _active = self.enter_loop();
            loop {
                let item = tokio::select! {
                    biased;
                    () = self.force.cancelled() => break,
                    item = down_rx.recv() => item,
                    () = self.shutdown.cancelled() => down_rx.try_recv().ok(),
                };

                let event = match item {
                    Some(Outbound::Event(event)) => event,
                    Some(Outbound::Disconnect) | None => break,
                };

                let kind = event.kind();
                let written = tokio::select! {
                    () = self.force.cancelled() => break,
                    written = sink.send(event) => written,
                };
                if let Err(e) = written {
                    warn!("[{}] failed to write {} event: {}", self.id, kind, e);
                    self.begin_close();
                    break;
                }
                trace!("[{}] sent {} event", self.id, kind);
            }

            tokio::select! {
                () = self.force.cancelled() => {}
                _ = sink.close() => {}
            }
        };

        let forward = async move {
            let _active = self.enter_loop();
            loop {
                let event = tokio::select! {
                    biased;
                    () = self.force.cancelled() => break,
                    event = up_rx.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(service) = self.service.upgrade() else {
                    break;
                };
                tokio::select! {
                    () = self.force.cancelled() => break,
                    _ = service.dispatch(&event) => {}
                }
            }
        };

        let (received, (), ()) = tokio::join!(receive, send, forward);
        received
    }

    fn greeting(&self) -> DownEvent {
        DownEvent::Status(StatusEvent {
            service_id: self.service_id,
            connection_id: Some(self.id),
            name: Some(self.info.name.clone()),
            message: Some(GREETING.to_string()),
            code: None,
        })
    }

    /// Queue a final policy-violation status for the peer
    fn reject(&self, error: &Error) {
        let status = DownEvent::Status(StatusEvent {
            service_id: self.service_id,
            connection_id: Some(self.id),
            name: None,
            message: Some(error.to_string()),
            code: Some(POLICY_VIOLATION),
        });
        if self.down_tx.try_send(Outbound::Event(status)).is_err() {
            debug!("[{}] down-queue full, dropping rejection status", self.id);
        }
    }

    /// Mark the connection as closing. Returns true for the first caller.
    fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        // The send loop also stops on the shutdown signal once the queue is
        // drained, so a full queue only loses the sentinel.
        let _ = self.down_tx.try_send(Outbound::Disconnect);
        true
    }

    fn enter_loop(&self) -> LoopGuard<'_> {
        self.active_loops.fetch_add(1, Ordering::SeqCst);
        LoopGuard(&self.active_loops)
    }

    /// Remove from the service, then publish completion
    fn finish(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(service) = self.service.upgrade() {
            service.detach(self);
        }
        self.done.send_replace(true);
        debug!("[{}] connection closed", self.id);
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("service_id", &self.service_id)
            .field("info", &self.info)
            .field("closing", &self.is_closing())
            .field("active_loops", &self.active_loops())
            .finish_non_exhaustive()
    }
}

struct LoopGuard<'a>(&'a AtomicUsize);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FinishGuard<'a>(&'a ClientConnection);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}
