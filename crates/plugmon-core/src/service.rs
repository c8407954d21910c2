use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::join_all;
use plugmon_types::{ClientInfo, ConnectionId, DownEvent, ServiceId, UpEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::connection::{ClientConnection, ConnectionSettings};
use crate::handler::{Handler, HandlerSpec};
use crate::{Error, Result};

/// A handler attached to a service, with the spec it was built from if any
struct AttachedHandler {
    spec: Option<HandlerSpec>,
    handler: Arc<dyn Handler>,
}

/// Outcome of dispatching one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Handlers whose kind matched the event
    pub matched: usize,
    /// Matched handlers that returned an error or panicked
    pub failed: usize,
}

/// One connected client as seen from outside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: ConnectionId,
    pub info: ClientInfo,
}

/// Description of a service returned by fetch and list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub handlers: Vec<HandlerSpec>,
    pub clients: Vec<ClientSummary>,
}

/// One logical plugin: identity, handlers, and live connections
pub struct Service {
    id: ServiceId,
    name: Option<String>,
    created_at: DateTime<Utc>,
    handlers: RwLock<Vec<AttachedHandler>>,
    clients: DashMap<ConnectionId, Arc<ClientConnection>>,
    settings: ConnectionSettings,
}

impl Service {
    #[must_use]
    pub fn new(
        id: ServiceId,
        name: Option<String>,
        created_at: DateTime<Utc>,
        specs: &[HandlerSpec],
        settings: ConnectionSettings,
    ) -> Self {
        let handlers = specs
            .iter()
            .map(|spec| AttachedHandler {
                spec: Some(spec.clone()),
                handler: spec.build(),
            })
            .collect();

        Self {
            id,
            name,
            created_at,
            handlers: RwLock::new(handlers),
            clients: DashMap::new(),
            settings,
        }
    }

    #[must_use]
    pub fn id(&self) -> ServiceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Attach a runtime-only handler. It is not persisted.
    pub async fn add_handler(&self, handler: Arc<dyn Handler>) {
        debug!(
            "[{}] adding handler {} ({})",
            self.id,
            handler.name(),
            handler.kind()
        );
        self.handlers.write().await.push(AttachedHandler {
            spec: None,
            handler,
        });
    }

    /// Attach a built-in handler that is persisted with the service
    pub async fn add_handler_spec(&self, spec: HandlerSpec) {
        let handler = spec.build();
        debug!("[{}] adding handler {}", self.id, handler.name());
        self.handlers.write().await.push(AttachedHandler {
            spec: Some(spec),
            handler,
        });
    }

    /// Specs of every persistable handler, in attach order
    pub async fn handler_specs(&self) -> Vec<HandlerSpec> {
        self.handlers
            .read()
            .await
            .iter()
            .filter_map(|h| h.spec.clone())
            .collect()
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Create a connection bound to this service and track it.
    ///
    /// Without `info` the connection describes the service itself. The
    /// name is always the service name when the service has one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if `connection_id` names a
    /// connection that is still attached.
    pub fn attach(
        self: &Arc<Self>,
        connection_id: Option<ConnectionId>,
        info: Option<ClientInfo>,
    ) -> Result<Arc<ClientConnection>> {
        let id = connection_id.unwrap_or_default();
        let mut info = info.unwrap_or_else(|| ClientInfo::named(self.display_name()));
        if let Some(name) = &self.name {
            info.name.clone_from(name);
        } else if info.name.is_empty() {
            info.name = self.display_name();
        }

        let connection = match self.clients.entry(id) {
            Entry::Occupied(_) => {
                warn!("[{}] refusing duplicate connection {}", self.id, id);
                return Err(Error::DuplicateConnection(id));
            }
            Entry::Vacant(slot) => {
                let connection = Arc::new(ClientConnection::new(id, self, info, self.settings));
                slot.insert(Arc::clone(&connection));
                connection
            }
        };
        debug!(
            "[{}] attached connection {} ({} total)",
            self.id,
            id,
            self.clients.len()
        );
        Ok(connection)
    }

    /// Forget a connection, unless its slot was already taken by another one
    pub(crate) fn detach(&self, connection: &ClientConnection) {
        let removed = self
            .clients
            .remove_if(&connection.id(), |_, current| {
                std::ptr::eq(current.as_ref(), connection)
            })
            .is_some();
        if removed {
            trace!("[{}] detached connection {}", self.id, connection.id());
        }
    }

    #[must_use]
    pub fn client(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the attached connections
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<ClientConnection>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Run every matching handler concurrently and wait for all of them.
    ///
    /// A failing or panicking handler is logged and counted; the others
    /// still run to completion.
    pub async fn dispatch(&self, event: &UpEvent) -> DispatchSummary {
        let event_type = event.event_type();
        let matching: Vec<Arc<dyn Handler>> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|h| h.handler.kind().matches(event_type))
            .map(|h| Arc::clone(&h.handler))
            .collect();

        if matching.is_empty() {
            trace!("[{}] no handler for {} event", self.id, event_type);
            return DispatchSummary::default();
        }

        let outcomes = join_all(matching.iter().map(|handler| async move {
            let result = AssertUnwindSafe(handler.emit(event))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::handler(handler.name(), "handler panicked")));
            (handler.name(), result)
        }))
        .await;

        let mut failed = 0;
        for (name, result) in outcomes {
            if let Err(e) = result {
                failed += 1;
                warn!(
                    "[{}] handler {} failed on {} event: {}",
                    self.id, name, event_type, e
                );
            }
        }

        trace!(
            "[{}] dispatched {} event to {} handlers ({} failed)",
            self.id,
            event_type,
            matching.len(),
            failed
        );
        DispatchSummary {
            matched: matching.len(),
            failed,
        }
    }

    /// Queue a broadcast on every attached connection and return how many
    /// accepted it.
    ///
    /// Connections are served one after another and each enqueue waits for
    /// queue space, so one connection with a full queue delays the rest.
    pub async fn broadcast(&self, message: &str, highlight: bool) -> usize {
        let mut reached = 0;
        for connection in self.clients() {
            match connection
                .send(DownEvent::broadcast(message, highlight))
                .await
            {
                Ok(()) => reached += 1,
                Err(e) => debug!(
                    "[{}] broadcast skipped connection {}: {}",
                    self.id,
                    connection.id(),
                    e
                ),
            }
        }
        debug!("[{}] broadcast reached {} connections", self.id, reached);
        reached
    }

    /// Queue a down-event on one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is unknown or
    /// closing.
    pub async fn send_to(&self, connection_id: ConnectionId, event: DownEvent) -> Result<()> {
        let connection = self
            .client(connection_id)
            .ok_or(Error::ConnectionClosed)?;
        connection.send(event).await
    }

    /// Close every attached connection concurrently
    pub async fn close_all(&self) {
        let connections = self.clients();
        if connections.is_empty() {
            return;
        }
        debug!(
            "[{}] closing {} connections",
            self.id,
            connections.len()
        );
        join_all(connections.iter().map(|c| c.close())).await;
    }

    pub async fn info(&self) -> ServiceInfo {
        let mut clients: Vec<ClientSummary> = self
            .clients
            .iter()
            .map(|entry| ClientSummary {
                id: *entry.key(),
                info: entry.value().info().clone(),
            })
            .collect();
        clients.sort_by_key(|c| c.id);

        ServiceInfo {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            handlers: self.handler_specs().await,
            clients,
        }
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}
