//! Process-wide mapping from service identity to [`Service`].
//!
//! The registry is an explicit context object shared as
//! `Arc<ServiceRegistry>`. Lookups by id or by name always hand out the same
//! `Arc<Service>`; a missing service is created on first lookup. The host
//! loads the registry once at startup and saves it on shutdown and on
//! request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use plugmon_types::{ServiceId, ServiceLocator};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{Config, Directories};
use crate::connection::ConnectionSettings;
use crate::handler::HandlerSpec;
use crate::service::{Service, ServiceInfo};
use crate::store::{ServiceRecord, ServiceStore};
use crate::{Error, Result};

/// Everything a registry needs to build services and persist them
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub storage_path: PathBuf,
    pub connection: ConnectionSettings,
    /// Handlers attached to every newly created service
    pub default_handlers: Vec<HandlerSpec>,
}

impl RegistryOptions {
    /// Options with default connection settings and no default handlers
    #[must_use]
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            connection: ConnectionSettings::default(),
            default_handlers: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, dirs: &Directories) -> Self {
        Self {
            storage_path: config.storage_path(dirs),
            connection: ConnectionSettings {
                queue_capacity: config.queue_capacity,
                close_timeout: config.close_timeout(),
            },
            default_handlers: config.handler_specs(dirs),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<ServiceId, Arc<Service>>,
    by_name: HashMap<String, ServiceId>,
}

impl RegistryState {
    fn lookup(&self, id: Option<ServiceId>, name: Option<&str>) -> Option<Arc<Service>> {
        if let Some(service) = id.and_then(|id| self.by_id.get(&id)) {
            return Some(Arc::clone(service));
        }
        name.and_then(|name| self.by_name.get(name))
            .and_then(|id| self.by_id.get(id))
            .map(Arc::clone)
    }

    fn insert(&mut self, service: Arc<Service>) {
        if let Some(name) = service.name() {
            self.by_name.insert(name.to_string(), service.id());
        }
        self.by_id.insert(service.id(), service);
    }
}

pub struct ServiceRegistry {
    state: RwLock<RegistryState>,
    store: ServiceStore,
    options: RegistryOptions,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store: ServiceStore::new(options.storage_path.clone()),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Find a service by id, then by name, creating it if neither matches.
    ///
    /// A created service takes `id` as its identity when given, otherwise a
    /// fresh one, and carries `name` when given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityConflict`] if neither `id` nor `name` is given.
    pub async fn resolve(&self, id: Option<ServiceId>, name: Option<&str>) -> Result<Arc<Service>> {
        if id.is_none() && name.is_none() {
            return Err(Error::IdentityConflict);
        }

        if let Some(service) = self.state.read().await.lookup(id, name) {
            return Ok(service);
        }

        let mut state = self.state.write().await;
        // Another resolve may have won the race for the write lock
        if let Some(service) = state.lookup(id, name) {
            return Ok(service);
        }

        let service = self.build(id.unwrap_or_default(), name.map(String::from));
        info!(
            "[{}] created service {}",
            service.id(),
            service.name().unwrap_or("<unnamed>")
        );
        state.insert(Arc::clone(&service));
        Ok(service)
    }

    /// Resolve a parsed `sid/...` or `name/...` reference
    ///
    /// # Errors
    ///
    /// See [`ServiceRegistry::resolve`].
    pub async fn locate(&self, locator: &ServiceLocator) -> Result<Arc<Service>> {
        self.resolve(locator.id(), locator.name_str()).await
    }

    /// Create a new service under a fresh id and persist the registry.
    ///
    /// An existing service with the same name keeps its name and stays
    /// reachable by id, but name lookups now return the new service.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be saved.
    pub async fn register(&self, name: &str) -> Result<Arc<Service>> {
        let service = self.build(ServiceId::new(), Some(name.to_string()));
        {
            let mut state = self.state.write().await;
            if let Some(previous) = state.by_name.get(name) {
                debug!(
                    "[{}] name {} moves over from {}",
                    service.id(),
                    name,
                    previous
                );
            }
            state.insert(Arc::clone(&service));
        }
        info!("[{}] registered service {}", service.id(), name);

        self.save().await?;
        Ok(service)
    }

    /// Look up a service by id without creating it
    pub async fn get(&self, id: ServiceId) -> Option<Arc<Service>> {
        self.state.read().await.by_id.get(&id).map(Arc::clone)
    }

    /// Look up a service by name without creating it
    pub async fn find_by_name(&self, name: &str) -> Option<Arc<Service>> {
        self.state.read().await.lookup(None, Some(name))
    }

    /// Look up a service by locator without creating it
    pub async fn find(&self, locator: &ServiceLocator) -> Option<Arc<Service>> {
        match locator {
            ServiceLocator::Id(id) => self.get(*id).await,
            ServiceLocator::Name(name) => self.find_by_name(name).await,
        }
    }

    /// Snapshot of all services, oldest first
    pub async fn services(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<Arc<Service>> =
            self.state.read().await.by_id.values().cloned().collect();
        services.sort_by_key(|s| (s.created_at(), s.id()));
        services
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.by_id.is_empty()
    }

    pub async fn infos(&self) -> Vec<ServiceInfo> {
        let mut infos = Vec::new();
        for service in self.services().await {
            infos.push(service.info().await);
        }
        infos
    }

    /// Persist every service with its serializable handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be written.
    pub async fn save(&self) -> Result<()> {
        let mut records = Vec::new();
        for service in self.services().await {
            records.push(ServiceRecord {
                id: service.id(),
                name: service.name().map(String::from),
                created_at: service.created_at(),
                handlers: service.handler_specs().await,
            });
        }
        self.store.save(records).await
    }

    /// Populate the registry from disk. A missing file is created empty.
    ///
    /// Loaded services keep their stored handlers; defaults are not added
    /// again. Services already in memory with the same id are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the initial image cannot be written.
    pub async fn load(&self) -> Result<usize> {
        let Some(records) = self.store.load().await? else {
            info!(
                "No service store yet, creating {}",
                self.store.path().display()
            );
            self.save().await?;
            return Ok(0);
        };

        let mut state = self.state.write().await;
        let mut loaded = 0;
        for record in records {
            if state.by_id.contains_key(&record.id) {
                continue;
            }
            let service = Arc::new(Service::new(
                record.id,
                record.name,
                record.created_at,
                &record.handlers,
                self.options.connection,
            ));
            state.insert(service);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Close every live connection of every service
    pub async fn close_all(&self) {
        let services = self.services().await;
        join_all(services.iter().map(|s| s.close_all())).await;
    }

    fn build(&self, id: ServiceId, name: Option<String>) -> Arc<Service> {
        Arc::new(Service::new(
            id,
            name,
            Utc::now(),
            &self.options.default_handlers,
            self.options.connection,
        ))
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("store", &self.store.path())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
