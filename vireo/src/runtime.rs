//! The per-process runtime context.
//!
//! Everything that would otherwise be a process global (configuration,
//! store handles, the event log and its sequence mutex, the watcher and
//! projection locks, the route table, the registry cache, the throttle)
//! lives on one `Runtime` created at startup and threaded through the
//! components.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::event::EventLog;
use crate::registry::Registry;
use crate::routes::{Route, Routes};
use crate::store::Store;
use crate::throttle::Throttle;

pub struct Runtime {
    config: ServiceConfig,
    store: Store,
    log: EventLog,
    routes: Routes,
    registry: Registry,
    throttle: Throttle,
    watcher_lock: Mutex<()>,
    projection_locks: DashMap<String, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Validate the configuration and assemble a runtime over a fresh
    /// store connection. The driver connects lazily, so this does not
    /// require the store to be reachable yet. No transports or jobs are
    /// started; that is [`crate::start`]'s job.
    pub async fn connect(mut config: ServiceConfig, routes: Routes) -> Result<Arc<Self>> {
        config.validate()?;
        if routes.is_empty() {
            return Err(Error::Validation("routes are required".into()));
        }
        let store = Store::connect(&config.db_uri, &config.db_name, &config.db_prefix).await?;
        Ok(Self::assemble(config, routes, store))
    }

    pub(crate) fn assemble(config: ServiceConfig, routes: Routes, store: Store) -> Arc<Self> {
        let log = EventLog::new(
            store.typed_collection(&config.col_events),
            store.collection(&config.col_events),
        );
        let throttle = Throttle::new(config.req_per_sec);
        Arc::new(Self {
            config,
            store,
            log,
            routes,
            registry: Registry::new(),
            throttle,
            watcher_lock: Mutex::new(()),
            projection_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: SyncMutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Serializes callback execution across all watchers.
    pub(crate) fn watcher_lock(&self) -> &Mutex<()> {
        &self.watcher_lock
    }

    /// Build lock for one projection, created on first use. Distinct
    /// projections build concurrently.
    pub(crate) fn projection_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.projection_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Root cancellation token; workers exit when it fires.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }
}
