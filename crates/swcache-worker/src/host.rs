//! Lifecycle host: the platform side that registers workers and routes
//! install, activate, fetch and message events to them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use swcache_net::{Fetcher, Request};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::ServiceWorkerError;
use crate::storage::CacheStore;
use crate::worker::{
    ActivateReport, FetchOutcome, LifecycleSignal, OfflineAssetCache, ResponseSource,
};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

// ==================== Service Worker ====================

/// A service worker instance wrapping one cache version.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub state: ServiceWorkerState,
    cache: Arc<OfflineAssetCache>,
}

impl ServiceWorker {
    fn new(cache: OfflineAssetCache) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            cache: Arc::new(cache),
        }
    }

    fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
    }

    pub fn version(&self) -> &str {
        self.cache.version()
    }

    pub fn bucket_name(&self) -> &str {
        self.cache.bucket_name()
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

// ==================== Registration ====================

/// The installing / waiting / active worker slots for one scope.
#[derive(Debug)]
struct Registration {
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
}

impl Registration {
    fn new() -> Self {
        Self {
            installing: None,
            waiting: None,
            active: None,
        }
    }
}

// ==================== Clients ====================

/// A page the worker may control.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub controller: Option<ServiceWorkerId>,
}

#[derive(Debug, Default)]
struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Make `worker` the controller of every client. Returns the ids whose
    /// controller changed.
    fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }
}

// ==================== Events ====================

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Host ====================

/// Drives the lifecycle of offline cache workers for one scope.
pub struct ServiceWorkerHost {
    scope: Url,
    storage: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    registration: RwLock<Registration>,
    clients: RwLock<Clients>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a new host and the receiver for its events.
    pub fn new(
        scope: Url,
        storage: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                scope,
                storage,
                fetcher,
                registration: RwLock::new(Registration::new()),
                clients: RwLock::new(Clients::default()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Register a worker for `config` and run its install.
    ///
    /// On success the worker is waiting, or already active if install asked
    /// to skip waiting or nothing was active yet. On failure it is redundant
    /// and the previously active worker keeps serving.
    pub async fn register(
        &self,
        config: CacheConfig,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        if !config.base_url.as_str().starts_with(self.scope.as_str()) {
            return Err(ServiceWorkerError::OutOfScope {
                base: config.base_url.to_string(),
                scope: self.scope.to_string(),
            });
        }

        let cache = OfflineAssetCache::new(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
        )?;
        let mut worker = ServiceWorker::new(cache);
        let id = worker.id;
        let cache = Arc::clone(&worker.cache);

        info!(version = %cache.version(), scope = %self.scope, "Registering service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            version: cache.version().to_string(),
        });

        worker.set_state(ServiceWorkerState::Installing);
        self.emit_state(&worker);
        {
            let mut registration = self.registration.write().await;
            if let Some(mut previous) = registration.installing.replace(worker) {
                previous.set_state(ServiceWorkerState::Redundant);
                self.emit_state(&previous);
            }
        }

        let result = cache.install().await;

        let mut registration = self.registration.write().await;
        let mut worker = match registration.installing.take() {
            Some(worker) if worker.id == id => worker,
            other => {
                // A newer registration replaced this one while it installed.
                registration.installing = other;
                return Err(ServiceWorkerError::InstallFailed {
                    url: self.scope.to_string(),
                    reason: "superseded by a newer registration".to_string(),
                });
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                worker.set_state(ServiceWorkerState::Redundant);
                self.emit_state(&worker);
                return Err(e);
            }
        };

        worker.set_state(ServiceWorkerState::Installed);
        self.emit_state(&worker);
        if let Some(mut previous) = registration.waiting.replace(worker) {
            previous.set_state(ServiceWorkerState::Redundant);
            self.emit_state(&previous);
        }

        let activate_now =
            outcome.signal == LifecycleSignal::SkipWaiting || registration.active.is_none();
        drop(registration);

        if activate_now {
            self.activate().await?;
        }

        Ok(id)
    }

    /// Promote the waiting worker, clean up stale buckets and claim clients.
    ///
    /// Returns `None` when nothing is waiting. The transition completes even
    /// if cleanup fails; the cleanup error is returned afterwards.
    pub async fn activate(&self) -> Result<Option<ActivateReport>, ServiceWorkerError> {
        let mut registration = self.registration.write().await;
        let Some(mut worker) = registration.waiting.take() else {
            return Ok(None);
        };

        worker.set_state(ServiceWorkerState::Activating);
        self.emit_state(&worker);

        // Fetches queue behind the registration lock until this resolves.
        let cleanup = worker.cache.activate().await;

        if let Some(mut old) = registration.active.take() {
            old.set_state(ServiceWorkerState::Redundant);
            self.emit_state(&old);
        }

        worker.set_state(ServiceWorkerState::Activated);
        self.emit_state(&worker);
        let id = worker.id;
        registration.active = Some(worker);
        drop(registration);

        let report = match cleanup {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Activation cleanup failed");
                return Err(e);
            }
        };

        if report.signal == LifecycleSignal::ClaimClients {
            let changed = self.clients.write().await.claim(id);
            for client_id in changed {
                debug!(client = %client_id, "Client claimed");
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id: id,
                });
            }
        }

        Ok(Some(report))
    }

    /// Route a fetch to the active worker, or straight to the network when
    /// none is active.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        let active = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|worker| Arc::clone(&worker.cache));

        match active {
            Some(cache) => cache.handle_fetch(request).await,
            None => {
                let response = self.fetcher.fetch(&request).await?;
                Ok(FetchOutcome {
                    response,
                    source: ResponseSource::Network,
                    revalidation: None,
                })
            }
        }
    }

    /// Deliver a message to the newest worker. Returns whether it caused an
    /// activation.
    pub async fn post_message(&self, message: &JsonValue) -> Result<bool, ServiceWorkerError> {
        let target = {
            let registration = self.registration.read().await;
            registration
                .waiting
                .as_ref()
                .or(registration.installing.as_ref())
                .or(registration.active.as_ref())
                .map(|worker| Arc::clone(&worker.cache))
        };

        let Some(cache) = target else {
            return Ok(false);
        };

        if cache.handle_message(message) != Some(LifecycleSignal::SkipWaiting) {
            return Ok(false);
        }
        Ok(self.activate().await?.is_some())
    }

    /// Add a client. New clients are controlled by the active worker, if any.
    pub async fn add_client(&self, url: Url) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed));

        let controller = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|worker| worker.id);

        self.clients.write().await.add(Client {
            id: id.clone(),
            url,
            controller,
        });
        id
    }

    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn controller_of(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(client_id)?.controller
    }

    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.registration.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<ServiceWorker> {
        self.registration.read().await.active.clone()
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        debug!(
            worker = ?worker.id,
            version = %worker.version(),
            state = %worker.state,
            "State change"
        );
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            version: worker.version().to_string(),
            new_state: worker.state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}
