//! Application orchestration
//!
//! [`AppService`] is the only writer of the registry. It drives the function
//! backend for deploy and remove, owns the lifecycle state machine, and folds
//! every backend condition into a closed [`ServiceStatus`].
//!
//! ```text
//! DEPLOYED -> ACTIVE <-> INACTIVE
//! {DEPLOYED, ACTIVE, INACTIVE, ERROR} -> REMOVED
//! any -> ERROR (failed activation of an existing app)
//! REMOVED | ERROR --deploy--> ACTIVE
//! ```

use crate::backend::{BackendError, FunctionClient};
use crate::registry::{AppStatus, ApplicationRecord, SharedRegistry};
use chrono::Utc;
use dashmap::DashMap;
use hyper::body::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a service operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Success,
    NotFound,
    AlreadyExists,
    ConcurrentUpdate,
    UnknownError,
}

/// Status plus the affected record, when there is one
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status: ServiceStatus,
    pub app: Option<ApplicationRecord>,
}

impl ServiceResponse {
    fn success(app: ApplicationRecord) -> Self {
        Self {
            status: ServiceStatus::Success,
            app: Some(app),
        }
    }

    fn failure(status: ServiceStatus) -> Self {
        Self { status, app: None }
    }

    pub fn is_success(&self) -> bool {
        self.status == ServiceStatus::Success
    }
}

/// Which backend call a deploy made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeployKind {
    Create,
    Update,
}

pub struct AppService {
    registry: SharedRegistry,
    functions: Arc<FunctionClient>,
    serialize_deploys: bool,
    deploy_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl AppService {
    pub fn new(registry: SharedRegistry, functions: Arc<FunctionClient>) -> Self {
        Self {
            registry,
            functions,
            serialize_deploys: false,
            deploy_locks: DashMap::new(),
        }
    }

    /// Run concurrent deploys of the same app one after the other
    pub fn with_serialized_deploys(mut self, enabled: bool) -> Self {
        self.serialize_deploys = enabled;
        self
    }

    pub fn functions(&self) -> &Arc<FunctionClient> {
        &self.functions
    }

    /// Create or update the app's function, wait for it, and mark the app ACTIVE
    pub async fn deploy(&self, name: &str, artifact: Bytes, cancel: &CancellationToken) -> ServiceResponse {
        if !self.serialize_deploys {
            return self.deploy_unlocked(name, artifact, cancel).await;
        }

        let lock = self.deploy_locks.entry(name.to_string()).or_default().clone();
        let response = {
            let _guard = lock.lock().await;
            self.deploy_unlocked(name, artifact, cancel).await
        };
        drop(lock);

        // Entries only live while a deploy of that name holds or awaits them
        self.deploy_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
        response
    }

    async fn deploy_unlocked(&self, name: &str, artifact: Bytes, cancel: &CancellationToken) -> ServiceResponse {
        let existing = match self.registry.find_by_name(name) {
            Ok(existing) => existing,
            Err(e) => {
                error!(app = name, error = %e, "Registry lookup failed");
                return ServiceResponse::failure(ServiceStatus::UnknownError);
            }
        };

        let kind = match self.functions.get(name).await {
            Ok(Some(_)) => DeployKind::Update,
            Ok(None) => DeployKind::Create,
            Err(e) => {
                error!(app = name, error = %e, "Failed to look up function");
                return ServiceResponse::failure(ServiceStatus::UnknownError);
            }
        };

        let result = match kind {
            DeployKind::Create => self.functions.create(name, artifact, cancel).await,
            DeployKind::Update => self.functions.update(name, artifact, cancel).await,
        };

        match result {
            Ok(()) => {
                // The wait can be long; build on whatever was stored meanwhile
                let latest = match self.registry.find_by_name(name) {
                    Ok(latest) => latest.or(existing),
                    Err(e) => {
                        warn!(app = name, error = %e, "Registry re-read failed; using earlier record");
                        existing
                    }
                };
                let now = Utc::now();
                let record = match latest {
                    Some(previous) => previous.transition(AppStatus::Active, now),
                    None => ApplicationRecord::new(name, AppStatus::Active, now),
                };
                match self.store(record) {
                    Some(record) => {
                        info!(app = name, id = %record.id, kind = ?kind, "App deployed");
                        ServiceResponse::success(record)
                    }
                    None => ServiceResponse::failure(ServiceStatus::UnknownError),
                }
            }
            Err(e) => self.deploy_failed(name, kind, existing, e),
        }
    }

    fn deploy_failed(
        &self,
        name: &str,
        kind: DeployKind,
        existing: Option<ApplicationRecord>,
        err: BackendError,
    ) -> ServiceResponse {
        warn!(app = name, kind = ?kind, error = %err, "Deploy failed");

        let status = match (&err, kind) {
            (BackendError::Conflict(_), DeployKind::Create) => ServiceStatus::AlreadyExists,
            (BackendError::Conflict(_), DeployKind::Update) => ServiceStatus::ConcurrentUpdate,
            (BackendError::NotFound(_), _) => ServiceStatus::NotFound,
            (BackendError::ActivationFailed { .. }, _) => {
                return match existing {
                    Some(previous) => {
                        let record = previous.transition(AppStatus::Error, Utc::now());
                        ServiceResponse {
                            status: ServiceStatus::UnknownError,
                            app: self.store(record),
                        }
                    }
                    None => ServiceResponse::failure(ServiceStatus::UnknownError),
                };
            }
            (BackendError::ActivationTimeout { .. }, _)
            | (BackendError::Cancelled(_), _)
            | (BackendError::Provider(_), _) => ServiceStatus::UnknownError,
        };

        ServiceResponse::failure(status)
    }

    pub fn activate(&self, name: &str) -> ServiceResponse {
        self.toggle(name, AppStatus::Active)
    }

    pub fn deactivate(&self, name: &str) -> ServiceResponse {
        self.toggle(name, AppStatus::Inactive)
    }

    /// Registry-only ACTIVE/INACTIVE switch
    fn toggle(&self, name: &str, target: AppStatus) -> ServiceResponse {
        let record = match self.registry.find_by_name(name) {
            Ok(Some(record)) => record,
            Ok(None) => return ServiceResponse::failure(ServiceStatus::NotFound),
            Err(e) => {
                error!(app = name, error = %e, "Registry lookup failed");
                return ServiceResponse::failure(ServiceStatus::UnknownError);
            }
        };

        match record.status {
            AppStatus::Removed => {
                debug!(app = name, "Cannot change state of a removed app");
                return ServiceResponse::failure(ServiceStatus::NotFound);
            }
            AppStatus::Error => {
                warn!(app = name, target = %target, "App is in ERROR state; redeploy it first");
                return ServiceResponse::failure(ServiceStatus::UnknownError);
            }
            AppStatus::Deployed | AppStatus::Active | AppStatus::Inactive => {}
        }

        let previous = record.status;
        match self.store(record.transition(target, Utc::now())) {
            Some(updated) => {
                info!(app = name, from = %previous, to = %target, "App state changed");
                ServiceResponse::success(updated)
            }
            None => ServiceResponse::failure(ServiceStatus::UnknownError),
        }
    }

    /// Remove the function (best effort) and mark the app REMOVED
    pub async fn remove(&self, name: &str) -> ServiceResponse {
        let record = match self.registry.find_by_name(name) {
            Ok(Some(record)) => record,
            Ok(None) => return ServiceResponse::failure(ServiceStatus::NotFound),
            Err(e) => {
                error!(app = name, error = %e, "Registry lookup failed");
                return ServiceResponse::failure(ServiceStatus::UnknownError);
            }
        };

        if let Err(e) = self.functions.remove(name).await {
            warn!(app = name, error = %e, "Failed to remove function; marking app removed anyway");
        }

        match self.store(record.transition(AppStatus::Removed, Utc::now())) {
            Some(updated) => {
                info!(app = name, "App removed");
                ServiceResponse::success(updated)
            }
            None => ServiceResponse::failure(ServiceStatus::UnknownError),
        }
    }

    pub fn get_by_name(&self, name: &str) -> ServiceResponse {
        match self.registry.find_by_name(name) {
            Ok(Some(record)) => ServiceResponse::success(record),
            Ok(None) => ServiceResponse::failure(ServiceStatus::NotFound),
            Err(e) => {
                error!(app = name, error = %e, "Registry lookup failed");
                ServiceResponse::failure(ServiceStatus::UnknownError)
            }
        }
    }

    /// Every known app, ordered by name
    pub fn list(&self) -> Result<Vec<ApplicationRecord>, ServiceStatus> {
        self.registry.find_all().map_err(|e| {
            error!(error = %e, "Failed to list apps");
            ServiceStatus::UnknownError
        })
    }

    fn store(&self, record: ApplicationRecord) -> Option<ApplicationRecord> {
        match self.registry.upsert(record) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(error = %e, "Failed to write app record");
                None
            }
        }
    }
}
