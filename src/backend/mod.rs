//! Function backend client
//!
//! [`FunctionProvider`] is the raw capability offered by a function-as-a-service
//! runtime (create, update, get, remove, invoke). [`FunctionClient`] wraps a
//! provider and adds what callers actually need: after a create or update it
//! waits for the function to become invokable, bounded by a deadline and by a
//! caller-supplied [`CancellationToken`].

pub mod lambda;
pub mod memory;

use crate::config::ProviderConfig;
use async_trait::async_trait;
use hyper::body::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Conditions reported by a provider or by the activation wait
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// The function already exists, or another modification is in flight
    #[error("conflicting operation on function {0}")]
    Conflict(String),

    #[error("function {0} does not exist")]
    NotFound(String),

    #[error("function {name} did not become active within {waited:?}")]
    ActivationTimeout { name: String, waited: Duration },

    /// The provider put the function in a terminal failed state
    #[error("function {name} failed to activate: {reason}")]
    ActivationFailed { name: String, reason: String },

    #[error("activation wait for function {0} was cancelled")]
    Cancelled(String),

    /// Anything else the provider reported (transport, auth, quota, ...)
    #[error("provider error: {0}")]
    Provider(String),
}

/// Readiness of a function as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Being provisioned or updated
    Pending,
    /// Invokable
    Ready,
    /// Provisioning or the last update failed
    Failed,
    /// Reclaimed by the provider; invoking it will re-provision
    Inactive,
}

/// Provider-side view of a function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    pub name: String,
    pub state: ReadyState,
    /// Provider explanation for the current state, if any
    pub state_reason: Option<String>,
    pub runtime: Option<String>,
}

/// Everything needed to provision a function
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    /// Opaque deployment package, handed to the provider untouched
    pub artifact: Bytes,
}

/// Outcome of a synchronous invocation
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// The function returned normally
    Payload(Bytes),
    /// The function ran but signalled failure (unhandled exception, crash, ...)
    FunctionError { error: String, payload: Bytes },
}

/// Raw function-as-a-service capability
#[async_trait]
pub trait FunctionProvider: Send + Sync {
    /// Provision a new function. `Conflict` if the name is taken.
    async fn create(&self, spec: &FunctionSpec) -> Result<(), BackendError>;

    /// Replace the code of an existing function.
    /// `NotFound` if absent, `Conflict` if an update is already running.
    async fn update(&self, name: &str, artifact: Bytes) -> Result<(), BackendError>;

    /// Current descriptor, or `None` if the function was never created
    async fn get(&self, name: &str) -> Result<Option<FunctionDescriptor>, BackendError>;

    async fn remove(&self, name: &str) -> Result<(), BackendError>;

    async fn invoke(&self, name: &str, payload: Bytes) -> Result<InvocationResult, BackendError>;
}

/// Settings applied to every function the client provisions
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub runtime: String,
    pub handler: String,
    pub activation_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            runtime: "nodejs20.x".to_string(),
            handler: "index.handler".to_string(),
            activation_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&ProviderConfig> for ClientSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            handler: config.handler.clone(),
            activation_timeout: config.activation_timeout(),
            poll_interval: config.activation_poll_interval(),
        }
    }
}

/// Provider wrapper used by the orchestration service and the proxy
pub struct FunctionClient {
    provider: Arc<dyn FunctionProvider>,
    settings: ClientSettings,
}

impl FunctionClient {
    pub fn new(provider: Arc<dyn FunctionProvider>, settings: ClientSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Provision a function and wait until it can be invoked
    pub async fn create(
        &self,
        name: &str,
        artifact: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let spec = FunctionSpec {
            name: name.to_string(),
            runtime: self.settings.runtime.clone(),
            handler: self.settings.handler.clone(),
            artifact,
        };

        info!(
            function = name,
            runtime = %spec.runtime,
            handler = %spec.handler,
            artifact_bytes = spec.artifact.len(),
            "Creating function"
        );
        self.provider.create(&spec).await?;
        self.wait_for_activation(name, cancel).await
    }

    /// Replace a function's code and wait until the new code can be invoked
    pub async fn update(
        &self,
        name: &str,
        artifact: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        info!(function = name, artifact_bytes = artifact.len(), "Updating function code");
        self.provider.update(name, artifact).await?;
        self.wait_for_activation(name, cancel).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<FunctionDescriptor>, BackendError> {
        self.provider.get(name).await
    }

    /// Delete a function. Deleting a missing function succeeds.
    pub async fn remove(&self, name: &str) -> Result<(), BackendError> {
        match self.provider.remove(name).await {
            Ok(()) => {
                info!(function = name, "Function removed");
                Ok(())
            }
            Err(BackendError::NotFound(_)) => {
                debug!(function = name, "Function already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn invoke(&self, name: &str, payload: Bytes) -> Result<InvocationResult, BackendError> {
        debug!(function = name, payload_bytes = payload.len(), "Invoking function");
        self.provider.invoke(name, payload).await
    }

    /// Poll the provider until the function reports ready.
    ///
    /// Ends with `ActivationTimeout` once the deadline passes, `ActivationFailed`
    /// if the provider reports a failed state, and `Cancelled` as soon as
    /// `cancel` fires. Cancelling does not undo the provisioning call.
    async fn wait_for_activation(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let started = Instant::now();
        let deadline = started + self.settings.activation_timeout;

        loop {
            let poll = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(function = name, "Activation wait cancelled");
                    return Err(BackendError::Cancelled(name.to_string()));
                }
                result = tokio::time::timeout_at(deadline, self.provider.get(name)) => result,
            };

            match poll {
                Ok(Ok(Some(descriptor))) => match descriptor.state {
                    ReadyState::Ready => {
                        info!(
                            function = name,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Function is active"
                        );
                        return Ok(());
                    }
                    ReadyState::Failed => {
                        let reason = descriptor
                            .state_reason
                            .unwrap_or_else(|| "no reason given".to_string());
                        warn!(function = name, %reason, "Function activation failed");
                        return Err(BackendError::ActivationFailed {
                            name: name.to_string(),
                            reason,
                        });
                    }
                    ReadyState::Pending | ReadyState::Inactive => {
                        debug!(function = name, state = ?descriptor.state, "Function not ready yet");
                    }
                },
                Ok(Ok(None)) => {
                    debug!(function = name, "Function not visible yet");
                }
                Ok(Err(e)) => {
                    debug!(function = name, error = %e, "Function state poll failed");
                }
                Err(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    function = name,
                    timeout_secs = self.settings.activation_timeout.as_secs(),
                    "Function never became active"
                );
                return Err(BackendError::ActivationTimeout {
                    name: name.to_string(),
                    waited: now - started,
                });
            }

            let next_poll = std::cmp::min(now + self.settings.poll_interval, deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(function = name, "Activation wait cancelled");
                    return Err(BackendError::Cancelled(name.to_string()));
                }
                _ = tokio::time::sleep_until(next_poll) => {}
            }
        }
    }
}
