//! In-process function provider
//!
//! Functions live in a map and invocations run registered closures. Used for
//! local development (`provider.type = "memory"`) and throughout the tests,
//! which can script activation behaviour, inject one-shot failures and add
//! latency per operation.

use super::{BackendError, FunctionDescriptor, FunctionProvider, FunctionSpec, InvocationResult, ReadyState};
use async_trait::async_trait;
use hyper::body::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Code run by an in-process function. Receives the decoded event.
pub type FunctionHandler = Arc<dyn Fn(&Value) -> InvocationResult + Send + Sync>;

/// How a function reaches the ready state after create or update
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationBehavior {
    Immediate,
    /// Report pending for this many state polls, then ready
    AfterPolls(u32),
    Never,
    /// Report a failed state with this reason
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Get,
    Remove,
    Invoke,
}

struct StoredFunction {
    spec: FunctionSpec,
    state: ReadyState,
    state_reason: Option<String>,
    pending_polls: Option<u32>,
}

impl StoredFunction {
    fn provision(&mut self, behavior: &ActivationBehavior) {
        self.state_reason = None;
        match behavior {
            ActivationBehavior::Immediate => {
                self.state = ReadyState::Ready;
                self.pending_polls = None;
            }
            ActivationBehavior::AfterPolls(n) => {
                self.state = ReadyState::Pending;
                self.pending_polls = Some(*n);
            }
            ActivationBehavior::Never => {
                self.state = ReadyState::Pending;
                self.pending_polls = None;
            }
            ActivationBehavior::Fail(reason) => {
                self.state = ReadyState::Failed;
                self.state_reason = Some(reason.clone());
                self.pending_polls = None;
            }
        }
    }

    /// Advance a scripted activation by one poll
    fn poll(&mut self) {
        if let Some(remaining) = self.pending_polls {
            if remaining == 0 {
                self.state = ReadyState::Ready;
                self.pending_polls = None;
            } else {
                self.pending_polls = Some(remaining - 1);
            }
        }
    }

    fn descriptor(&self) -> FunctionDescriptor {
        FunctionDescriptor {
            name: self.spec.name.clone(),
            state: self.state,
            state_reason: self.state_reason.clone(),
            runtime: Some(self.spec.runtime.clone()),
        }
    }
}

#[derive(Default)]
struct State {
    functions: HashMap<String, StoredFunction>,
    handlers: HashMap<String, FunctionHandler>,
    failures: HashMap<Operation, BackendError>,
    delays: HashMap<Operation, Duration>,
    calls: HashMap<Operation, usize>,
    get_calls: HashMap<String, usize>,
    last_events: HashMap<String, Value>,
}

/// Provider that keeps functions in process memory
pub struct MemoryProvider {
    state: Mutex<State>,
    activation: Mutex<ActivationBehavior>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            activation: Mutex::new(ActivationBehavior::Immediate),
        }
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the code that runs when `name` is invoked.
    /// Functions without a handler echo the event back as the response body.
    pub fn register_handler<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> InvocationResult + Send + Sync + 'static,
    {
        self.state
            .lock()
            .handlers
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Applies to functions created or updated after the call
    pub fn set_activation(&self, behavior: ActivationBehavior) {
        *self.activation.lock() = behavior;
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: Operation, error: BackendError) {
        self.state.lock().failures.insert(op, error);
    }

    /// Delay every call of `op`
    pub fn set_delay(&self, op: Operation, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn get_calls(&self, name: &str) -> usize {
        self.state.lock().get_calls.get(name).copied().unwrap_or(0)
    }

    pub fn spec(&self, name: &str) -> Option<FunctionSpec> {
        self.state.lock().functions.get(name).map(|f| f.spec.clone())
    }

    /// Most recent event delivered to `name`
    pub fn last_event(&self, name: &str) -> Option<Value> {
        self.state.lock().last_events.get(name).cloned()
    }

    /// Record the call and return the injected failure and delay, if any
    fn enter(&self, op: Operation) -> (Option<BackendError>, Option<Duration>) {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        let failure = state.failures.remove(&op);
        let delay = state.delays.get(&op).copied();
        (failure, delay)
    }

    async fn begin(&self, op: Operation) -> Result<(), BackendError> {
        let (failure, delay) = self.enter(op);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Handler result carrying `value` as the JSON payload
pub fn payload(value: Value) -> InvocationResult {
    InvocationResult::Payload(Bytes::from(value.to_string()))
}

fn echo(event: &Value) -> InvocationResult {
    payload(json!({
        "statusCode": 200,
        "headers": { "content-type": "application/json" },
        "body": event.to_string(),
    }))
}

#[async_trait]
impl FunctionProvider for MemoryProvider {
    async fn create(&self, spec: &FunctionSpec) -> Result<(), BackendError> {
        self.begin(Operation::Create).await?;
        let behavior = self.activation.lock().clone();

        let mut state = self.state.lock();
        if state.functions.contains_key(&spec.name) {
            return Err(BackendError::Conflict(spec.name.clone()));
        }

        let mut function = StoredFunction {
            spec: spec.clone(),
            state: ReadyState::Pending,
            state_reason: None,
            pending_polls: None,
        };
        function.provision(&behavior);
        state.functions.insert(spec.name.clone(), function);
        debug!(function = %spec.name, "Memory function created");
        Ok(())
    }

    async fn update(&self, name: &str, artifact: Bytes) -> Result<(), BackendError> {
        self.begin(Operation::Update).await?;
        let behavior = self.activation.lock().clone();

        let mut state = self.state.lock();
        let function = state
            .functions
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        if function.state == ReadyState::Pending {
            return Err(BackendError::Conflict(name.to_string()));
        }

        function.spec.artifact = artifact;
        function.provision(&behavior);
        debug!(function = name, "Memory function updated");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<FunctionDescriptor>, BackendError> {
        {
            let mut state = self.state.lock();
            *state.get_calls.entry(name.to_string()).or_insert(0) += 1;
        }
        self.begin(Operation::Get).await?;

        let mut state = self.state.lock();
        Ok(state.functions.get_mut(name).map(|function| {
            function.poll();
            function.descriptor()
        }))
    }

    async fn remove(&self, name: &str) -> Result<(), BackendError> {
        self.begin(Operation::Remove).await?;

        match self.state.lock().functions.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    async fn invoke(&self, name: &str, payload: Bytes) -> Result<InvocationResult, BackendError> {
        self.begin(Operation::Invoke).await?;

        let event: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
        let handler = {
            let mut state = self.state.lock();
            if !state.functions.contains_key(name) {
                return Err(BackendError::NotFound(name.to_string()));
            }
            state.last_events.insert(name.to_string(), event.clone());
            state.handlers.get(name).cloned()
        };

        Ok(match handler {
            Some(handler) => handler(&event),
            None => echo(&event),
        })
    }
}
