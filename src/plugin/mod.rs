//! Plugin sandbox runner
//!
//! Load and call requests go through the worker queue, one at a time. A call
//! that needs the owner (HTTP, store reads) parks on the blocking pool until
//! the matching response arrives, so responses must reach
//! [`PluginWorker::handle_message`] directly rather than queue behind it.

pub mod host;
pub mod pending;
pub mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};
use wasmtime::Engine;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::queue::{
    EventSink, FailurePolicy, QueuedTask, TaskHandler, WorkerHandle, spawn_worker,
};

pub use pending::PendingRequests;
pub use sandbox::{Capabilities, Sandbox};

/// Messages from the owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginRequest {
    LoadPlugin {
        /// Module source, WAT text
        source: String,
    },
    HttpResponse {
        id: String,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    CallMethod {
        id: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    StoreResponse {
        id: String,
        #[serde(default)]
        value: Value,
    },
}

/// Messages to the owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginEvent {
    HttpRequest {
        id: String,
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    StoreRequest {
        id: String,
        key: String,
    },
    StoreSet {
        key: String,
        value: Value,
    },
    Log {
        message: String,
    },
    LoadDone {
        methods: Vec<String>,
    },
    CallResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum PluginTask {
    Load { source: Vec<u8> },
    Call { id: String, method: String, args: Value },
}

impl QueuedTask for PluginTask {
    fn task_id(&self) -> Option<&str> {
        match self {
            PluginTask::Load { .. } => None,
            PluginTask::Call { id, .. } => Some(id),
        }
    }
}

#[derive(Debug)]
pub enum PluginOutput {
    Loaded(Vec<String>),
    Returned(Value),
}

/// Capabilities answered by the owner over the message channel
pub struct ChannelCapabilities {
    events: EventSink<PluginEvent>,
    pending: Arc<PendingRequests>,
    runtime: Handle,
    timeout: Duration,
}

impl ChannelCapabilities {
    pub fn new(
        events: EventSink<PluginEvent>,
        pending: Arc<PendingRequests>,
        runtime: Handle,
        timeout: Duration,
    ) -> Self {
        Self {
            events,
            pending,
            runtime,
            timeout,
        }
    }

    fn round_trip(&self, request: impl FnOnce(String) -> PluginEvent) -> std::result::Result<Value, String> {
        let (id, rx) = self.pending.register();
        self.events.emit(request(id.clone()));
        self.runtime
            .block_on(self.pending.wait(&id, rx, self.timeout))
            .map_err(|e| match e {
                WorkerError::Plugin(message) => message,
                other => other.to_string(),
            })
    }
}

impl Capabilities for ChannelCapabilities {
    fn log(&self, message: &str) {
        self.events.emit(PluginEvent::Log {
            message: message.to_string(),
        });
    }

    fn http(&self, method: &str, url: &str, body: Option<Value>) -> std::result::Result<Value, String> {
        debug!("Plugin {} {}", method, url);
        self.round_trip(|id| PluginEvent::HttpRequest {
            id,
            method: method.to_string(),
            url: url.to_string(),
            body,
        })
    }

    fn store_get(&self, key: &str) -> std::result::Result<Value, String> {
        self.round_trip(|id| PluginEvent::StoreRequest {
            id,
            key: key.to_string(),
        })
    }

    fn store_set(&self, key: &str, value: Value) {
        self.events.emit(PluginEvent::StoreSet {
            key: key.to_string(),
            value,
        });
    }
}

pub struct PluginHandler {
    engine: Engine,
    capabilities: Arc<dyn Capabilities>,
    sandbox: Arc<Mutex<Option<Sandbox>>>,
    fuel: u64,
}

impl PluginHandler {
    pub fn new(engine: Engine, capabilities: Arc<dyn Capabilities>, fuel: u64) -> Self {
        Self {
            engine,
            capabilities,
            sandbox: Arc::new(Mutex::new(None)),
            fuel,
        }
    }

    async fn load(&self, source: &[u8]) -> Result<Vec<String>> {
        let engine = self.engine.clone();
        let capabilities = Arc::clone(&self.capabilities);
        let slot = Arc::clone(&self.sandbox);
        let source = source.to_vec();
        let fuel = self.fuel;

        tokio::task::spawn_blocking(move || {
            let sandbox = Sandbox::load(&engine, &source, capabilities, fuel)?;
            let methods = sandbox.methods();
            let mut slot = slot.lock().map_err(|_| WorkerError::Panicked)?;
            *slot = Some(sandbox);
            Ok(methods)
        })
        .await
        .map_err(|_| WorkerError::Panicked)?
    }

    async fn call(&self, method: &str, args: &Value) -> Result<Value> {
        let slot = Arc::clone(&self.sandbox);
        let method = method.to_string();
        let args = args.clone();

        tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock().map_err(|_| WorkerError::Panicked)?;
            let sandbox = slot.as_mut().ok_or(WorkerError::PluginNotLoaded)?;
            sandbox.call(&method, &args)
        })
        .await
        .map_err(|_| WorkerError::Panicked)?
    }
}

#[async_trait]
impl TaskHandler for PluginHandler {
    type Task = PluginTask;
    type Output = PluginOutput;
    type Event = PluginEvent;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Report
    }

    async fn execute(&self, task: &PluginTask, _events: &EventSink<PluginEvent>) -> Result<PluginOutput> {
        match task {
            PluginTask::Load { source } => {
                let methods = self.load(source).await?;
                info!("Plugin loaded: {} methods", methods.len());
                Ok(PluginOutput::Loaded(methods))
            }
            PluginTask::Call { method, args, .. } => {
                Ok(PluginOutput::Returned(self.call(method, args).await?))
            }
        }
    }

    fn completed(&self, task: &PluginTask, output: PluginOutput) -> Option<PluginEvent> {
        match (task, output) {
            (_, PluginOutput::Loaded(methods)) => Some(PluginEvent::LoadDone { methods }),
            (PluginTask::Call { id, .. }, PluginOutput::Returned(value)) => {
                Some(PluginEvent::CallResult {
                    id: id.clone(),
                    result: Some(value),
                    error: None,
                })
            }
            (PluginTask::Load { .. }, PluginOutput::Returned(_)) => None,
        }
    }

    fn failed(&self, task: &PluginTask, error: &WorkerError) -> Option<PluginEvent> {
        match task {
            PluginTask::Load { .. } => Some(PluginEvent::Error {
                id: None,
                message: error.to_string(),
            }),
            PluginTask::Call { id, .. } => Some(PluginEvent::CallResult {
                id: id.clone(),
                result: None,
                error: Some(error.to_string()),
            }),
        }
    }
}

/// Running plugin sandbox worker
pub struct PluginWorker {
    handle: WorkerHandle<PluginTask>,
    pending: Arc<PendingRequests>,
}

impl PluginWorker {
    /// Spawn a worker whose capability calls round-trip through `events`
    pub fn spawn(config: &WorkerConfig, events: EventSink<PluginEvent>) -> Result<Self> {
        let pending = Arc::new(PendingRequests::new());
        let capabilities = Arc::new(ChannelCapabilities::new(
            events.clone(),
            Arc::clone(&pending),
            Handle::current(),
            config.plugin_request_timeout(),
        ));
        let handler = PluginHandler::new(sandbox::engine()?, capabilities, config.plugin_fuel);
        let handle = spawn_worker(Arc::new(handler), events);
        Ok(Self { handle, pending })
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn handle_message(&self, request: PluginRequest) -> Result<()> {
        match request {
            PluginRequest::LoadPlugin { source } => self.handle.enqueue(PluginTask::Load {
                source: source.into_bytes(),
            }),
            PluginRequest::CallMethod { id, method, args } => {
                self.handle.enqueue(PluginTask::Call { id, method, args })
            }
            PluginRequest::HttpResponse { id, data, error } => {
                let response = match error {
                    Some(message) => Err(message),
                    None => Ok(data.unwrap_or(Value::Null)),
                };
                if !self.pending.settle(&id, response) {
                    debug!("Late or unknown HTTP response {} dropped", id);
                }
                Ok(())
            }
            PluginRequest::StoreResponse { id, value } => {
                if !self.pending.settle(&id, Ok(value)) {
                    debug!("Late or unknown store response {} dropped", id);
                }
                Ok(())
            }
        }
    }

    pub fn load_bytes(&self, source: Vec<u8>) -> Result<()> {
        self.handle.enqueue(PluginTask::Load { source })
    }

    /// Finish queued calls, then stop
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
