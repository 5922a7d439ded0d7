//! In-process owner for a plugin worker
//!
//! Answers the worker's outbound capability messages itself: HTTP through
//! reqwest, the key-value store through a JSON file, logs through tracing.
//! Used when running a plugin from the command line with no owner process.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{PluginEvent, PluginRequest};
use crate::error::{Result, WorkerError};
use crate::fetcher::Fetcher;

/// Key-value store persisted as a single JSON object
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: &Path) -> Result<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(WorkerError::fs(path, e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Value {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).cloned())
            .unwrap_or(Value::Null)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let contents = {
            let mut values = self.values.lock().map_err(|_| WorkerError::Panicked)?;
            values.insert(key.to_string(), value);
            serde_json::to_string_pretty(&*values)?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkerError::fs(parent, e))?;
        }
        std::fs::write(&self.path, contents).map_err(|e| WorkerError::fs(&self.path, e))
    }
}

pub struct CapabilityHost {
    fetcher: Fetcher,
    store: JsonStore,
}

impl CapabilityHost {
    pub fn new(fetcher: Fetcher, store: JsonStore) -> Self {
        Self { fetcher, store }
    }

    /// Handle one outbound message; returns the response the worker awaits
    pub async fn answer(&self, event: &PluginEvent) -> Option<PluginRequest> {
        match event {
            PluginEvent::HttpRequest {
                id,
                method,
                url,
                body,
            } => {
                let (data, error) = match self.http(method, url, body.as_ref()).await {
                    Ok(data) => (Some(data), None),
                    Err(e) => {
                        warn!("Plugin request to {} failed: {}", url, e);
                        (None, Some(e.to_string()))
                    }
                };
                Some(PluginRequest::HttpResponse {
                    id: id.clone(),
                    data,
                    error,
                })
            }
            PluginEvent::StoreRequest { id, key } => Some(PluginRequest::StoreResponse {
                id: id.clone(),
                value: self.store.get(key),
            }),
            PluginEvent::StoreSet { key, value } => {
                if let Err(e) = self.store.set(key, value.clone()) {
                    warn!("Plugin store write for {} failed: {}", key, e);
                }
                None
            }
            PluginEvent::Log { message } => {
                info!(target: "tuneworker::plugin", "{}", message);
                None
            }
            _ => None,
        }
    }

    async fn http(&self, method: &str, url: &str, body: Option<&Value>) -> Result<Value> {
        let text = if method.eq_ignore_ascii_case("POST") {
            let mut request = self.fetcher.client().post(url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request
                .send()
                .await
                .map_err(|e| WorkerError::transport(url, e))?;
            if !response.status().is_success() {
                return Err(WorkerError::RequestFailed {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }
            response
                .text()
                .await
                .map_err(|e| WorkerError::transport(url, e))?
        } else {
            let fetched = self.fetcher.fetch(url).await?;
            String::from_utf8_lossy(&fetched.data).into_owned()
        };

        debug!("Plugin {} {} -> {} bytes", method, url, text.len());
        Ok(body_value(text))
    }
}

/// JSON bodies are passed through parsed, anything else as a string
fn body_value(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
