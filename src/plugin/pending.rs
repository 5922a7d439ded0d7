//! Correlation of capability round trips with their responses
//!
//! Each entry is settled exactly once: by the matching response, or by its
//! timeout. Either way the entry leaves the map, so a late response finds
//! nothing and is dropped.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, WorkerError};

const ID_LENGTH: usize = 16;

/// Outcome delivered by the owner: a value, or an error message
pub type Response = std::result::Result<Value, String>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh request id
    pub fn register(&self) -> (String, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        let id = loop {
            let candidate = generate_id();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(id.clone(), tx);
        (id, rx)
    }

    /// Deliver a response; false when `id` is unknown or already settled
    pub fn settle(&self, id: &str, response: Response) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            debug!("No pending request {}, response ignored", id);
            return false;
        };
        // The waiter may have given up between removal and send
        let _ = tx.send(response);
        true
    }

    /// Wait for the response to `id`, removing the entry on timeout
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Response>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(WorkerError::Plugin(message)),
            Ok(Err(_)) => Err(WorkerError::WorkerStopped),
            Err(_) => {
                self.lock().remove(id);
                Err(WorkerError::timeout(format!("plugin request {}", id)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        // A poisoned map still holds valid senders
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Random alphanumeric correlation id
fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}
