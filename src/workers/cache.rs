//! Cache worker: fetch, tag and store tracks in a flat cache directory
//!
//! Caching is best-effort. A failed task is logged and the queue moves on;
//! the owner only hears about tracks that made it to disk.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, WorkerError};
use crate::media::MetadataWriter;
use crate::queue::{
    EventSink, FailurePolicy, QueuedTask, TaskHandler, WorkerHandle, spawn_worker,
};
use crate::track::{CachedTrack, Track};
use crate::utils::{resolve_extension, sanitize_or};

/// Messages from the owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CacheRequest {
    Task {
        track: Track,
        url: String,
        audio_cache_path: PathBuf,
    },
    Quit,
}

/// Messages to the owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CacheEvent {
    TaskDone { data: CachedTrack },
    Finished,
}

#[derive(Debug, Clone)]
pub struct CacheTask {
    pub track: Track,
    pub url: String,
    pub cache_dir: PathBuf,
}

impl QueuedTask for CacheTask {
    fn dedup_key(&self) -> Option<String> {
        Some(format!("{}-{}", self.track.id, self.track.bitrate()))
    }
}

/// `<id>-<bitrate>-<name>.<ext>`
pub fn cache_file_name(track: &Track, extension: &str) -> String {
    format!(
        "{}-{}-{}.{}",
        sanitize_or(&track.id.to_string(), "0"),
        track.bitrate(),
        sanitize_or(&track.name, "track"),
        extension
    )
}

pub struct CacheHandler {
    writer: MetadataWriter,
}

impl CacheHandler {
    pub fn new(writer: MetadataWriter) -> Self {
        Self { writer }
    }

    async fn write(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerError::fs(parent, e))?;
        }
        fs::write(path, data)
            .await
            .map_err(|e| WorkerError::fs(path, e))
    }
}

#[async_trait]
impl TaskHandler for CacheHandler {
    type Task = CacheTask;
    type Output = CachedTrack;
    type Event = CacheEvent;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Swallow
    }

    async fn execute(&self, task: &CacheTask, _events: &EventSink<CacheEvent>) -> Result<CachedTrack> {
        debug!("Caching {} from {}", task.track.name, task.url);

        let fetched = self.writer.fetcher().fetch(&task.url).await?;
        let extension = resolve_extension(&task.url, &fetched.content_type);

        let tagged = self
            .writer
            .apply_metadata(fetched.data, &task.track, &extension)
            .await?;

        let path = task.cache_dir.join(cache_file_name(&task.track, &extension));
        Self::write(&path, &tagged).await?;

        info!("Cached {} -> {}", task.track.name, path.display());

        Ok(CachedTrack {
            track: task.track.clone(),
            size: tagged.len() as u64,
            path,
            cache: true,
            inserted_at: Utc::now(),
        })
    }

    fn completed(&self, _task: &CacheTask, output: CachedTrack) -> Option<CacheEvent> {
        Some(CacheEvent::TaskDone { data: output })
    }

    async fn finish(&self, _events: &EventSink<CacheEvent>) -> Option<CacheEvent> {
        Some(CacheEvent::Finished)
    }
}

/// Running cache worker
pub struct CacheWorker {
    handle: WorkerHandle<CacheTask>,
}

impl CacheWorker {
    pub fn spawn(writer: MetadataWriter, events: EventSink<CacheEvent>) -> Self {
        let handle = spawn_worker(Arc::new(CacheHandler::new(writer)), events);
        Self { handle }
    }

    pub fn enqueue(&self, task: CacheTask) -> Result<()> {
        self.handle.enqueue(task)
    }

    /// Dispatch an owner message; returns false once the worker has quit
    pub async fn handle_message(&self, request: CacheRequest) -> Result<bool> {
        match request {
            CacheRequest::Task {
                track,
                url,
                audio_cache_path,
            } => {
                self.enqueue(CacheTask {
                    track,
                    url,
                    cache_dir: audio_cache_path,
                })?;
                Ok(true)
            }
            CacheRequest::Quit => {
                self.shutdown().await?;
                Ok(false)
            }
        }
    }

    /// Drain the queue, emit `finished` and stop
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
