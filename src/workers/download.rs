//! Download worker: fetch, tag and file tracks into an Artist/Album tree
//!
//! Unlike the cache worker every task is user-visible, so each one reports
//! `download-start`, progress, and exactly one terminal message.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::media::MetadataWriter;
use crate::queue::{
    EventSink, FailurePolicy, QueuedTask, TaskHandler, WorkerHandle, spawn_worker,
};
use crate::track::Track;
use crate::utils::{resolve_extension, sanitize_or};

/// Messages from the owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DownloadRequest {
    Download {
        track: Track,
        url: String,
        download_path: PathBuf,
        task_id: String,
    },
    Cancel {
        task_id: String,
    },
    Clear,
}

/// Messages to the owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    DownloadStart { task_id: String },
    DownloadProgress { task_id: String, progress: u32 },
    DownloadComplete { task_id: String, result: DownloadResult },
    DownloadError { task_id: String, error: String },
    DownloadCancelled { task_id: String },
}

impl DownloadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::DownloadStart { task_id }
            | DownloadEvent::DownloadProgress { task_id, .. }
            | DownloadEvent::DownloadComplete { task_id, .. }
            | DownloadEvent::DownloadError { task_id, .. }
            | DownloadEvent::DownloadCancelled { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub path: PathBuf,
    /// The target already existed and nothing was fetched
    pub skipped: bool,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub task_id: String,
    pub track: Track,
    pub url: String,
    pub download_path: PathBuf,
}

impl QueuedTask for DownloadTask {
    fn task_id(&self) -> Option<&str> {
        Some(&self.task_id)
    }
}

/// Authoritative album metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumInfo {
    pub name: String,
    pub artist: String,
}

/// Source of album metadata for descriptors that lack an album artist
#[async_trait]
pub trait AlbumDirectory: Send + Sync {
    async fn lookup(&self, album_id: &str) -> Result<AlbumInfo>;
}

/// Album lookups against the local companion service
pub struct HttpAlbumDirectory {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct AlbumResponse {
    album: AlbumBody,
}

#[derive(Deserialize)]
struct AlbumBody {
    name: String,
    artist: ArtistBody,
}

#[derive(Deserialize)]
struct ArtistBody {
    name: String,
}

impl HttpAlbumDirectory {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn album_url(&self, album_id: &str) -> String {
        format!(
            "{}/album?id={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(album_id)
        )
    }
}

#[async_trait]
impl AlbumDirectory for HttpAlbumDirectory {
    async fn lookup(&self, album_id: &str) -> Result<AlbumInfo> {
        let url = self.album_url(album_id);
        debug!("Album lookup: {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| WorkerError::transport(&url, e))?;

        if !response.status().is_success() {
            return Err(WorkerError::RequestFailed {
                url,
                status: response.status().as_u16(),
            });
        }

        let body: AlbumResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::transport(&url, e))?;

        Ok(AlbumInfo {
            name: body.album.name,
            artist: body.album.artist.name,
        })
    }
}

/// Emits rounded progress, skipping repeats
struct ProgressReporter<'a> {
    events: &'a EventSink<DownloadEvent>,
    task_id: &'a str,
    last: Option<u32>,
}

impl<'a> ProgressReporter<'a> {
    fn new(events: &'a EventSink<DownloadEvent>, task_id: &'a str) -> Self {
        Self {
            events,
            task_id,
            last: None,
        }
    }

    fn report(&mut self, percent: f64) {
        let progress = percent.round().clamp(0.0, 100.0) as u32;
        if self.last == Some(progress) {
            return;
        }
        self.last = Some(progress);
        self.events.emit(DownloadEvent::DownloadProgress {
            task_id: self.task_id.to_string(),
            progress,
        });
    }
}

/// Share of the reported range taken by the network transfer
const FETCH_SHARE: f64 = 0.8;
const TAGGED_PROGRESS: f64 = 95.0;

pub struct DownloadHandler {
    writer: MetadataWriter,
    albums: Arc<dyn AlbumDirectory>,
    unknown_artist: String,
    unknown_album: String,
}

impl DownloadHandler {
    pub fn new(
        writer: MetadataWriter,
        albums: Arc<dyn AlbumDirectory>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            writer,
            albums,
            unknown_artist: config.unknown_artist.clone(),
            unknown_album: config.unknown_album.clone(),
        }
    }

    /// Album and album artist for directory naming
    ///
    /// Descriptors carrying an album artist are trusted as-is. Otherwise the
    /// album directory is asked; any failure there degrades to the
    /// descriptor's own values, then to the unknown placeholders.
    pub async fn resolve_album(&self, track: &Track) -> AlbumInfo {
        let descriptor_album = track.album_name().map(str::to_string);

        if let Some(artist) = track.album_artist() {
            return AlbumInfo {
                name: descriptor_album.unwrap_or_else(|| self.unknown_album.clone()),
                artist: artist.to_string(),
            };
        }

        if let Some(album_id) = track.album_id() {
            match self.albums.lookup(&album_id).await {
                Ok(info) if !info.name.trim().is_empty() && !info.artist.trim().is_empty() => {
                    return info;
                }
                Ok(_) => debug!("Album {} lookup returned empty fields", album_id),
                Err(e) => warn!("Album lookup for {} failed: {}", album_id, e),
            }
        }

        AlbumInfo {
            name: descriptor_album.unwrap_or_else(|| self.unknown_album.clone()),
            artist: track
                .artist_names()
                .into_iter()
                .next()
                .unwrap_or_else(|| self.unknown_artist.clone()),
        }
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

/// `<root>/<artist>/<album>/<song>.<ext>`
pub fn download_target(root: &Path, album: &AlbumInfo, track: &Track, extension: &str) -> PathBuf {
    root.join(sanitize_or(&album.artist, "Unknown Artist"))
        .join(sanitize_or(&album.name, "Unknown Album"))
        .join(format!("{}.{}", sanitize_or(&track.name, "track"), extension))
}

#[async_trait]
impl TaskHandler for DownloadHandler {
    type Task = DownloadTask;
    type Output = DownloadResult;
    type Event = DownloadEvent;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Report
    }

    async fn execute(
        &self,
        task: &DownloadTask,
        events: &EventSink<DownloadEvent>,
    ) -> Result<DownloadResult> {
        events.emit(DownloadEvent::DownloadStart {
            task_id: task.task_id.clone(),
        });
        let mut progress = ProgressReporter::new(events, &task.task_id);
        progress.report(0.0);

        let album = self.resolve_album(&task.track).await;
        // The target path carries the extension, so the HEAD precedes the existence check
        let content_type = self.writer.fetcher().content_type(&task.url).await;
        let extension = resolve_extension(&task.url, &content_type);
        let target = download_target(&task.download_path, &album, &task.track, &extension);

        if fs::try_exists(&target).await.unwrap_or(false) {
            info!("Already downloaded, skipping: {}", target.display());
            progress.report(100.0);
            let size = fs::metadata(&target).await.map(|m| m.len()).unwrap_or(0);
            return Ok(DownloadResult {
                path: target,
                skipped: true,
                size,
            });
        }

        let fetched = self
            .writer
            .fetcher()
            .fetch_with_progress(&task.url, |p| progress.report(p * FETCH_SHARE))
            .await?;
        progress.report(FETCH_SHARE * 100.0);

        let tagged = self
            .writer
            .apply_metadata(fetched.data, &task.track, &extension)
            .await?;
        progress.report(TAGGED_PROGRESS);

        Self::write(&target, &tagged).await?;
        progress.report(100.0);

        info!("Downloaded {} -> {}", task.track.name, target.display());
        Ok(DownloadResult {
            path: target,
            skipped: false,
            size: tagged.len() as u64,
        })
    }

    fn completed(&self, task: &DownloadTask, output: DownloadResult) -> Option<DownloadEvent> {
        Some(DownloadEvent::DownloadComplete {
            task_id: task.task_id.clone(),
            result: output,
        })
    }

    fn failed(&self, task: &DownloadTask, error: &WorkerError) -> Option<DownloadEvent> {
        Some(DownloadEvent::DownloadError {
            task_id: task.task_id.clone(),
            error: error.to_string(),
        })
    }

    fn cancelled(&self, task: &DownloadTask) -> Option<DownloadEvent> {
        Some(DownloadEvent::DownloadCancelled {
            task_id: task.task_id.clone(),
        })
    }
}

/// Running download worker
pub struct DownloadWorker {
    handle: WorkerHandle<DownloadTask>,
}

impl DownloadWorker {
    pub fn spawn(handler: DownloadHandler, events: EventSink<DownloadEvent>) -> Self {
        let handle = spawn_worker(Arc::new(handler), events);
        Self { handle }
    }

    pub fn enqueue(&self, task: DownloadTask) -> Result<()> {
        self.handle.enqueue(task)
    }

    /// Remove a queued task; emits `download-cancelled` only if it was queued
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        self.handle.cancel(task_id)
    }

    /// Drop every queued task silently
    pub fn clear(&self) -> Result<()> {
        self.handle.clear()
    }

    pub fn handle_message(&self, request: DownloadRequest) -> Result<()> {
        match request {
            DownloadRequest::Download {
                track,
                url,
                download_path,
                task_id,
            } => self.enqueue(DownloadTask {
                task_id,
                track,
                url,
                download_path,
            }),
            DownloadRequest::Cancel { task_id } => self.cancel(&task_id),
            DownloadRequest::Clear => self.clear(),
        }
    }

    /// Finish queued downloads, then stop
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
