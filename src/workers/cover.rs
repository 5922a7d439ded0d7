//! Cover-write worker: embed album covers into audio files already on disk
//!
//! Embed requests accumulate in a pending map keyed by file path. Each sweep
//! works through every entry except the file currently being played, drops
//! the entries that succeed, and retries the rest after a fixed backoff for
//! as long as passes keep making progress.
//!
//! Sidecar images are written on background tasks and never retried. The
//! worker waits for all of them before acknowledging shutdown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::media::{MetadataWriter, tags};
use crate::queue::{
    EventSink, FailurePolicy, QueuedTask, TaskHandler, WorkerHandle, spawn_worker,
};
use crate::utils::cover_art;

/// Where the cover ends up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedOption {
    #[default]
    Both,
    EmbedOnly,
    FileOnly,
}

impl EmbedOption {
    pub fn embeds(self) -> bool {
        self != EmbedOption::FileOnly
    }

    pub fn writes_sidecar(self) -> bool {
        self != EmbedOption::EmbedOnly
    }
}

/// What to do when a cover is already present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedStyle {
    #[default]
    Overwrite,
    KeepExisting,
}

/// Messages from the owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CoverRequest {
    Normal {
        file_path: PathBuf,
        pic_url: String,
        #[serde(default)]
        current_playing_path: Option<PathBuf>,
        #[serde(default)]
        embed_option: EmbedOption,
        #[serde(default)]
        embed_style: EmbedStyle,
    },
    /// Update the playing marker without requesting a write
    CurrentPlaying {
        #[serde(default)]
        current_playing_path: Option<PathBuf>,
    },
    Finished,
}

/// Messages to the owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CoverEvent {
    Done,
}

#[derive(Debug, Clone)]
pub struct CoverTask {
    pub file_path: PathBuf,
    pub pic_url: String,
    pub current_playing_path: Option<PathBuf>,
    pub embed_option: EmbedOption,
    pub embed_style: EmbedStyle,
}

impl QueuedTask for CoverTask {}

/// Desired cover for a path awaiting embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCover {
    pub pic_url: String,
    /// Failed attempts so far
    pub attempts: u32,
}

/// State shared between the worker loop and its handle
#[derive(Debug, Default)]
pub struct CoverState {
    pending: Mutex<HashMap<PathBuf, PendingCover>>,
    current_playing: Mutex<Option<PathBuf>>,
}

impl CoverState {
    pub fn set_current_playing(&self, path: Option<PathBuf>) {
        if let Ok(mut current) = self.current_playing.lock() {
            *current = path;
        }
    }

    pub fn current_playing(&self) -> Option<PathBuf> {
        self.current_playing.lock().ok().and_then(|c| c.clone())
    }

    /// Queue (or replace) the cover wanted for `path`
    pub fn insert(&self, path: PathBuf, pic_url: String) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                path,
                PendingCover {
                    pic_url,
                    attempts: 0,
                },
            );
        }
    }

    pub fn pending(&self) -> HashMap<PathBuf, PendingCover> {
        self.pending
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Entries eligible for this pass
    fn snapshot(&self) -> Vec<(PathBuf, String)> {
        let playing = self.current_playing();
        self.pending
            .lock()
            .map(|pending| {
                pending
                    .iter()
                    .filter(|(path, _)| Some(*path) != playing.as_ref())
                    .map(|(path, entry)| (path.clone(), entry.pic_url.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove an entry unless it was replaced by a newer request meanwhile
    fn settle(&self, path: &Path, pic_url: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.get(path).is_some_and(|e| e.pic_url == pic_url) {
                pending.remove(path);
            }
        }
    }

    fn record_failure(&self, path: &Path) -> u32 {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| {
                pending.get_mut(path).map(|entry| {
                    entry.attempts += 1;
                    entry.attempts
                })
            })
            .unwrap_or(0)
    }
}

/// Writes one cover into one audio file
#[async_trait]
pub trait CoverApplier: Send + Sync {
    async fn apply(&self, audio_path: &Path, pic_url: &str) -> Result<()>;
}

/// Fetches, normalizes and embeds the front cover in place
pub struct EmbeddedCover {
    writer: MetadataWriter,
}

impl EmbeddedCover {
    pub fn new(writer: MetadataWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl CoverApplier for EmbeddedCover {
    async fn apply(&self, audio_path: &Path, pic_url: &str) -> Result<()> {
        let jpeg = self.writer.fetch_cover(pic_url).await?;
        let path = audio_path.to_path_buf();
        tokio::task::spawn_blocking(move || tags::embed_cover_in_file(&path, &jpeg))
            .await
            .map_err(|e| WorkerError::tag(format!("Cover embed task panicked: {}", e)))?
    }
}

pub struct CoverHandler {
    state: Arc<CoverState>,
    applier: Arc<dyn CoverApplier>,
    writer: MetadataWriter,
    retry_delay: Duration,
    sidecars: Mutex<JoinSet<()>>,
}

impl CoverHandler {
    pub fn new(
        state: Arc<CoverState>,
        applier: Arc<dyn CoverApplier>,
        writer: MetadataWriter,
        retry_delay: Duration,
    ) -> Self {
        Self {
            state,
            applier,
            writer,
            retry_delay,
            sidecars: Mutex::new(JoinSet::new()),
        }
    }

    /// One pass over every non-playing entry; returns (succeeded, failed)
    pub async fn sweep_pass(&self) -> (usize, usize) {
        let (mut succeeded, mut failed) = (0, 0);

        for (path, pic_url) in self.state.snapshot() {
            match self.applier.apply(&path, &pic_url).await {
                Ok(()) => {
                    debug!("Cover written: {}", path.display());
                    self.state.settle(&path, &pic_url);
                    succeeded += 1;
                }
                Err(e) => {
                    let attempts = self.state.record_failure(&path);
                    warn!(
                        "Cover write failed for {} (attempt {}): {}",
                        path.display(),
                        attempts,
                        e
                    );
                    failed += 1;
                }
            }
        }

        (succeeded, failed)
    }

    /// Repeat passes with backoff until one fully succeeds or stalls
    pub async fn sweep(&self) {
        loop {
            let (succeeded, failed) = self.sweep_pass().await;
            if failed == 0 || succeeded == 0 {
                if failed > 0 {
                    debug!("Cover sweep stalled with {} failing entries", failed);
                }
                return;
            }
            debug!(
                "Cover sweep: {} written, {} to retry in {:?}",
                succeeded, failed, self.retry_delay
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn keep_existing_embed(path: &Path) -> bool {
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || tags::has_front_cover(&path)).await {
            Ok(Ok(present)) => present,
            Ok(Err(e)) => {
                debug!("Could not inspect existing cover: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    fn spawn_sidecar(&self, task: &CoverTask) {
        let writer = self.writer.clone();
        let audio_path = task.file_path.clone();
        let pic_url = task.pic_url.clone();
        let keep_existing = task.embed_style == EmbedStyle::KeepExisting;

        let write = async move {
            if let Err(e) = write_sidecar(&writer, &audio_path, &pic_url, keep_existing).await {
                warn!("Sidecar cover for {} failed: {}", audio_path.display(), e);
            }
        };
        match self.sidecars.lock() {
            Ok(mut sidecars) => {
                while sidecars.try_join_next().is_some() {}
                sidecars.spawn(write);
            }
            Err(_) => {
                tokio::spawn(write);
            }
        }
    }

    /// Wait for every sidecar write started so far
    async fn drain_sidecars(&self) {
        let mut sidecars = match self.sidecars.lock() {
            Ok(mut sidecars) => std::mem::take(&mut *sidecars),
            Err(_) => return,
        };
        while let Some(joined) = sidecars.join_next().await {
            if let Err(e) = joined {
                warn!("Sidecar cover task failed: {}", e);
            }
        }
    }
}

/// Write the cover image beside the audio file as `<basename>.(jpg|png)`
pub async fn write_sidecar(
    writer: &MetadataWriter,
    audio_path: &Path,
    pic_url: &str,
    keep_existing: bool,
) -> Result<Option<PathBuf>> {
    if keep_existing {
        for extension in ["jpg", "png"] {
            if fs::try_exists(audio_path.with_extension(extension))
                .await
                .unwrap_or(false)
            {
                debug!("Sidecar cover already present for {}", audio_path.display());
                return Ok(None);
            }
        }
    }

    let (data, content_type) = writer.fetch_cover_source(pic_url).await?;
    let mime = if content_type.is_empty() {
        cover_art::sniff_mime(&data).unwrap_or_default().to_string()
    } else {
        content_type
    };

    let target = audio_path.with_extension(cover_art::sidecar_extension(&mime));
    fs::write(&target, &data)
        .await
        .map_err(|e| WorkerError::fs(&target, e))?;

    debug!("Wrote sidecar cover {}", target.display());
    Ok(Some(target))
}

#[async_trait]
impl TaskHandler for CoverHandler {
    type Task = CoverTask;
    type Output = ();
    type Event = CoverEvent;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Swallow
    }

    async fn execute(&self, task: &CoverTask, _events: &EventSink<CoverEvent>) -> Result<()> {
        self.state
            .set_current_playing(task.current_playing_path.clone());

        if task.embed_option.embeds() {
            let skip = task.embed_style == EmbedStyle::KeepExisting
                && Self::keep_existing_embed(&task.file_path).await;
            if skip {
                debug!("Keeping existing cover in {}", task.file_path.display());
            } else {
                self.state
                    .insert(task.file_path.clone(), task.pic_url.clone());
            }
        }

        if task.embed_option.writes_sidecar() {
            self.spawn_sidecar(task);
        }

        self.sweep().await;
        Ok(())
    }

    fn completed(&self, _task: &CoverTask, _output: ()) -> Option<CoverEvent> {
        None
    }

    async fn finish(&self, _events: &EventSink<CoverEvent>) -> Option<CoverEvent> {
        self.state.set_current_playing(None);
        self.drain_sidecars().await;
        self.sweep().await;

        let left = self.state.pending().len();
        if left > 0 {
            warn!("{} cover writes still failing at shutdown", left);
        }
        info!("Cover worker finished");
        Some(CoverEvent::Done)
    }
}

/// Running cover-write worker
pub struct CoverWorker {
    handle: WorkerHandle<CoverTask>,
    state: Arc<CoverState>,
}

impl CoverWorker {
    pub fn spawn(
        writer: MetadataWriter,
        applier: Arc<dyn CoverApplier>,
        retry_delay: Duration,
        events: EventSink<CoverEvent>,
    ) -> Self {
        let state = Arc::new(CoverState::default());
        let handler = CoverHandler::new(Arc::clone(&state), applier, writer, retry_delay);
        let handle = spawn_worker(Arc::new(handler), events);
        Self { handle, state }
    }

    pub fn state(&self) -> &Arc<CoverState> {
        &self.state
    }

    pub fn set_current_playing(&self, path: Option<PathBuf>) {
        self.state.set_current_playing(path);
    }

    pub fn enqueue(&self, task: CoverTask) -> Result<()> {
        self.handle.enqueue(task)
    }

    /// Dispatch an owner message; returns false once the worker has finished
    pub async fn handle_message(&self, request: CoverRequest) -> Result<bool> {
        match request {
            CoverRequest::Normal {
                file_path,
                pic_url,
                current_playing_path,
                embed_option,
                embed_style,
            } => {
                self.enqueue(CoverTask {
                    file_path,
                    pic_url,
                    current_playing_path,
                    embed_option,
                    embed_style,
                })?;
                Ok(true)
            }
            CoverRequest::CurrentPlaying {
                current_playing_path,
            } => {
                self.set_current_playing(current_playing_path);
                Ok(true)
            }
            CoverRequest::Finished => {
                self.shutdown().await?;
                Ok(false)
            }
        }
    }

    /// Final sweep, `{status: done}`, stop
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
