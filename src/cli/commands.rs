//! CLI command handlers

use anyhow::{Context, Result, bail};
use clap_complete::generate;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::WorkerKind;
use super::transport::{RequestReader, spawn_writer};
use crate::config::WorkerConfig;
use crate::fetcher::Fetcher;
use crate::media::MetadataWriter;
use crate::plugin::host::{CapabilityHost, JsonStore};
use crate::plugin::{PluginEvent, PluginRequest, PluginWorker};
use crate::queue::EventSink;
use crate::scanner::{Scanner, collect_audio_files};
use crate::workers::cover::EmbeddedCover;
use crate::workers::download::{DownloadHandler, HttpAlbumDirectory};
use crate::workers::{
    CacheRequest, CacheWorker, CoverRequest, CoverWorker, DownloadRequest, DownloadWorker,
};

/// Handle the `serve` command
pub async fn serve(worker: WorkerKind, config: &WorkerConfig) -> Result<()> {
    let fetcher = Fetcher::new(config).context("Failed to create HTTP client")?;
    let writer = MetadataWriter::new(fetcher.clone(), config);
    let mut requests = RequestReader::stdin();

    info!("Serving {:?} worker on stdin/stdout", worker);

    match worker {
        WorkerKind::Cache => {
            let (events, rx) = EventSink::channel();
            let output = spawn_writer(rx);
            let worker = CacheWorker::spawn(writer, events);

            let mut running = true;
            while let Some(request) = requests.next::<CacheRequest>().await? {
                if !worker.handle_message(request).await? {
                    running = false;
                    break;
                }
            }
            if running {
                worker.shutdown().await?;
            }
            drop(worker);
            output.await??;
        }
        WorkerKind::Download => {
            let (events, rx) = EventSink::channel();
            let output = spawn_writer(rx);
            let albums = Arc::new(HttpAlbumDirectory::new(
                fetcher.client().clone(),
                config.album_service_url.clone(),
                config.lookup_timeout(),
            ));
            let worker = DownloadWorker::spawn(DownloadHandler::new(writer, albums, config), events);

            while let Some(request) = requests.next::<DownloadRequest>().await? {
                worker.handle_message(request)?;
            }
            worker.shutdown().await?;
            drop(worker);
            output.await??;
        }
        WorkerKind::Cover => {
            let (events, rx) = EventSink::channel();
            let output = spawn_writer(rx);
            let applier = Arc::new(EmbeddedCover::new(writer.clone()));
            let worker = CoverWorker::spawn(writer, applier, config.cover_retry_delay(), events);

            let mut running = true;
            while let Some(request) = requests.next::<CoverRequest>().await? {
                if !worker.handle_message(request).await? {
                    running = false;
                    break;
                }
            }
            if running {
                worker.shutdown().await?;
            }
            drop(worker);
            output.await??;
        }
        WorkerKind::Plugin => {
            let (events, rx) = EventSink::channel();
            let output = spawn_writer(rx);
            let worker = PluginWorker::spawn(config, events)?;

            while let Some(request) = requests.next::<PluginRequest>().await? {
                worker.handle_message(request)?;
            }
            worker.shutdown().await?;
            drop(worker);
            output.await??;
        }
    }

    info!("Worker stopped");
    Ok(())
}

/// Handle the `scan` command
pub async fn scan(paths: Vec<PathBuf>, parallel: usize, config: &WorkerConfig) -> Result<()> {
    let files = collect_audio_files(&paths).context("Failed to collect audio files")?;
    if files.is_empty() {
        warn!("No audio files found");
        return Ok(());
    }

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let scanner = Scanner::new(config.unknown_artist.clone());
    let mut results = stream::iter(files)
        .map(|path| {
            let scanner = scanner.clone();
            async move {
                let result = scanner.scan_async(path.clone()).await;
                (path, result)
            }
        })
        .buffer_unordered(parallel.max(1));

    let (mut scanned, mut failed) = (0usize, 0usize);
    while let Some((path, result)) = results.next().await {
        progress.inc(1);
        match result {
            Ok(record) => {
                progress.set_message(record.title.clone());
                println!("{}", serde_json::to_string(&record)?);
                scanned += 1;
            }
            Err(e) => {
                progress.suspend(|| warn!("Failed to scan {}: {}", path.display(), e));
                failed += 1;
            }
        }
    }

    progress.finish_and_clear();
    info!("Scanned {} files ({} failed)", scanned, failed);
    Ok(())
}

/// Handle the `plugin run` command
pub async fn plugin_run(
    module: &Path,
    method: String,
    args: Option<String>,
    store: Option<PathBuf>,
    config: &WorkerConfig,
) -> Result<()> {
    let source = tokio::fs::read(module)
        .await
        .with_context(|| format!("Failed to read plugin {:?}", module))?;
    let args: Value = match args {
        Some(raw) => serde_json::from_str(&raw).context("Arguments must be valid JSON")?,
        None => Value::Null,
    };

    let store_path = match store {
        Some(path) => path,
        None => WorkerConfig::config_dir()?.join("plugin-store.json"),
    };
    let host = CapabilityHost::new(
        Fetcher::new(config).context("Failed to create HTTP client")?,
        JsonStore::open(&store_path).context("Failed to open plugin store")?,
    );

    let (events, mut rx) = EventSink::channel();
    let worker = PluginWorker::spawn(config, events)?;
    worker.load_bytes(source)?;
    worker.handle_message(PluginRequest::CallMethod {
        id: "cli".to_string(),
        method: method.clone(),
        args,
    })?;

    while let Some(event) = rx.recv().await {
        match event {
            PluginEvent::LoadDone { methods } => {
                info!("Loaded plugin with methods: {}", methods.join(", "));
            }
            PluginEvent::Error { message, .. } => bail!("Plugin failed to load: {}", message),
            PluginEvent::CallResult { result, error, .. } => {
                if let Some(error) = error {
                    bail!("{} failed: {}", method, error);
                }
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result.unwrap_or(Value::Null))?
                );
                break;
            }
            other => {
                if let Some(response) = host.answer(&other).await {
                    worker.handle_message(response)?;
                }
            }
        }
    }

    worker.shutdown().await?;
    Ok(())
}

/// Handle the `config` command
pub fn show_config(path: Option<&Path>, init: bool) -> Result<()> {
    let config = WorkerConfig::load(path)?;

    if init {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => WorkerConfig::config_path()?,
        };
        if target.exists() {
            info!("Config already exists at {}", target.display());
        } else {
            config.save(&target)?;
            info!("Wrote default config to {}", target.display());
        }
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Handle the `completion` command
pub fn completion(shell: clap_complete::Shell) {
    let mut cmd = super::Cli::command();
    generate(shell, &mut cmd, "tuneworker", &mut io::stdout());
}

// Extension trait for Cli to get clap Command
impl super::Cli {
    fn command() -> clap::Command {
        <Self as clap::CommandFactory>::command()
    }
}
