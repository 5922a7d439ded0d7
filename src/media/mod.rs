//! Media post-processing: tag merge and cover embedding for fetched audio
//!
//! CPU-bound work (image resize, tag rewrite) runs on the blocking pool so
//! the worker loops stay responsive.

pub mod tags;

use bytes::Bytes;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::fetcher::Fetcher;
use crate::track::Track;
use crate::utils::cover_art;

pub use tags::TagValues;

/// Applies descriptor-derived tags and a front cover to audio buffers
#[derive(Clone)]
pub struct MetadataWriter {
    fetcher: Fetcher,
    cover_size: u32,
    jpeg_quality: u8,
    cover_source_query: Option<String>,
}

impl MetadataWriter {
    pub fn new(fetcher: Fetcher, config: &WorkerConfig) -> Self {
        Self {
            fetcher,
            cover_size: config.cover_size,
            jpeg_quality: config.jpeg_quality,
            cover_source_query: config.cover_source_query.clone(),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// URL of the high-resolution source for an album picture
    pub fn cover_source_url(&self, pic_url: &str) -> String {
        match self.cover_source_query.as_deref() {
            Some(query) if !query.is_empty() => {
                let separator = if pic_url.contains('?') { '&' } else { '?' };
                format!("{}{}{}", pic_url, separator, query)
            }
            _ => pic_url.to_string(),
        }
    }

    /// Fetch the raw high-resolution cover image
    pub async fn fetch_cover_source(&self, pic_url: &str) -> Result<(Bytes, String)> {
        let url = self.cover_source_url(pic_url);
        let fetched = self
            .fetcher
            .fetch(&url)
            .await
            .map_err(|e| WorkerError::tag(format!("Cover unreachable: {}", e)))?;
        Ok((fetched.data, fetched.content_type))
    }

    /// Fetch a cover and normalize it for embedding
    pub async fn fetch_cover(&self, pic_url: &str) -> Result<Vec<u8>> {
        let (raw, _) = self.fetch_cover_source(pic_url).await?;
        let (size, quality) = (self.cover_size, self.jpeg_quality);

        tokio::task::spawn_blocking(move || cover_art::process_cover_art(&raw, size, quality))
            .await
            .map_err(|e| WorkerError::tag(format!("Cover processing task panicked: {}", e)))?
    }

    /// Produce a tagged copy of `audio_data` for `track`
    ///
    /// Fails as a whole when tags cannot be read or written or the album
    /// picture cannot be fetched; callers write nothing in that case.
    pub async fn apply_metadata(
        &self,
        audio_data: Bytes,
        track: &Track,
        file_extension: &str,
    ) -> Result<Vec<u8>> {
        let cover = match track.pic_url() {
            Some(pic_url) => Some(self.fetch_cover(pic_url).await?),
            None => None,
        };

        let fallback = fallback_tags(track);
        let extension = file_extension.to_string();
        debug!(
            "Tagging {} ({}, cover: {})",
            track.name,
            extension,
            cover.is_some()
        );

        tokio::task::spawn_blocking(move || {
            tags::apply_tags_in_memory(&audio_data, &extension, &fallback, cover.as_deref())
        })
        .await
        .map_err(|e| WorkerError::tag(format!("Tagging task panicked: {}", e)))?
    }
}

/// Tag values derived from a descriptor
pub fn fallback_tags(track: &Track) -> TagValues {
    let artists = track.artist_names();
    let non_empty = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());

    TagValues {
        title: non_empty(&track.name),
        artist: non_empty(&artists.join("/")),
        album: track.album_name().map(str::to_string),
        album_artist: track
            .album_artist()
            .map(str::to_string)
            .or_else(|| artists.first().cloned()),
    }
}
