//! Tag and picture operations on audio data via lofty
//!
//! lofty needs seekable I/O over the original file, so in-memory buffers are
//! staged through a temp file that is removed on every exit path.

use lofty::config::WriteOptions;
use lofty::file::TaggedFile;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::{Result, WorkerError};

/// Values used where the file has no tag of its own
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagValues {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
}

/// Apply fallback tags and an optional front cover to an in-memory audio buffer
///
/// Existing non-empty tag values win over `fallback`. Returns a new buffer;
/// `audio_data` is never modified.
pub fn apply_tags_in_memory(
    audio_data: &[u8],
    file_extension: &str,
    fallback: &TagValues,
    cover_jpeg: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let temp = TempAudio::create(audio_data, file_extension)?;

    let mut tagged_file = read_tagged(temp.path())?;
    let tag = tag_for_writing(&mut tagged_file)?;

    merge_fallback(tag, fallback);
    if let Some(cover) = cover_jpeg {
        replace_front_cover(tag, cover);
    }

    tagged_file
        .save_to_path(temp.path(), WriteOptions::default())
        .map_err(|e| WorkerError::tag(format!("Failed to save tags: {}", e)))?;

    let result = fs::read(temp.path()).map_err(|e| WorkerError::fs(temp.path(), e))?;
    Ok(result)
}

/// Replace the front cover of an audio file in place
pub fn embed_cover_in_file(audio_path: &Path, cover_jpeg: &[u8]) -> Result<()> {
    let mut tagged_file = read_tagged(audio_path)?;
    let tag = tag_for_writing(&mut tagged_file)?;
    replace_front_cover(tag, cover_jpeg);

    tagged_file
        .save_to_path(audio_path, WriteOptions::default())
        .map_err(|e| WorkerError::tag(format!("Failed to save embedded cover: {}", e)))?;

    debug!("Embedded cover art in: {}", audio_path.display());
    Ok(())
}

/// Whether any tag in the file carries a front cover
pub fn has_front_cover(audio_path: &Path) -> Result<bool> {
    let tagged_file = read_tagged(audio_path)?;
    Ok(tagged_file.tags().iter().any(|tag| {
        tag.pictures()
            .iter()
            .any(|p| p.pic_type() == PictureType::CoverFront)
    }))
}

/// Open a file, sniffing its format from content rather than extension
pub fn read_tagged(path: &Path) -> Result<TaggedFile> {
    Probe::open(path)
        .map_err(|e| WorkerError::tag(format!("Failed to open audio file: {}", e)))?
        .guess_file_type()
        .map_err(|e| WorkerError::tag(format!("Failed to detect audio format: {}", e)))?
        .read()
        .map_err(|e| WorkerError::tag(format!("Failed to read audio tags: {}", e)))
}

/// Primary tag, else any tag, else a new tag of the file's primary type
fn tag_for_writing(tagged_file: &mut TaggedFile) -> Result<&mut Tag> {
    if tagged_file.primary_tag().is_none() && tagged_file.first_tag().is_none() {
        let tag_type = tagged_file.primary_tag_type();
        tagged_file.insert_tag(Tag::new(tag_type));
    }

    if tagged_file.primary_tag().is_some() {
        return tagged_file
            .primary_tag_mut()
            .ok_or_else(|| WorkerError::tag("Failed to create tag"));
    }
    tagged_file
        .first_tag_mut()
        .ok_or_else(|| WorkerError::tag("Failed to create tag"))
}

fn merge_fallback(tag: &mut Tag, fallback: &TagValues) {
    if is_blank(tag.title().as_deref()) {
        if let Some(title) = &fallback.title {
            tag.set_title(title.clone());
        }
    }
    if is_blank(tag.artist().as_deref()) {
        if let Some(artist) = &fallback.artist {
            tag.set_artist(artist.clone());
        }
    }
    if is_blank(tag.album().as_deref()) {
        if let Some(album) = &fallback.album {
            tag.set_album(album.clone());
        }
    }
    if is_blank(tag.get_string(&ItemKey::AlbumArtist)) {
        if let Some(album_artist) = &fallback.album_artist {
            tag.insert_text(ItemKey::AlbumArtist, album_artist.clone());
        }
    }
}

fn replace_front_cover(tag: &mut Tag, cover_jpeg: &[u8]) {
    let picture = Picture::new_unchecked(
        PictureType::CoverFront,
        Some(MimeType::Jpeg),
        None,
        cover_jpeg.to_vec(),
    );
    tag.remove_picture_type(PictureType::CoverFront);
    tag.push_picture(picture);
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp copy of an audio buffer, deleted on drop
struct TempAudio {
    path: PathBuf,
}

impl TempAudio {
    fn create(data: &[u8], file_extension: &str) -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!(
            "tuneworker_tag_{}_{}_{}.{}",
            std::process::id(),
            nanos,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
            file_extension
        ));

        fs::write(&path, data).map_err(|e| WorkerError::fs(&path, e))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempAudio {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
