//! Library scanner: one audio file in, one normalized track record out
//!
//! Scanning holds no shared state, so callers may run any number of scans in
//! parallel.

use lofty::prelude::*;
use lofty::tag::{ItemKey, Tag};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, WorkerError};
use crate::media::tags;

/// File extensions considered audio when walking directories
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "opus", "m4a", "aac", "mp4", "wav", "aiff", "ape", "wv",
];

/// Artist delimiters, in priority order
const ARTIST_DELIMITERS: &[char] = &['&', '、', ',', '/'];

/// Vendor tag keys carrying the track gain contain this
const VENDOR_GAIN_KEY: &str = "replaygain_track_gain";

const HASH_CHUNK: usize = 64 * 1024;

/// Normalized record for a scanned file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRecord {
    /// Content hash, hex encoded
    pub hash: String,
    pub path: PathBuf,
    pub title: String,
    pub artists: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disc_number: Option<u32>,
    pub duration_ms: u64,
    /// Audio bitrate in kbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// Track gain in dB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_gain: Option<f64>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Scanner {
    unknown_artist: String,
}

impl Scanner {
    pub fn new(unknown_artist: impl Into<String>) -> Self {
        Self {
            unknown_artist: unknown_artist.into(),
        }
    }

    /// Scan one file
    pub fn scan(&self, path: &Path) -> Result<TrackRecord> {
        let size = fs::metadata(path)
            .map_err(|e| WorkerError::fs(path, e))?
            .len();
        let hash = content_hash(path)?;

        let tagged_file = tags::read_tagged(path)?;
        let properties = tagged_file.properties();
        let primary = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

        let text = |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let title = text(primary.and_then(|t| t.title().map(|s| s.into_owned())))
            .unwrap_or_else(|| file_stem(path));
        let raw_artist = primary.and_then(|t| t.artist().map(|s| s.into_owned()));

        let record = TrackRecord {
            hash,
            path: path.to_path_buf(),
            title,
            artists: split_artists(raw_artist.as_deref(), &self.unknown_artist),
            album: text(primary.and_then(|t| t.album().map(|s| s.into_owned()))),
            album_artist: text(
                primary.and_then(|t| t.get_string(&ItemKey::AlbumArtist).map(str::to_string)),
            ),
            track_number: primary.and_then(|t| t.track()),
            disc_number: primary.and_then(|t| t.disk()),
            duration_ms: properties.duration().as_millis() as u64,
            bitrate: properties.audio_bitrate(),
            sample_rate: properties.sample_rate(),
            replay_gain: replay_gain(primary, tagged_file.tags()),
            size,
        };

        debug!("Scanned {} -> {}", path.display(), record.title);
        Ok(record)
    }

    /// Scan on the blocking pool
    pub async fn scan_async(&self, path: PathBuf) -> Result<TrackRecord> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&path))
            .await
            .map_err(|_| WorkerError::Panicked)?
    }
}

/// MD5 over the file contents
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| WorkerError::fs(path, e))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_CHUNK];

    loop {
        let n = file.read(&mut buffer).map_err(|e| WorkerError::fs(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Split an artist string on the first delimiter it contains
///
/// # Examples
///
/// ```
/// use tuneworker::scanner::split_artists;
///
/// assert_eq!(split_artists(Some("A & B"), "?"), vec!["A", "B"]);
/// assert_eq!(split_artists(None, "?"), vec!["?"]);
/// ```
pub fn split_artists(raw: Option<&str>, unknown_artist: &str) -> Vec<String> {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return vec![unknown_artist.to_string()];
    }

    let Some(delimiter) = ARTIST_DELIMITERS.iter().find(|d| raw.contains(**d)) else {
        return vec![raw.to_string()];
    };

    let names: Vec<String> = raw
        .split(*delimiter)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();

    if names.is_empty() {
        vec![unknown_artist.to_string()]
    } else {
        names
    }
}

/// Track gain: the primary tag's gain field, then any other tag's, then
/// vendor entries whose key mentions the track gain
fn replay_gain(primary: Option<&Tag>, all: &[Tag]) -> Option<f64> {
    let standard = |tag: &Tag| {
        tag.get_string(&ItemKey::ReplayGainTrackGain)
            .and_then(parse_gain)
    };

    if let Some(gain) = primary.and_then(standard) {
        return Some(gain);
    }
    if let Some(gain) = all.iter().find_map(standard) {
        return Some(gain);
    }

    all.iter().flat_map(|tag| tag.items()).find_map(|item| match item.key() {
        ItemKey::Unknown(key) if key.to_ascii_lowercase().contains(VENDOR_GAIN_KEY) => {
            item.value().text().and_then(parse_gain)
        }
        _ => None,
    })
}

/// Parse values such as `-6.52 dB` or `+1.2`
pub fn parse_gain(value: &str) -> Option<f64> {
    let number: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
        .collect();
    number.parse::<f64>().ok().filter(|g| g.is_finite())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files and directories (recursively) into audio file paths
///
/// Directory symlinks are not followed, so a link cycle inside a library
/// cannot yield the same file twice.
pub fn collect_audio_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry.map_err(|e| walk_error(path, e))?;
                if entry.file_type().is_file() && is_audio_file(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    files.sort();
    Ok(files)
}

fn walk_error(root: &Path, error: walkdir::Error) -> WorkerError {
    let path = error.path().unwrap_or(root).to_path_buf();
    let source = error
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
    WorkerError::fs(path, source)
}
