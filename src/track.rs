//! Track descriptor models
//!
//! Descriptors come from the owner process (online sources, plugins, the
//! local library) and are read-only here. Field names follow the owner's
//! JSON; unknown fields are carried through untouched so enriched records
//! round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Identifier that may arrive as a JSON number or string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackId {
    Number(i64),
    Text(String),
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackId::Number(n) => write!(f, "{}", n),
            TrackId::Text(s) => f.write_str(s),
        }
    }
}

impl Default for TrackId {
    fn default() -> Self {
        TrackId::Number(0)
    }
}

/// Artist entry, either `{ "name": .. }` or a bare string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtistRef {
    Named {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<TrackId>,
    },
    Plain(String),
}

impl ArtistRef {
    pub fn name(&self) -> &str {
        match self {
            ArtistRef::Named { name, .. } => name,
            ArtistRef::Plain(name) => name,
        }
    }
}

/// Album reference as carried by `al` / `album`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pic_url: Option<String>,
}

/// `album` may be a full reference or just a name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlbumField {
    Info(AlbumRef),
    Name(String),
}

/// Track descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(default)]
    pub id: TrackId,
    #[serde(default)]
    pub name: String,
    /// Bitrate in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ar: Vec<ArtistRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artists: Vec<ArtistRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub al: Option<AlbumRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<AlbumField>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Track {
    /// Artist names, first non-empty source of `ar`, `artists`, `albumArtist`
    pub fn artist_names(&self) -> Vec<String> {
        let from_refs = |refs: &[ArtistRef]| -> Vec<String> {
            refs.iter()
                .map(|a| a.name().trim())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        };

        let ar = from_refs(&self.ar);
        if !ar.is_empty() {
            return ar;
        }
        let artists = from_refs(&self.artists);
        if !artists.is_empty() {
            return artists;
        }
        self.album_artist()
            .map(|a| vec![a.to_string()])
            .unwrap_or_default()
    }

    /// Explicit album artist, if the descriptor carries one
    pub fn album_artist(&self) -> Option<&str> {
        self.album_artist
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// Album name, `al` before `album`
    pub fn album_name(&self) -> Option<&str> {
        let from_al = self.al.as_ref().and_then(|al| al.name.as_deref());
        let from_album = match &self.album {
            Some(AlbumField::Info(info)) => info.name.as_deref(),
            Some(AlbumField::Name(name)) => Some(name.as_str()),
            None => None,
        };
        from_al
            .into_iter()
            .chain(from_album)
            .map(str::trim)
            .find(|n| !n.is_empty())
    }

    /// Album picture URL, `al` before `album`
    pub fn pic_url(&self) -> Option<&str> {
        let from_al = self.al.as_ref().and_then(|al| al.pic_url.as_deref());
        let from_album = match &self.album {
            Some(AlbumField::Info(info)) => info.pic_url.as_deref(),
            _ => None,
        };
        from_al
            .into_iter()
            .chain(from_album)
            .map(str::trim)
            .find(|u| !u.is_empty())
    }

    pub fn album_id(&self) -> Option<String> {
        let from_al = self.al.as_ref().and_then(|al| al.id.as_ref());
        let from_album = match &self.album {
            Some(AlbumField::Info(info)) => info.id.as_ref(),
            _ => None,
        };
        from_al.or(from_album).map(|id| id.to_string())
    }

    /// Bitrate for naming; 0 when unknown
    pub fn bitrate(&self) -> u64 {
        self.br.unwrap_or(0)
    }
}

/// A track written to the cache directory, reported back to the owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTrack {
    #[serde(flatten)]
    pub track: Track,
    pub size: u64,
    pub path: PathBuf,
    pub cache: bool,
    pub inserted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn track(value: Value) -> Track {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_artist_precedence() {
        let t = track(json!({
            "id": 1,
            "name": "Song",
            "ar": [],
            "artists": [{"name": "From Artists"}],
            "albumArtist": "From Album Artist"
        }));
        assert_eq!(t.artist_names(), vec!["From Artists"]);

        let t = track(json!({"id": 1, "name": "Song", "ar": [{"name": "A"}, {"name": "B"}]}));
        assert_eq!(t.artist_names(), vec!["A", "B"]);

        let t = track(json!({"id": 1, "albumArtist": "Solo"}));
        assert_eq!(t.artist_names(), vec!["Solo"]);
        assert!(track(json!({"id": 1})).artist_names().is_empty());
    }

    #[test]
    fn test_plain_string_artists() {
        let t = track(json!({"id": "abc", "artists": ["X", "Y"]}));
        assert_eq!(t.artist_names(), vec!["X", "Y"]);
        assert_eq!(t.id.to_string(), "abc");
    }

    #[test]
    fn test_album_fields() {
        let t = track(json!({
            "id": 7,
            "al": {"id": 99, "name": "", "picUrl": "http://img/1.jpg"},
            "album": {"name": "Fallback", "picUrl": "http://img/2.jpg"}
        }));
        assert_eq!(t.album_name(), Some("Fallback"));
        assert_eq!(t.pic_url(), Some("http://img/1.jpg"));
        assert_eq!(t.album_id().as_deref(), Some("99"));

        let t = track(json!({"id": 7, "album": "Just A Name"}));
        assert_eq!(t.album_name(), Some("Just A Name"));
        assert_eq!(t.pic_url(), None);
    }

    #[test]
    fn test_extra_fields_round_trip() {
        let t = track(json!({"id": 1, "name": "Song", "br": 320000, "dt": 215000}));
        assert_eq!(t.bitrate(), 320000);
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["dt"], json!(215000));
        assert_eq!(back["br"], json!(320000));
    }

    #[test]
    fn test_cached_track_serialization() {
        let cached = CachedTrack {
            track: track(json!({"id": 1, "name": "Song"})),
            size: 42,
            path: PathBuf::from("/tmp/1-0-Song.mp3"),
            cache: true,
            inserted_at: Utc::now(),
        };
        let value = serde_json::to_value(&cached).unwrap();
        assert_eq!(value["cache"], json!(true));
        assert_eq!(value["name"], json!("Song"));
        assert!(value.get("insertedAt").is_some());
    }
}
