//! Audio file extension resolution

/// Guess used when neither the URL nor the content type says otherwise
pub const DEFAULT_EXTENSION: &str = "mp3";

const KNOWN_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "wav", "m4a", "aac", "mp4", "opus"];

/// Extension named by the URL path, or the default guess
pub fn extension_from_url(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or("").to_string());

    let last = path.rsplit('/').next().unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            if KNOWN_EXTENSIONS.contains(&ext.as_str()) {
                ext
            } else {
                DEFAULT_EXTENSION.to_string()
            }
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// Map an audio content type onto a more specific extension than mp3
pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "audio/ogg" | "application/ogg" | "audio/vorbis" => Some("ogg"),
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" | "audio/x-aac" | "audio/aacp" => Some("aac"),
        "video/mp4" => Some("mp4"),
        _ => None,
    }
}

/// Resolve the extension for a downloaded track
///
/// The URL decides, except when it only yields the default `mp3` guess and
/// the content type names something more specific.
pub fn resolve_extension(url: &str, content_type: &str) -> String {
    let from_url = extension_from_url(url);
    if from_url == DEFAULT_EXTENSION {
        if let Some(ext) = extension_from_content_type(content_type) {
            return ext.to_string();
        }
    }
    from_url
}
