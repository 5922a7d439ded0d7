//! Filename sanitization utilities

/// Characters that are illegal in a path component on at least one major OS
const ILLEGAL: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Sanitize a filename for safe filesystem usage
///
/// Strips filesystem-illegal characters and control characters, then trims
/// surrounding whitespace and trailing dots (Windows refuses those). A name
/// made only of dots and spaces comes back empty.
///
/// # Examples
///
/// ```
/// use tuneworker::utils::sanitize_filename;
///
/// assert_eq!(sanitize_filename("AC/DC"), "ACDC");
/// assert_eq!(sanitize_filename("What?"), "What");
/// ```
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !ILLEGAL.contains(c) && !c.is_control())
        .collect::<String>()
        .trim_start()
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

/// Sanitize, substituting `fallback` when nothing usable is left
pub fn sanitize_or(name: &str, fallback: &str) -> String {
    let cleaned = sanitize_filename(name);
    if cleaned.is_empty() {
        sanitize_filename(fallback)
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_slashes() {
        assert_eq!(sanitize_filename("BOTHERED / UNBOTHERED"), "BOTHERED  UNBOTHERED");
        assert_eq!(sanitize_filename("R/Edgelord"), "REdgelord");
    }

    #[test]
    fn test_sanitize_colon() {
        assert_eq!(
            sanitize_filename("Transistor: Original Soundtrack"),
            "Transistor Original Soundtrack"
        );
    }

    #[test]
    fn test_sanitize_quotes() {
        assert_eq!(
            sanitize_filename("\"Emerson\" Unreleased Demo"),
            "Emerson Unreleased Demo"
        );
    }

    #[test]
    fn test_sanitize_control_chars() {
        assert_eq!(sanitize_filename("a\0b\nc"), "abc");
    }

    #[test]
    fn test_no_changes_needed() {
        assert_eq!(sanitize_filename("Normal Album Name"), "Normal Album Name");
        assert_eq!(sanitize_filename("晴天"), "晴天");
    }

    #[test]
    fn test_trim_whitespace_and_dots() {
        assert_eq!(sanitize_filename("  Album Name  "), "Album Name");
        assert_eq!(sanitize_filename("Vol. 2..."), "Vol. 2");
    }

    #[test]
    fn test_fallback() {
        assert_eq!(sanitize_or("???", "Unknown"), "Unknown");
        assert_eq!(sanitize_or("Known", "Unknown"), "Known");
    }

    #[test]
    fn test_dot_only_names_are_empty() {
        assert_eq!(sanitize_filename(". ."), "");
        assert_eq!(sanitize_filename("."), "");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename("a . ."), "a");
        assert_eq!(sanitize_filename(".hidden"), ".hidden");
        assert_eq!(sanitize_or(". .", "Unknown Artist"), "Unknown Artist");
    }
}
