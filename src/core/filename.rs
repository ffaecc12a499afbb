use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turns a track title or artist name into a portable path component.
pub fn sanitize_component(name: &str) -> String {
    let name: String = name.nfc().collect();
    let name = name.replace(FORBIDDEN, "_");
    let name = WS_RE.replace_all(name.trim(), " ");
    name.trim_end_matches([' ', '.', '-', ';']).to_string()
}

/// File name for a downloaded song: `Artist - Title.ext`.
pub fn track_file_name(artist: &str, title: &str, ext: &str) -> String {
    let artist = sanitize_component(artist);
    let title = sanitize_component(title);
    if artist.is_empty() {
        format!("{}.{}", title, ext)
    } else {
        format!("{} - {}.{}", artist, title, ext)
    }
}

/// Audio extension taken from the URL path, defaulting to mp3 when the URL
/// carries none (streaming endpoints usually don't).
pub fn extension_from_url(url: &str) -> &'static str {
    let path = match url::Url::parse(url) {
        Ok(u) => u.path().to_ascii_lowercase(),
        Err(_) => return "mp3",
    };
    for &ext in crate::core::validate::AUDIO_EXTENSIONS {
        if path.ends_with(&format!(".{}", ext)) {
            return ext;
        }
    }
    "mp3"
}
