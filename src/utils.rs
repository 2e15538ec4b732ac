use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use url::Url;

use crate::errors::Result;

/// Fallback name when the source URL has no usable path component.
pub const DEFAULT_AUDIO_FILENAME: &str = "audio.mp3";

/// Sanitizes a filename by replacing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Derives the original filename from the last path segment of the source
/// URL, falling back to a generic audio name.
pub fn original_filename_from_url(url: &str) -> String {
    let basename = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(|s| s.to_string()))
        })
        .filter(|name| !name.is_empty());

    match basename {
        Some(name) => sanitize_filename(&name),
        None => DEFAULT_AUDIO_FILENAME.to_string(),
    }
}

fn control_char_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").unwrap())
}

/// Parses a JSON body, tolerating stray C0 control characters.
///
/// Clients occasionally embed raw control bytes in lyrics text. The first
/// parse is strict; on failure the body is re-parsed with control characters
/// removed (tab, newline and carriage return are kept).
pub fn safe_json_parse<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    match serde_json::from_slice(raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            log::warn!("JSON parse failed, retrying with control characters stripped: {e}");
            let text = String::from_utf8_lossy(raw);
            let cleaned = control_char_pattern().replace_all(&text, "");
            Ok(serde_json::from_str(&cleaned)?)
        }
    }
}

/// Generates a unique identifier for a processed artifact
pub fn generate_file_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        log::info!("Created directory: {:?}", path);
    }
    Ok(())
}
