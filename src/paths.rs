//! Path keys and separator-aware prefix logic.
//!
//! The catalog keys photos and folders by their path rendered as a string,
//! so every comparison here works on those strings.

use std::path::{Path, MAIN_SEPARATOR};

/// Image extensions the engine ingests (lower-case)
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Catalog key for a filesystem path
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// True when the file extension is one of [`IMAGE_EXTENSIONS`].
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_separator(c: char) -> bool {
    c == '/' || c == MAIN_SEPARATOR
}

/// `path` equals `root` or lies beneath it. `/a/bc` is not under `/a/b`.
pub fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches(is_separator);
    match path.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest.starts_with(is_separator),
        None => false,
    }
}

/// Case-insensitive variant of [`is_under`].
pub fn is_under_ignore_case(path: &str, root: &str) -> bool {
    is_under(&path.to_lowercase(), &root.to_lowercase())
}

/// Replace the `old` prefix of `path` with `new`, matching case-insensitively.
/// Returns `None` when `path` is not under `old`.
pub fn replace_prefix(path: &str, old: &str, new: &str) -> Option<String> {
    if !is_under_ignore_case(path, old) {
        return None;
    }
    let old = old.trim_end_matches(is_separator);
    // Lower-casing can change byte length for some scripts; fall back to char counting
    let rest: String = path.chars().skip(old.chars().count()).collect();
    Some(format!("{}{}", new.trim_end_matches(is_separator), rest))
}
