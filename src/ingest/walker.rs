use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;
use crate::paths::is_image_path;

/// Filesystem facts about one image file
#[derive(Debug, Clone)]
pub struct FileStat {
    pub path: PathBuf,
    pub name: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Discover every image file under `root`.
///
/// Recursively walks the tree and keeps `.png`, `.jpg`, `.jpeg` and `.webp`
/// files (case-insensitive). Unreadable entries are skipped with a debug log.
pub fn discover_images(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() && is_image_path(entry.path()) {
            files.push(entry.into_path());
        }
    }

    log::debug!("Discovered {} images in {}", files.len(), root.display());
    files
}

/// Every directory under `root`, excluding `root` itself, parents before children.
pub fn discover_directories(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect()
}

/// Stat one file. Fails when it vanished or cannot be read.
pub fn file_stat(path: &Path) -> Result<FileStat> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    // Not every filesystem records a birth time
    let created = metadata.created().unwrap_or(modified);

    Ok(FileStat {
        path: path.to_path_buf(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        file_size: metadata.len(),
        created_at: DateTime::<Utc>::from(created),
        modified_at: DateTime::<Utc>::from(modified),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_discover_images() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("2024/05")).unwrap();
        fs::write(root.join("a.png"), b"x").unwrap();
        fs::write(root.join("b.JPG"), b"x").unwrap();
        fs::write(root.join("2024/05/c.webp"), b"x").unwrap();
        fs::write(root.join("2024/05/d.jpeg"), b"x").unwrap();
        fs::write(root.join("notes.txt"), b"x").unwrap();
        fs::write(root.join("2024/params.json"), b"{}").unwrap();

        let files = discover_images(root);
        assert_eq!(files.len(), 4);
        assert!(files.iter().any(|f| f.ends_with("b.JPG")));
        assert!(!files.iter().any(|f| f.ends_with("notes.txt")));
    }

    #[test]
    fn test_discover_missing_root_is_empty() {
        assert!(discover_images(Path::new("/nonexistent/gencat/root")).is_empty());
    }

    #[test]
    fn test_discover_directories() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        fs::create_dir_all(temp_dir.path().join("c")).unwrap();

        let dirs = discover_directories(temp_dir.path());
        assert_eq!(dirs.len(), 3);
        let a = dirs.iter().position(|d| d.ends_with("a")).unwrap();
        let b = dirs.iter().position(|d| d.ends_with("a/b")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_file_stat() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("img.png");
        fs::write(&path, b"12345").unwrap();

        let stat = file_stat(&path).unwrap();
        assert_eq!(stat.name, "img.png");
        assert_eq!(stat.file_size, 5);
        assert!(file_stat(&temp_dir.path().join("gone.png")).is_err());
    }
}
