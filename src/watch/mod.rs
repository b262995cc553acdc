//! Filesystem change notification for watched roots.
//!
//! Each [`RootWatcher`] forwards typed [`FsChange`] messages for its root to
//! a channel; the coordinator is the single consumer.

mod debounce;
mod watcher;

pub use debounce::Debouncer;
pub use watcher::RootWatcher;

use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use std::path::{Path, PathBuf};

use crate::paths::is_image_path;

/// A change under a watched root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    DirectoryCreated(PathBuf),
    DirectoryDeleted(PathBuf),
    DirectoryRenamed { from: PathBuf, to: PathBuf },
    FileCreated(PathBuf),
    FileDeleted(PathBuf),
    FileRenamed { from: PathBuf, to: PathBuf },
    FileChanged(PathBuf),
    /// The OS dropped or coalesced events; the root needs a full scan
    Overflow,
}

/// A change tagged with the root whose watcher saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchMessage {
    pub root: PathBuf,
    pub change: FsChange,
}

/// A path that no longer exists: image extension means a file, anything else
/// may have been a directory (`2024.05.01` has an extension too).
fn vanished(path: &Path) -> FsChange {
    if is_image_path(path) {
        FsChange::FileDeleted(path.to_path_buf())
    } else {
        FsChange::DirectoryDeleted(path.to_path_buf())
    }
}

/// A path that just appeared; asks the filesystem which kind it is.
fn appeared(path: &Path) -> Option<FsChange> {
    if path.is_dir() {
        Some(FsChange::DirectoryCreated(path.to_path_buf()))
    } else if is_image_path(path) {
        Some(FsChange::FileCreated(path.to_path_buf()))
    } else {
        None
    }
}

fn renamed(from: &Path, to: &Path) -> Option<FsChange> {
    if to.is_dir() {
        return Some(FsChange::DirectoryRenamed {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
    }
    match (is_image_path(from), is_image_path(to)) {
        (true, true) => Some(FsChange::FileRenamed {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }),
        (true, false) => Some(FsChange::FileDeleted(from.to_path_buf())),
        (false, true) => Some(FsChange::FileCreated(to.to_path_buf())),
        (false, false) => None,
    }
}

/// Translate one notify event into zero or more typed changes.
///
/// File changes are limited to image extensions; directory changes are not.
pub fn translate(event: &notify::Event) -> Vec<FsChange> {
    if event.need_rescan() {
        return vec![FsChange::Overflow];
    }

    let paths = &event.paths;
    match event.kind {
        EventKind::Create(CreateKind::Folder) => paths
            .iter()
            .map(|p| FsChange::DirectoryCreated(p.clone()))
            .collect(),
        EventKind::Create(CreateKind::File) => paths
            .iter()
            .filter(|p| is_image_path(p))
            .map(|p| FsChange::FileCreated(p.clone()))
            .collect(),
        EventKind::Create(_) => paths.iter().filter_map(|p| appeared(p)).collect(),

        EventKind::Remove(RemoveKind::Folder) => paths
            .iter()
            .map(|p| FsChange::DirectoryDeleted(p.clone()))
            .collect(),
        EventKind::Remove(RemoveKind::File) => paths
            .iter()
            .filter(|p| is_image_path(p))
            .map(|p| FsChange::FileDeleted(p.clone()))
            .collect(),
        EventKind::Remove(_) => paths.iter().map(|p| vanished(p)).collect(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [from, to] => renamed(from, to).into_iter().collect(),
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths.iter().map(|p| vanished(p)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths.iter().filter_map(|p| appeared(p)).collect(),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .filter_map(|p| if p.exists() { appeared(p) } else { Some(vanished(p)) })
            .collect(),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => paths
            .iter()
            .filter(|p| is_image_path(p) && p.is_file())
            .map(|p| FsChange::FileChanged(p.clone()))
            .collect(),

        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, Flag};
    use notify::Event;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |ev, p| ev.add_path(p.to_path_buf()))
    }

    #[test]
    fn test_create_events() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sub");
        std::fs::create_dir(&dir).unwrap();
        let png = temp.path().join("a.png");
        let txt = temp.path().join("a.txt");

        assert_eq!(
            translate(&event(EventKind::Create(CreateKind::File), &[&png, &txt])),
            vec![FsChange::FileCreated(png.clone())]
        );
        assert_eq!(
            translate(&event(EventKind::Create(CreateKind::Any), &[&dir])),
            vec![FsChange::DirectoryCreated(dir.clone())]
        );
    }

    #[test]
    fn test_remove_classified_by_extension() {
        let gone_file = PathBuf::from("/gone/x.JPG");
        let gone_dir = PathBuf::from("/gone/folder");
        let gone_other = PathBuf::from("/gone/readme.md");
        assert_eq!(
            translate(&event(EventKind::Remove(RemoveKind::Any), &[&gone_file, &gone_dir, &gone_other])),
            vec![
                FsChange::FileDeleted(gone_file.clone()),
                FsChange::DirectoryDeleted(gone_dir.clone()),
                FsChange::DirectoryDeleted(gone_other.clone()),
            ]
        );
    }

    #[test]
    fn test_dotted_directory_moved_out() {
        let dated = PathBuf::from("/gone/2024.05.01");
        let outputs = PathBuf::from("/gone/sd.outputs");
        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &[&dated])),
            vec![FsChange::DirectoryDeleted(dated.clone())]
        );
        assert_eq!(
            translate(&event(EventKind::Remove(RemoveKind::Any), &[&outputs])),
            vec![FsChange::DirectoryDeleted(outputs.clone())]
        );
    }

    #[test]
    fn test_rename_both() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("old.png");
        let to = temp.path().join("new.png");
        std::fs::write(&to, b"x").unwrap();

        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &[&from, &to])),
            vec![FsChange::FileRenamed {
                from: from.clone(),
                to: to.clone()
            }]
        );

        let tmp = temp.path().join("download.part");
        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &[&tmp, &to])),
            vec![FsChange::FileCreated(to.clone())]
        );

        let dir_to = temp.path().join("renamed");
        std::fs::create_dir(&dir_to).unwrap();
        let dir_from = temp.path().join("original");
        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &[&dir_from, &dir_to])),
            vec![FsChange::DirectoryRenamed {
                from: dir_from,
                to: dir_to
            }]
        );
    }

    #[test]
    fn test_half_renames() {
        let temp = TempDir::new().unwrap();
        let to = temp.path().join("in.webp");
        std::fs::write(&to, b"x").unwrap();
        let from = temp.path().join("out.webp");

        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &[&from])),
            vec![FsChange::FileDeleted(from)]
        );
        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &[&to])),
            vec![FsChange::FileCreated(to)]
        );
    }

    #[test]
    fn test_content_change_and_rescan() {
        let temp = TempDir::new().unwrap();
        let png = temp.path().join("a.png");
        std::fs::write(&png, b"x").unwrap();

        assert_eq!(
            translate(&event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &[&png])),
            vec![FsChange::FileChanged(png.clone())]
        );
        assert!(translate(&event(EventKind::Access(notify::event::AccessKind::Any), &[&png])).is_empty());

        let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(translate(&rescan), vec![FsChange::Overflow]);
    }
}
