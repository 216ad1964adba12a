//! File system watching for collection subdirectories.
//!
//! Every known subdirectory gets its own non-recursive watch. Notifications
//! are reduced to "this directory changed" and posted to the scanner's
//! command queue, where the worker debounces them into rescans.
//!
//! # Design
//!
//! - **Injected**: the scanner never owns a concrete watcher type, only a
//!   `Box<dyn FsWatcher>` built from a [`ChangeNotifier`]
//! - **Debounced events**: `notify-debouncer-full` coalesces bursts before
//!   they reach the queue
//! - **Registry**: [`WatchRegistry`] remembers which root each watched path
//!   belongs to so notifications can be routed

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::Sender;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};

use super::Command;

/// OS-level watch backend.
pub trait FsWatcher: Send {
    fn add_path(&mut self, path: &Path) -> Result<(), WatchError>;
    fn remove_path(&mut self, path: &Path);
    fn clear(&mut self);
}

/// Posts `PathChanged` notifications to the scanner queue.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: Sender<Command>,
}

impl ChangeNotifier {
    pub(crate) fn new(tx: Sender<Command>) -> Self {
        Self { tx }
    }

    pub fn path_changed(&self, dir: PathBuf) {
        tracing::trace!(target: "scanner::watcher", path = %dir.display(), "Path changed");
        // A closed queue means the scanner has exited.
        let _ = self.tx.send(Command::PathChanged(dir));
    }
}

/// [`FsWatcher`] backed by `notify`.
pub struct NotifyWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    watched: BTreeSet<PathBuf>,
}

impl NotifyWatcher {
    pub fn new(notifier: ChangeNotifier) -> Result<Self, WatchError> {
        let debouncer = new_debouncer(
            Duration::from_millis(500),
            None,
            move |result: DebounceEventResult| handle_debounced_events(result, &notifier),
        )
        .map_err(|e| WatchError::Init(e.to_string()))?;

        Ok(Self {
            debouncer,
            watched: BTreeSet::new(),
        })
    }
}

impl FsWatcher for NotifyWatcher {
    fn add_path(&mut self, path: &Path) -> Result<(), WatchError> {
        tracing::debug!(target: "scanner::watcher", path = %path.display(), "Watching directory");
        self.debouncer
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Watch(format!("{}: {}", path.display(), e)))?;
        self.watched.insert(path.to_path_buf());
        Ok(())
    }

    fn remove_path(&mut self, path: &Path) {
        if self.watched.remove(path) {
            tracing::debug!(target: "scanner::watcher", path = %path.display(), "Unwatching directory");
            // Fails when the directory is already gone, which also ends the watch.
            let _ = self.debouncer.unwatch(path);
        }
    }

    fn clear(&mut self) {
        for path in std::mem::take(&mut self.watched) {
            let _ = self.debouncer.unwatch(&path);
        }
    }
}

/// Reduce a batch of events to the set of directories that changed.
fn handle_debounced_events(result: DebounceEventResult, notifier: &ChangeNotifier) {
    match result {
        Ok(events) => {
            let dirs: BTreeSet<PathBuf> = events
                .iter()
                .filter(|event| !event.kind.is_access())
                .flat_map(|event| event.paths.iter())
                .filter_map(|path| path.parent().map(Path::to_path_buf))
                .collect();
            for dir in dirs {
                notifier.path_changed(dir);
            }
        }
        Err(errors) => {
            for error in errors {
                tracing::warn!(target: "scanner::watcher", error = %error, "Watch error");
            }
        }
    }
}

/// Watched subdirectory paths and the root each belongs to.
///
/// A path is present iff its OS watch is active.
pub struct WatchRegistry {
    watcher: Box<dyn FsWatcher>,
    watched: BTreeMap<PathBuf, i64>,
}

impl WatchRegistry {
    pub fn new(watcher: Box<dyn FsWatcher>) -> Self {
        Self {
            watcher,
            watched: BTreeMap::new(),
        }
    }

    /// Watch `path` on behalf of `root_id`. No-op if already watched or
    /// missing on disk.
    pub fn add(&mut self, path: &Path, root_id: i64) {
        if self.watched.contains_key(path) || !path.is_dir() {
            return;
        }
        match self.watcher.add_path(path) {
            Ok(()) => {
                self.watched.insert(path.to_path_buf(), root_id);
            }
            Err(e) => {
                tracing::warn!(target: "scanner::watcher", root_id, "{}", e);
            }
        }
    }

    pub fn remove(&mut self, path: &Path) {
        if self.watched.remove(path).is_some() {
            self.watcher.remove_path(path);
        }
    }

    /// Drop every watch owned by `root_id`.
    pub fn remove_root(&mut self, root_id: i64) {
        let paths: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|(_, r)| **r == root_id)
            .map(|(p, _)| p.clone())
            .collect();
        for path in paths {
            self.remove(&path);
        }
    }

    pub fn clear(&mut self) {
        self.watcher.clear();
        self.watched.clear();
    }

    pub fn resolve(&self, path: &Path) -> Option<i64> {
        self.watched.get(path).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }
}

/// Errors that can occur during file watching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {0}")]
    Init(String),
    #[error("Failed to watch path: {0}")]
    Watch(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingWatcher;
    use crossbeam_channel::unbounded;
    use tempfile::tempdir;

    #[test]
    fn test_registry_add_is_idempotent() {
        let dir = tempdir().unwrap();
        let watcher = RecordingWatcher::default();
        let mut registry = WatchRegistry::new(Box::new(watcher.clone()));

        registry.add(dir.path(), 1);
        registry.add(dir.path(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(watcher.paths(), vec![dir.path().to_path_buf()]);
        assert_eq!(registry.resolve(dir.path()), Some(1));
    }

    #[test]
    fn test_registry_skips_missing_paths() {
        let dir = tempdir().unwrap();
        let watcher = RecordingWatcher::default();
        let mut registry = WatchRegistry::new(Box::new(watcher.clone()));

        registry.add(&dir.path().join("gone"), 1);
        assert!(registry.is_empty());
        assert!(watcher.paths().is_empty());
    }

    #[test]
    fn test_registry_remove_root() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let watcher = RecordingWatcher::default();
        let mut registry = WatchRegistry::new(Box::new(watcher.clone()));
        registry.add(&a, 1);
        registry.add(&b, 2);

        registry.remove_root(1);
        assert_eq!(registry.resolve(&a), None);
        assert_eq!(registry.resolve(&b), Some(2));
        assert_eq!(watcher.paths(), vec![b.clone()]);

        registry.clear();
        assert!(registry.is_empty());
        assert!(watcher.paths().is_empty());
    }

    #[test]
    fn test_notifier_posts_path_changed() {
        let (tx, rx) = unbounded();
        ChangeNotifier::new(tx).path_changed(PathBuf::from("/m/a"));
        match rx.try_recv() {
            Ok(Command::PathChanged(path)) => assert_eq!(path, PathBuf::from("/m/a")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_notify_watcher_reports_parent_directory() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let mut watcher = NotifyWatcher::new(ChangeNotifier::new(tx)).unwrap();
        watcher.add_path(dir.path()).unwrap();

        std::fs::write(dir.path().join("new_song.mp3"), b"fake mp3 content").unwrap();

        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Command::PathChanged(path)) => {
                let watched = dir.path().canonicalize().unwrap();
                let changed = path.canonicalize().unwrap();
                assert!(watched.starts_with(&changed), "{changed:?}");
            }
            other => panic!("expected a change notification, got {other:?}"),
        }

        watcher.clear();
        assert!(watcher.watched.is_empty());
    }
}
