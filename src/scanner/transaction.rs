//! One scan of one root, buffered until commit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{Song, Subdir};

use super::CollectionEvent;
use super::watcher::WatchRegistry;
use super::worker::ScanContext;

/// Changes found while scanning one root.
///
/// Nothing is visible to the consumer until [`ScanTransaction::commit`].
/// Dropping without committing discards the changes; the progress task
/// is finished either way.
pub(crate) struct ScanTransaction<'a> {
    ctx: &'a ScanContext,
    root_id: i64,
    task_id: u64,
    progress: u64,
    progress_max: u64,
    incremental: bool,
    ignore_mtime: bool,
    mark_unavailable: bool,
    expire_days: i64,

    pub new_songs: Vec<Song>,
    pub touched_songs: Vec<Song>,
    pub deleted_songs: Vec<Song>,
    pub readded_songs: Vec<Song>,
    pub new_subdirs: Vec<Subdir>,
    pub touched_subdirs: Vec<Subdir>,
    pub deleted_subdirs: Vec<Subdir>,
    /// Old paths of songs that were found again under a new path
    pub files_changed_path: HashSet<PathBuf>,

    cached_songs: Option<Vec<Song>>,
    cached_missing_fingerprint: Option<Vec<Song>>,
    known_subdirs: Option<Vec<Subdir>>,
}

impl<'a> ScanTransaction<'a> {
    pub fn new(ctx: &'a ScanContext, root_id: i64, incremental: bool, ignore_mtime: bool) -> Self {
        let task_id = ctx.tasks.start_task("Updating collection");
        ctx.emit(CollectionEvent::ScanStarted(task_id));
        tracing::debug!(target: "scanner::walker", root_id, task_id, incremental, ignore_mtime, "Scan started");

        Self {
            ctx,
            root_id,
            task_id,
            progress: 0,
            progress_max: 0,
            incremental,
            ignore_mtime,
            mark_unavailable: ctx.settings.mark_unavailable,
            expire_days: ctx.settings.expire_unavailable_days,
            new_songs: Vec::new(),
            touched_songs: Vec::new(),
            deleted_songs: Vec::new(),
            readded_songs: Vec::new(),
            new_subdirs: Vec::new(),
            touched_subdirs: Vec::new(),
            deleted_subdirs: Vec::new(),
            files_changed_path: HashSet::new(),
            cached_songs: None,
            cached_missing_fingerprint: None,
            known_subdirs: None,
        }
    }

    pub fn ctx(&self) -> &'a ScanContext {
        self.ctx
    }

    pub fn root_id(&self) -> i64 {
        self.root_id
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub fn ignores_mtime(&self) -> bool {
        self.ignore_mtime
    }

    pub fn add_progress(&mut self, n: u64) {
        self.progress += n;
        self.ctx
            .tasks
            .set_task_progress(self.task_id, self.progress, self.progress_max);
    }

    pub fn add_progress_max(&mut self, n: u64) {
        self.progress_max += n;
        self.ctx
            .tasks
            .set_task_progress(self.task_id, self.progress, self.progress_max);
    }

    /// Stored songs living directly in `path`. The root's songs are loaded
    /// once per transaction.
    pub fn find_songs_in_subdir(&mut self, path: &Path) -> Result<Vec<Song>> {
        if self.cached_songs.is_none() {
            self.cached_songs = Some(self.ctx.store.songs_in_root(self.root_id)?);
        }
        Ok(self
            .cached_songs
            .iter()
            .flatten()
            .filter(|song| song.directory() == path)
            .cloned()
            .collect())
    }

    pub fn has_songs_missing_fingerprint(&mut self, path: &Path) -> Result<bool> {
        if self.cached_missing_fingerprint.is_none() {
            self.cached_missing_fingerprint =
                Some(self.ctx.store.songs_missing_fingerprint(self.root_id)?);
        }
        Ok(self
            .cached_missing_fingerprint
            .iter()
            .flatten()
            .any(|song| song.directory() == path))
    }

    /// Use `subdirs` instead of asking the store.
    pub fn set_known_subdirs(&mut self, subdirs: Vec<Subdir>) {
        self.known_subdirs = Some(subdirs);
    }

    pub fn all_subdirs(&mut self) -> Result<Vec<Subdir>> {
        Ok(self.known()?.to_vec())
    }

    pub fn has_seen_subdir(&mut self, path: &Path) -> Result<bool> {
        Ok(self
            .known()?
            .iter()
            .any(|subdir| subdir.path == path && !subdir.is_tombstone()))
    }

    /// Known subdirectories whose parent is `path`.
    pub fn immediate_subdirs(&mut self, path: &Path) -> Result<Vec<Subdir>> {
        Ok(self
            .known()?
            .iter()
            .filter(|subdir| !subdir.is_tombstone() && subdir.path.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn known(&mut self) -> Result<&[Subdir]> {
        if self.known_subdirs.is_none() {
            self.known_subdirs = Some(self.ctx.store.subdirs_in_root(self.root_id)?);
        }
        Ok(self.known_subdirs.as_deref().unwrap_or_default())
    }

    /// Publish the buffered changes and update the watch set.
    pub fn commit(mut self, watches: &mut WatchRegistry) {
        let ctx = self.ctx;
        if ctx.stop_requested() {
            tracing::info!(target: "scanner::walker", root_id = self.root_id, "Scan stopped, discarding changes");
            return;
        }
        let deleted = std::mem::take(&mut self.deleted_songs);
        let new = std::mem::take(&mut self.new_songs);
        let touched = std::mem::take(&mut self.touched_songs);
        let readded = std::mem::take(&mut self.readded_songs);
        let new_subdirs = std::mem::take(&mut self.new_subdirs);
        let touched_subdirs = std::mem::take(&mut self.touched_subdirs);
        let deleted_subdirs = std::mem::take(&mut self.deleted_subdirs);

        tracing::debug!(
            target: "scanner::walker",
            root_id = self.root_id,
            new = new.len(),
            touched = touched.len(),
            deleted = deleted.len(),
            readded = readded.len(),
            new_subdirs = new_subdirs.len(),
            "Committing scan"
        );

        if !deleted.is_empty() {
            if self.mark_unavailable {
                ctx.emit(CollectionEvent::SongsUnavailable(deleted));
            } else {
                ctx.emit(CollectionEvent::SongsDeleted(deleted));
            }
        }
        if !new.is_empty() {
            ctx.emit(CollectionEvent::NewOrUpdatedSongs(new));
        }
        if !touched.is_empty() {
            ctx.emit(CollectionEvent::SongsMTimeUpdated(touched));
        }
        if !readded.is_empty() {
            ctx.emit(CollectionEvent::SongsReadded(readded));
        }
        if !new_subdirs.is_empty() {
            ctx.emit(CollectionEvent::SubdirsDiscovered(new_subdirs.clone()));
        }
        if !touched_subdirs.is_empty() {
            ctx.emit(CollectionEvent::SubdirsMTimeUpdated(touched_subdirs));
        }

        for subdir in &deleted_subdirs {
            watches.remove(&subdir.path);
        }

        // Songs rescanned by request may belong to an unregistered root.
        if ctx.settings.monitor && ctx.roots.contains_key(&self.root_id) {
            for subdir in &new_subdirs {
                watches.add(&subdir.path, self.root_id);
            }
        }

        ctx.emit(CollectionEvent::UpdateLastSeen {
            root_id: self.root_id,
            expire_days: self.expire_days,
        });
    }
}

impl Drop for ScanTransaction<'_> {
    fn drop(&mut self) {
        self.ctx.tasks.set_task_finished(self.task_id);
    }
}
