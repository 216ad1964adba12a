//! Persistent collection store interfaces.
//!
//! The scanner only ever reads through [`Store`]. Writes happen on the
//! consumer side: whoever receives [`CollectionEvent`]s hands them to a
//! [`StoreWriter`], which maps each event onto the matching write.

mod memory;

pub use memory::MemoryStore;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Song, Subdir};
use crate::scanner::CollectionEvent;

/// Seconds in a day, for last-seen expiry.
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Oldest `last_seen` an unavailable song may have at `now` and survive.
/// Saturates for absurd retention periods.
pub fn expiry_cutoff(now: i64, expire_days: i64) -> i64 {
    now.saturating_sub(expire_days.saturating_mul(SECONDS_PER_DAY))
}

/// Queries the scanner runs against the store.
pub trait Store: Send + Sync {
    /// All known subdirectories of a root.
    fn subdirs_in_root(&self, root_id: i64) -> Result<Vec<Subdir>>;

    /// All songs of a root, available or not.
    fn songs_in_root(&self, root_id: i64) -> Result<Vec<Song>>;

    /// Songs of a root whose fingerprint was never computed.
    fn songs_missing_fingerprint(&self, root_id: i64) -> Result<Vec<Song>>;

    /// Every song whose media file is `path`, including CUE sections.
    fn songs_by_path(&self, path: &Path) -> Result<Vec<Song>>;

    fn songs_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Song>>;

    /// Release backing resources. Called once when the scanner exits.
    fn close(&self) {}
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn subdirs_in_root(&self, root_id: i64) -> Result<Vec<Subdir>> {
        (**self).subdirs_in_root(root_id)
    }

    fn songs_in_root(&self, root_id: i64) -> Result<Vec<Song>> {
        (**self).songs_in_root(root_id)
    }

    fn songs_missing_fingerprint(&self, root_id: i64) -> Result<Vec<Song>> {
        (**self).songs_missing_fingerprint(root_id)
    }

    fn songs_by_path(&self, path: &Path) -> Result<Vec<Song>> {
        (**self).songs_by_path(path)
    }

    fn songs_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Song>> {
        (**self).songs_by_fingerprint(fingerprint)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Writes a consumer performs in reaction to scanner events.
pub trait StoreWriter {
    /// Insert songs without an id (assigning one), replace the rest.
    /// Clears the unavailable flag.
    fn add_or_update_songs(&self, songs: &[Song]) -> Result<()>;

    fn update_mtimes(&self, songs: &[Song]) -> Result<()>;

    fn delete_songs(&self, songs: &[Song]) -> Result<()>;

    fn set_unavailable(&self, songs: &[Song], unavailable: bool) -> Result<()>;

    /// Upsert subdirectories; a zero mtime removes the row.
    fn upsert_subdirs(&self, subdirs: &[Subdir]) -> Result<()>;

    /// Stamp available songs of `root_id` as seen at `now` and hard-delete
    /// unavailable ones last seen more than `expire_days` ago.
    /// `expire_days <= 0` disables expiry.
    fn update_last_seen(&self, root_id: i64, expire_days: i64, now: i64) -> Result<()>;

    /// Route one scanner event to the matching write.
    fn apply(&self, event: &CollectionEvent) -> Result<()> {
        match event {
            CollectionEvent::NewOrUpdatedSongs(songs) => self.add_or_update_songs(songs),
            CollectionEvent::SongsMTimeUpdated(songs) => self.update_mtimes(songs),
            CollectionEvent::SongsDeleted(songs) => self.delete_songs(songs),
            CollectionEvent::SongsUnavailable(songs) => self.set_unavailable(songs, true),
            CollectionEvent::SongsReadded(songs) => self.set_unavailable(songs, false),
            CollectionEvent::SubdirsDiscovered(subdirs)
            | CollectionEvent::SubdirsMTimeUpdated(subdirs) => self.upsert_subdirs(subdirs),
            CollectionEvent::UpdateLastSeen {
                root_id,
                expire_days,
            } => self.update_last_seen(*root_id, *expire_days, chrono::Utc::now().timestamp()),
            CollectionEvent::ScanStarted(_)
            | CollectionEvent::CompilationsNeedUpdating
            | CollectionEvent::ExitFinished => Ok(()),
        }
    }
}

impl<T: StoreWriter + ?Sized> StoreWriter for Arc<T> {
    fn add_or_update_songs(&self, songs: &[Song]) -> Result<()> {
        (**self).add_or_update_songs(songs)
    }

    fn update_mtimes(&self, songs: &[Song]) -> Result<()> {
        (**self).update_mtimes(songs)
    }

    fn delete_songs(&self, songs: &[Song]) -> Result<()> {
        (**self).delete_songs(songs)
    }

    fn set_unavailable(&self, songs: &[Song], unavailable: bool) -> Result<()> {
        (**self).set_unavailable(songs, unavailable)
    }

    fn upsert_subdirs(&self, subdirs: &[Subdir]) -> Result<()> {
        (**self).upsert_subdirs(subdirs)
    }

    fn update_last_seen(&self, root_id: i64, expire_days: i64, now: i64) -> Result<()> {
        (**self).update_last_seen(root_id, expire_days, now)
    }
}
