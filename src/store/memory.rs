//! In-memory store, used by tests and dry runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::{Store, StoreWriter, expiry_cutoff};
use crate::error::Result;
use crate::model::{Song, Subdir};

#[derive(Debug, Default)]
struct Inner {
    songs: BTreeMap<i64, Song>,
    subdirs: BTreeMap<(i64, PathBuf), Subdir>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all songs ordered by id.
    pub fn songs(&self) -> Vec<Song> {
        self.inner.read().songs.values().cloned().collect()
    }

    pub fn song(&self, id: i64) -> Option<Song> {
        self.inner.read().songs.get(&id).cloned()
    }

    pub fn all_subdirs(&self) -> Vec<Subdir> {
        self.inner.read().subdirs.values().cloned().collect()
    }

    fn filter_songs(&self, pred: impl Fn(&Song) -> bool) -> Vec<Song> {
        self.inner
            .read()
            .songs
            .values()
            .filter(|s| pred(s))
            .cloned()
            .collect()
    }
}

impl Store for MemoryStore {
    fn subdirs_in_root(&self, root_id: i64) -> Result<Vec<Subdir>> {
        Ok(self
            .inner
            .read()
            .subdirs
            .range((root_id, PathBuf::new())..)
            .take_while(|((r, _), _)| *r == root_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn songs_in_root(&self, root_id: i64) -> Result<Vec<Song>> {
        Ok(self.filter_songs(|s| s.root_id == root_id))
    }

    fn songs_missing_fingerprint(&self, root_id: i64) -> Result<Vec<Song>> {
        Ok(self.filter_songs(|s| s.root_id == root_id && s.fingerprint.is_empty()))
    }

    fn songs_by_path(&self, path: &Path) -> Result<Vec<Song>> {
        Ok(self.filter_songs(|s| s.path == path))
    }

    fn songs_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Song>> {
        Ok(self.filter_songs(|s| s.fingerprint == fingerprint))
    }
}

impl StoreWriter for MemoryStore {
    fn add_or_update_songs(&self, songs: &[Song]) -> Result<()> {
        let mut inner = self.inner.write();
        for song in songs {
            let mut song = song.clone();
            let id = match song.id {
                Some(id) => id,
                None => {
                    inner.next_id += 1;
                    inner.next_id
                }
            };
            inner.next_id = inner.next_id.max(id);
            song.id = Some(id);
            song.unavailable = false;
            inner.songs.insert(id, song);
        }
        Ok(())
    }

    fn update_mtimes(&self, songs: &[Song]) -> Result<()> {
        let mut inner = self.inner.write();
        for song in songs {
            if let Some(stored) = song.id.and_then(|id| inner.songs.get_mut(&id)) {
                stored.mtime = song.mtime;
            }
        }
        Ok(())
    }

    fn delete_songs(&self, songs: &[Song]) -> Result<()> {
        let mut inner = self.inner.write();
        for id in songs.iter().filter_map(|s| s.id) {
            inner.songs.remove(&id);
        }
        Ok(())
    }

    fn set_unavailable(&self, songs: &[Song], unavailable: bool) -> Result<()> {
        let mut inner = self.inner.write();
        for song in songs {
            if let Some(stored) = song.id.and_then(|id| inner.songs.get_mut(&id)) {
                stored.unavailable = unavailable;
            }
        }
        Ok(())
    }

    fn upsert_subdirs(&self, subdirs: &[Subdir]) -> Result<()> {
        let mut inner = self.inner.write();
        for subdir in subdirs {
            let Some(root_id) = subdir.root_id else {
                continue;
            };
            let key = (root_id, subdir.path.clone());
            if subdir.is_tombstone() {
                inner.subdirs.remove(&key);
            } else {
                inner.subdirs.insert(key, subdir.clone());
            }
        }
        Ok(())
    }

    fn update_last_seen(&self, root_id: i64, expire_days: i64, now: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let cutoff = expiry_cutoff(now, expire_days);
        inner.songs.retain(|_, song| {
            if song.root_id != root_id {
                return true;
            }
            if !song.unavailable {
                song.last_seen = now;
                return true;
            }
            expire_days <= 0 || song.last_seen >= cutoff
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::CollectionEvent;
    use crate::store::SECONDS_PER_DAY;

    fn song(root_id: i64, path: &str) -> Song {
        Song {
            root_id,
            path: PathBuf::from(path),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_assigns_ids() {
        let store = MemoryStore::new();
        store
            .add_or_update_songs(&[song(1, "/m/a.mp3"), song(1, "/m/b.mp3")])
            .unwrap();
        let ids: Vec<_> = store.songs().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);

        let mut updated = store.song(1).unwrap();
        updated.title = "Renamed".into();
        store.add_or_update_songs(&[updated]).unwrap();
        assert_eq!(store.songs().len(), 2);
        assert_eq!(store.song(1).unwrap().title, "Renamed");
    }

    #[test]
    fn test_queries() {
        let store = MemoryStore::new();
        let mut fp = song(1, "/m/a.mp3");
        fp.fingerprint = "abc".into();
        store
            .add_or_update_songs(&[fp, song(1, "/m/b.mp3"), song(2, "/n/c.mp3")])
            .unwrap();

        assert_eq!(store.songs_in_root(1).unwrap().len(), 2);
        assert_eq!(store.songs_missing_fingerprint(1).unwrap().len(), 1);
        assert_eq!(store.songs_by_fingerprint("abc").unwrap()[0].id, Some(1));
        assert_eq!(
            store.songs_by_path(Path::new("/n/c.mp3")).unwrap()[0].root_id,
            2
        );
    }

    #[test]
    fn test_subdir_upsert_and_tombstone() {
        let store = MemoryStore::new();
        store
            .apply(&CollectionEvent::SubdirsDiscovered(vec![
                Subdir::new(1, "/m/a", 10),
                Subdir::new(1, "/m/b", 10),
                Subdir::new(2, "/n", 10),
            ]))
            .unwrap();
        assert_eq!(store.subdirs_in_root(1).unwrap().len(), 2);

        store
            .apply(&CollectionEvent::SubdirsMTimeUpdated(vec![
                Subdir::new(1, "/m/a", 0),
                Subdir::new(1, "/m/b", 20),
            ]))
            .unwrap();
        assert_eq!(store.subdirs_in_root(1).unwrap(), vec![Subdir::new(1, "/m/b", 20)]);
        assert_eq!(store.subdirs_in_root(2).unwrap().len(), 1);
    }

    #[test]
    fn test_unavailable_expiry() {
        let store = MemoryStore::new();
        store
            .add_or_update_songs(&[song(1, "/m/a.mp3"), song(1, "/m/b.mp3")])
            .unwrap();
        let now = 1_000_000;
        store.update_last_seen(1, 1, now).unwrap();

        let gone = store.song(1).unwrap();
        store.set_unavailable(&[gone], true).unwrap();

        // Still within the window.
        store.update_last_seen(1, 1, now + 60).unwrap();
        assert!(store.song(1).is_some());
        assert_eq!(store.song(2).unwrap().last_seen, now + 60);

        store
            .update_last_seen(1, 1, now + 2 * SECONDS_PER_DAY)
            .unwrap();
        assert!(store.song(1).is_none());
        assert!(store.song(2).is_some());
    }

    #[test]
    fn test_zero_expiry_keeps_unavailable() {
        let store = MemoryStore::new();
        store.add_or_update_songs(&[song(1, "/m/a.mp3")]).unwrap();
        let s = store.song(1).unwrap();
        store.set_unavailable(&[s], true).unwrap();
        store.update_last_seen(1, 0, i64::MAX / 2).unwrap();
        assert!(store.song(1).unwrap().unavailable);
    }

    #[test]
    fn test_huge_expiry_keeps_unavailable() {
        let store = MemoryStore::new();
        store.add_or_update_songs(&[song(1, "/m/a.mp3")]).unwrap();
        let s = store.song(1).unwrap();
        store.set_unavailable(&[s], true).unwrap();
        store.update_last_seen(1, i64::MAX, 1_000_000).unwrap();
        assert!(store.song(1).unwrap().unavailable);
        assert!(expiry_cutoff(1_000_000, i64::MAX) < 0);
    }

    #[test]
    fn test_readd_clears_flag() {
        let store = MemoryStore::new();
        store.add_or_update_songs(&[song(1, "/m/a.mp3")]).unwrap();
        let s = store.song(1).unwrap();
        store
            .apply(&CollectionEvent::SongsUnavailable(vec![s.clone()]))
            .unwrap();
        assert!(store.song(1).unwrap().unavailable);
        store.apply(&CollectionEvent::SongsReadded(vec![s])).unwrap();
        assert!(!store.song(1).unwrap().unavailable);
    }
}
