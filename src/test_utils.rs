//! Test utilities and fixtures for collection-watcher tests.
//!
//! Fakes for every collaborator the scanner takes, plus [`Harness`], which
//! drives a [`Worker`] synchronously against a temporary music root and a
//! [`MemoryStore`] that applies every emitted event.
//!
//! # Example
//!
//! ```ignore
//! let mut h = Harness::new();
//! h.write("a/track1.mp3", "title=One");
//! let events = h.add_root();
//! assert_eq!(h.store.songs().len(), 1);
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::config::CollectionConfig;
use crate::cue::CueSheetParser;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprinter;
use crate::model::{Root, Song, Source, Subdir};
use crate::scanner::{
    CollectionEvent, Command, FsWatcher, ImageDecoder, ScannerDeps, WatchError, Worker,
};
use crate::store::{MemoryStore, Store, StoreWriter};
use crate::tags::{FileStat, TagReader};
use crate::tasks::TaskSink;

pub const ROOT_ID: i64 = 1;

/// Tag reader for text files of `key=value` lines.
///
/// Handles `.mp3`, `.flac` and `.ogg`. Content starting with `invalid` is
/// unreadable. `length` is in seconds; `cover=embedded` marks an embedded
/// picture.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeTagReader;

impl TagReader for FakeTagReader {
    fn is_media_file(&self, path: &Path) -> bool {
        matches!(
            crate::paths::extension_part(path).as_str(),
            "mp3" | "flac" | "ogg"
        )
    }

    fn read_file(&self, path: &Path) -> Option<Song> {
        let stat = FileStat::read(path)?;
        let content = std::fs::read_to_string(path).ok()?;
        if content.starts_with("invalid") {
            return None;
        }

        let mut song = stat.song(path);
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "title" => song.title = value.to_string(),
                "artist" => song.artist = value.to_string(),
                "album" => song.album = value.to_string(),
                "albumartist" => song.album_artist = value.to_string(),
                "genre" => song.genre = value.to_string(),
                "track" => song.track = value.parse().ok(),
                "year" => song.year = value.parse().ok(),
                "length" => {
                    song.length_nanosec = value
                        .parse::<i64>()
                        .ok()
                        .map(|secs| secs * 1_000_000_000)
                }
                "cover" => song.embedded_cover = value == "embedded",
                _ => {}
            }
        }
        Some(song)
    }
}

/// SHA-256 of the file contents; empty files (and missing ones) fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeFingerprinter;

impl Fingerprinter for FakeFingerprinter {
    fn fingerprint(&self, path: &Path) -> String {
        match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => Sha256::digest(&bytes)
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect(),
            _ => String::new(),
        }
    }
}

/// Images are text files containing `WxH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeImageDecoder;

impl ImageDecoder for FakeImageDecoder {
    fn dimensions(&self, path: &Path) -> Option<(u32, u32)> {
        let text = std::fs::read_to_string(path).ok()?;
        let (w, h) = text.trim().split_once('x')?;
        Some((w.parse().ok()?, h.parse().ok()?))
    }
}

/// Records every task call.
#[derive(Debug, Default)]
pub struct RecordingTaskSink {
    started: Mutex<Vec<u64>>,
    finished: Mutex<Vec<u64>>,
    progress: Mutex<Vec<(u64, u64, u64)>>,
}

impl RecordingTaskSink {
    pub fn started(&self) -> Vec<u64> {
        self.started.lock().clone()
    }

    pub fn finished(&self) -> Vec<u64> {
        self.finished.lock().clone()
    }

    /// Last `(progress, max)` reported for `id`.
    pub fn last_progress(&self, id: u64) -> Option<(u64, u64)> {
        self.progress
            .lock()
            .iter()
            .rev()
            .find(|(task, _, _)| *task == id)
            .map(|(_, progress, max)| (*progress, *max))
    }
}

impl TaskSink for RecordingTaskSink {
    fn start_task(&self, _description: &str) -> u64 {
        let mut started = self.started.lock();
        let id = started.len() as u64 + 1;
        started.push(id);
        id
    }

    fn set_task_progress(&self, id: u64, progress: u64, max: u64) {
        self.progress.lock().push((id, progress, max));
    }

    fn set_task_finished(&self, id: u64) {
        self.finished.lock().push(id);
    }
}

/// Watch backend that only remembers what it was asked to watch.
#[derive(Debug, Clone, Default)]
pub struct RecordingWatcher {
    watched: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl RecordingWatcher {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.watched.lock().iter().cloned().collect()
    }
}

impl FsWatcher for RecordingWatcher {
    fn add_path(&mut self, path: &Path) -> std::result::Result<(), WatchError> {
        self.watched.lock().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_path(&mut self, path: &Path) {
        self.watched.lock().remove(path);
    }

    fn clear(&mut self) {
        self.watched.lock().clear();
    }
}

/// Set the modification time of a file or directory to `secs` after the
/// epoch.
pub fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

/// Minimal 16-bit mono PCM WAV with `samples` frames of silence.
pub fn wav_bytes(sample_rate: u32, samples: u32) -> Vec<u8> {
    let data_len = samples * 2;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(out.len() + data_len as usize, 0);
    out
}

/// Store in front of a [`MemoryStore`] that can be told to fail every
/// query, or to raise the scanner's stop flag when songs are looked up.
pub struct GatedStore {
    inner: Arc<MemoryStore>,
    stop: Arc<AtomicBool>,
    fail: AtomicBool,
    stop_on_song_lookup: AtomicBool,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStore>, stop: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            stop,
            fail: AtomicBool::new(false),
            stop_on_song_lookup: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

impl Store for GatedStore {
    fn subdirs_in_root(&self, root_id: i64) -> Result<Vec<Subdir>> {
        self.check()?;
        self.inner.subdirs_in_root(root_id)
    }

    fn songs_in_root(&self, root_id: i64) -> Result<Vec<Song>> {
        if self.stop_on_song_lookup.swap(false, Ordering::Relaxed) {
            self.stop.store(true, Ordering::Relaxed);
        }
        self.check()?;
        self.inner.songs_in_root(root_id)
    }

    fn songs_missing_fingerprint(&self, root_id: i64) -> Result<Vec<Song>> {
        self.check()?;
        self.inner.songs_missing_fingerprint(root_id)
    }

    fn songs_by_path(&self, path: &Path) -> Result<Vec<Song>> {
        self.check()?;
        self.inner.songs_by_path(path)
    }

    fn songs_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Song>> {
        self.check()?;
        self.inner.songs_by_fingerprint(fingerprint)
    }
}

/// Deps wired to the fakes above.
pub fn fake_deps(
    store: Arc<dyn Store>,
    config: Arc<RwLock<CollectionConfig>>,
    tasks: Arc<RecordingTaskSink>,
) -> ScannerDeps {
    let tags: Arc<dyn TagReader> = Arc::new(FakeTagReader);
    ScannerDeps {
        store,
        cue: Arc::new(CueSheetParser::new(Arc::clone(&tags))),
        tags,
        fingerprinter: Some(Arc::new(FakeFingerprinter)),
        images: Arc::new(FakeImageDecoder),
        tasks,
        settings: Box::new(config),
        source: Source::Local,
    }
}

/// A worker driven command by command on the test thread.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub config: Arc<RwLock<CollectionConfig>>,
    pub watcher: RecordingWatcher,
    pub tasks: Arc<RecordingTaskSink>,
    pub worker: Worker,
    gate: Arc<GatedStore>,
    events: Receiver<CollectionEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut CollectionConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("m")).unwrap();

        let mut config = CollectionConfig::default();
        configure(&mut config);
        let config = Arc::new(RwLock::new(config));

        let store = Arc::new(MemoryStore::new());
        let tasks = Arc::new(RecordingTaskSink::default());
        let watcher = RecordingWatcher::default();
        let (events_tx, events) = unbounded();

        let stop = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(GatedStore::new(Arc::clone(&store), Arc::clone(&stop)));

        let worker = Worker::new(
            fake_deps(gate.clone(), Arc::clone(&config), Arc::clone(&tasks)),
            Box::new(watcher.clone()),
            events_tx,
            stop,
        );

        Self {
            dir,
            store,
            config,
            watcher,
            tasks,
            worker,
            gate,
            events,
        }
    }

    pub fn root_path(&self) -> PathBuf {
        self.dir.path().join("m")
    }

    pub fn root(&self) -> Root {
        Root::new(ROOT_ID, self.root_path())
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root_path().join(rel)
    }

    /// Write `contents` to `rel` under the root, creating directories.
    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Run one command and return the events it produced, after applying
    /// them to the store.
    pub fn run(&mut self, command: Command) -> Vec<CollectionEvent> {
        self.worker.handle(command);
        self.drain()
    }

    /// Register the root the way a consumer would on startup: with the
    /// subdirectories the store already knows.
    pub fn add_root(&mut self) -> Vec<CollectionEvent> {
        let subdirs = self.store.subdirs_in_root(ROOT_ID).unwrap();
        let root = self.root();
        self.run(Command::AddRoot { root, subdirs })
    }

    /// Notify a change in `rel` and let the debounce timer expire.
    pub fn change(&mut self, rel: &str) -> Vec<CollectionEvent> {
        let path = self.path(rel);
        let mut events = self.run(Command::PathChanged(path));
        self.worker.rescan_timer_fired();
        events.extend(self.drain());
        events
    }

    /// Make every store query of the worker fail until called with `false`.
    pub fn fail_store_queries(&self, fail: bool) {
        self.gate.fail.store(fail, Ordering::Relaxed);
    }

    /// Request a stop the next time the worker loads a root's songs.
    pub fn stop_on_song_lookup(&self) {
        self.gate.stop_on_song_lookup.store(true, Ordering::Relaxed);
    }

    pub fn drain(&mut self) -> Vec<CollectionEvent> {
        let events: Vec<CollectionEvent> = self.events.try_iter().collect();
        for event in &events {
            self.store.apply(event).unwrap();
        }
        events
    }

    pub fn song(&self, rel: &str) -> Song {
        let path = self.path(rel);
        let mut songs = self.store.songs_by_path(&path).unwrap();
        assert_eq!(songs.len(), 1, "expected one song at {}", path.display());
        songs.remove(0)
    }
}

/// Songs carried by events of one kind, in order.
pub fn songs_in<'e>(
    events: &'e [CollectionEvent],
    pick: impl Fn(&'e CollectionEvent) -> Option<&'e Vec<Song>>,
) -> Vec<&'e Song> {
    events.iter().filter_map(pick).flatten().collect()
}

pub fn new_or_updated(events: &[CollectionEvent]) -> Vec<&Song> {
    songs_in(events, |e| match e {
        CollectionEvent::NewOrUpdatedSongs(songs) => Some(songs),
        _ => None,
    })
}

pub fn touched(events: &[CollectionEvent]) -> Vec<&Song> {
    songs_in(events, |e| match e {
        CollectionEvent::SongsMTimeUpdated(songs) => Some(songs),
        _ => None,
    })
}

pub fn unavailable(events: &[CollectionEvent]) -> Vec<&Song> {
    songs_in(events, |e| match e {
        CollectionEvent::SongsUnavailable(songs) => Some(songs),
        _ => None,
    })
}

pub fn deleted(events: &[CollectionEvent]) -> Vec<&Song> {
    songs_in(events, |e| match e {
        CollectionEvent::SongsDeleted(songs) => Some(songs),
        _ => None,
    })
}

pub fn readded(events: &[CollectionEvent]) -> Vec<&Song> {
    songs_in(events, |e| match e {
        CollectionEvent::SongsReadded(songs) => Some(songs),
        _ => None,
    })
}

/// Short names of the events, for order assertions.
pub fn kinds(events: &[CollectionEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            CollectionEvent::ScanStarted(_) => "ScanStarted",
            CollectionEvent::NewOrUpdatedSongs(_) => "NewOrUpdatedSongs",
            CollectionEvent::SongsMTimeUpdated(_) => "SongsMTimeUpdated",
            CollectionEvent::SongsReadded(_) => "SongsReadded",
            CollectionEvent::SongsDeleted(_) => "SongsDeleted",
            CollectionEvent::SongsUnavailable(_) => "SongsUnavailable",
            CollectionEvent::SubdirsDiscovered(_) => "SubdirsDiscovered",
            CollectionEvent::SubdirsMTimeUpdated(_) => "SubdirsMTimeUpdated",
            CollectionEvent::UpdateLastSeen { .. } => "UpdateLastSeen",
            CollectionEvent::CompilationsNeedUpdating => "CompilationsNeedUpdating",
            CollectionEvent::ExitFinished => "ExitFinished",
        })
        .collect()
}
