//! Collection scanner: keeps the store in step with the music roots on disk.
//!
//! All scanning happens on one dedicated worker thread. The [`Scanner`]
//! handle only posts [`Command`]s to the worker's queue; results come back as
//! [`CollectionEvent`]s on a channel returned from [`Scanner::spawn`]. The
//! scanner never writes to the store itself.
//!
//! # Usage
//!
//! ```ignore
//! let (scanner, events) = Scanner::spawn(deps, |n| Ok(Box::new(NotifyWatcher::new(n)?) as _))?;
//! scanner.add_root(Root::new(1, "/music"), Vec::new())?;
//! for event in events {
//!     writer.apply(&event)?;
//! }
//! ```

pub mod art;
pub mod watcher;

mod reconcile;
mod transaction;
mod walker;
mod worker;

pub use art::{AlbumArt, ImageCrateDecoder, ImageDecoder};
pub use watcher::{ChangeNotifier, FsWatcher, NotifyWatcher, WatchError, WatchRegistry};

pub(crate) use worker::Worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::config::SettingsSource;
use crate::cue::CueParser;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprinter;
use crate::model::{Root, Song, Source, Subdir};
use crate::store::Store;
use crate::tags::TagReader;
use crate::tasks::TaskSink;

/// Everything the scanner tells its consumer.
///
/// Events of one transaction arrive in commit order: deletions or
/// unavailability first, then new/updated, touched and readded songs, then
/// subdirectory changes and finally [`CollectionEvent::UpdateLastSeen`].
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    /// A scan transaction started; carries its task id
    ScanStarted(u64),
    NewOrUpdatedSongs(Vec<Song>),
    /// Only the mtime changed
    SongsMTimeUpdated(Vec<Song>),
    /// Previously unavailable songs are back on disk
    SongsReadded(Vec<Song>),
    SongsDeleted(Vec<Song>),
    SongsUnavailable(Vec<Song>),
    SubdirsDiscovered(Vec<Subdir>),
    /// Includes tombstones (mtime 0) for vanished directories
    SubdirsMTimeUpdated(Vec<Subdir>),
    UpdateLastSeen { root_id: i64, expire_days: i64 },
    CompilationsNeedUpdating,
    ExitFinished,
}

/// Work items for the scanner thread.
#[derive(Debug)]
pub enum Command {
    /// Register a root. Empty `subdirs` means a brand-new root that gets a
    /// full recursive scan.
    AddRoot { root: Root, subdirs: Vec<Subdir> },
    RemoveRoot(i64),
    FullScan,
    IncrementalScan,
    RescanTracks(Vec<Song>),
    PauseRescans(bool),
    ReloadSettings,
    /// Posted by the file system watcher
    PathChanged(PathBuf),
    Exit,
}

/// Collaborators the scanner works with.
pub struct ScannerDeps {
    pub store: Arc<dyn Store>,
    pub tags: Arc<dyn TagReader>,
    pub cue: Arc<dyn CueParser>,
    /// `None` disables fingerprinting even when song tracking is on
    pub fingerprinter: Option<Arc<dyn Fingerprinter>>,
    pub images: Arc<dyn ImageDecoder>,
    pub tasks: Arc<dyn TaskSink>,
    pub settings: Box<dyn SettingsSource>,
    /// Origin recorded on every song the scanner produces
    pub source: Source,
}

/// Handle to the scanner thread.
///
/// Dropping the handle asks the worker to exit and waits for it.
pub struct Scanner {
    commands: Sender<Command>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Scanner {
    /// Start the worker thread.
    ///
    /// `make_watcher` receives the notifier the watch backend should post
    /// changes through.
    pub fn spawn<F>(deps: ScannerDeps, make_watcher: F) -> Result<(Self, Receiver<CollectionEvent>)>
    where
        F: FnOnce(ChangeNotifier) -> std::result::Result<Box<dyn FsWatcher>, WatchError>,
    {
        let (commands, command_rx) = unbounded();
        let (events_tx, events) = unbounded();

        let watcher = make_watcher(ChangeNotifier::new(commands.clone()))?;
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(deps, watcher, events_tx, Arc::clone(&stop));

        let thread = thread::Builder::new()
            .name("collection-scanner".to_string())
            .spawn(move || worker.run(command_rx))?;

        tracing::debug!(target: "scanner::worker", "Scanner thread started");
        Ok((
            Self {
                commands,
                stop,
                thread: Some(thread),
            },
            events,
        ))
    }

    fn post(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::WorkerGone)
    }

    pub fn add_root(&self, root: Root, subdirs: Vec<Subdir>) -> Result<()> {
        self.post(Command::AddRoot { root, subdirs })
    }

    pub fn remove_root(&self, root_id: i64) -> Result<()> {
        self.post(Command::RemoveRoot(root_id))
    }

    /// Rescan everything, ignoring stored mtimes.
    pub fn full_scan(&self) -> Result<()> {
        self.post(Command::FullScan)
    }

    /// Rescan directories whose mtime changed.
    pub fn incremental_scan(&self) -> Result<()> {
        self.post(Command::IncrementalScan)
    }

    /// Rescan the directories containing `songs`.
    pub fn rescan_tracks(&self, songs: Vec<Song>) -> Result<()> {
        self.post(Command::RescanTracks(songs))
    }

    pub fn pause_rescans(&self, paused: bool) -> Result<()> {
        self.post(Command::PauseRescans(paused))
    }

    pub fn reload_settings(&self) -> Result<()> {
        self.post(Command::ReloadSettings)
    }

    /// Abort the scan in progress. Queued commands still run.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop scanning and shut the worker down. The worker answers with
    /// [`CollectionEvent::ExitFinished`].
    pub fn exit(&self) -> Result<()> {
        self.stop();
        self.finish()
    }

    /// Shut the worker down once the commands already queued have run.
    pub fn finish(&self) -> Result<()> {
        self.post(Command::Exit)
    }

    /// Wait for the worker thread to finish.
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(target: "scanner::worker", "Scanner thread panicked");
            }
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Already exited when the queue is closed.
            let _ = self.exit();
            self.join_thread();
        }
    }
}
