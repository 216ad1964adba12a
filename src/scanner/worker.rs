//! The scanner thread.
//!
//! Commands are handled strictly one at a time. Besides the command queue the
//! loop waits on two timers: the rescan debounce, restarted by every watcher
//! notification, and the daily incremental-scan check.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, after, never, select, tick};

use crate::config::{ScanSettings, SettingsSource};
use crate::cue::CueParser;
use crate::error::Result;
use crate::fingerprint::Fingerprinter;
use crate::model::{FINGERPRINT_NONE, Root, Song, Source, Subdir};
use crate::store::{SECONDS_PER_DAY, Store};
use crate::tags::TagReader;
use crate::tasks::TaskSink;

use super::art::ImageDecoder;
use super::transaction::ScanTransaction;
use super::walker;
use super::watcher::{FsWatcher, WatchRegistry};
use super::{CollectionEvent, Command, ScannerDeps};

/// Quiet period after the last change notification before rescanning.
pub(crate) const RESCAN_DELAY: Duration = Duration::from_secs(1);

/// How often to check whether the periodic incremental scan is due.
const PERIODIC_SCAN_INTERVAL: Duration = Duration::from_secs(SECONDS_PER_DAY as u64);

/// Read-only state a scan transaction works against.
pub(crate) struct ScanContext {
    pub store: Arc<dyn Store>,
    pub tags: Arc<dyn TagReader>,
    pub cue: Arc<dyn CueParser>,
    pub fingerprinter: Option<Arc<dyn Fingerprinter>>,
    pub images: Arc<dyn ImageDecoder>,
    pub tasks: Arc<dyn TaskSink>,
    pub source: Source,
    pub settings: ScanSettings,
    pub roots: BTreeMap<i64, Root>,
    pub stop: Arc<AtomicBool>,
    events: Sender<CollectionEvent>,
}

impl ScanContext {
    pub fn emit(&self, event: CollectionEvent) {
        // Nobody listening is not an error for the scanner.
        if self.events.send(event).is_err() {
            tracing::trace!(target: "scanner::worker", "Event receiver dropped");
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn fingerprinting(&self) -> bool {
        self.settings.song_tracking && self.fingerprinter.is_some()
    }

    /// `None` when fingerprinting is off. A failed computation is recorded
    /// as [`FINGERPRINT_NONE`] so it is not retried on every scan.
    pub fn fingerprint(&self, path: &Path) -> Option<String> {
        if !self.settings.song_tracking {
            return None;
        }
        let fingerprinter = self.fingerprinter.as_ref()?;
        let fingerprint = fingerprinter.fingerprint(path);
        if fingerprint.is_empty() {
            Some(FINGERPRINT_NONE.to_string())
        } else {
            Some(fingerprint)
        }
    }
}

pub(crate) struct Worker {
    ctx: ScanContext,
    settings_source: Box<dyn SettingsSource>,
    decoder_extensions: Vec<String>,
    watches: WatchRegistry,
    /// Changed paths per root, waiting for the debounce timer
    rescan_queue: BTreeMap<i64, Vec<PathBuf>>,
    song_rescan_queue: Vec<Song>,
    rescan_paused: bool,
    rescan_in_progress: bool,
    last_scan_time: i64,
    rescan_timer: Option<Receiver<Instant>>,
    periodic_timer: Option<Receiver<Instant>>,
}

impl Worker {
    pub fn new(
        deps: ScannerDeps,
        watcher: Box<dyn FsWatcher>,
        events: Sender<CollectionEvent>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let decoder_extensions = deps.images.supported_extensions();
        let settings = ScanSettings::from_config(&deps.settings.load(), &decoder_extensions);
        let periodic_timer = settings
            .mark_unavailable
            .then(|| tick(PERIODIC_SCAN_INTERVAL));

        Self {
            ctx: ScanContext {
                store: deps.store,
                tags: deps.tags,
                cue: deps.cue,
                fingerprinter: deps.fingerprinter,
                images: deps.images,
                tasks: deps.tasks,
                source: deps.source,
                settings,
                roots: BTreeMap::new(),
                stop,
                events,
            },
            settings_source: deps.settings,
            decoder_extensions,
            watches: WatchRegistry::new(watcher),
            rescan_queue: BTreeMap::new(),
            song_rescan_queue: Vec::new(),
            rescan_paused: false,
            rescan_in_progress: false,
            last_scan_time: 0,
            rescan_timer: None,
            periodic_timer,
        }
    }

    pub fn run(mut self, commands: Receiver<Command>) {
        loop {
            let rescan = self.rescan_timer.clone().unwrap_or_else(never);
            let periodic = self.periodic_timer.clone().unwrap_or_else(never);

            select! {
                recv(commands) -> command => match command {
                    Ok(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        self.exit();
                        break;
                    }
                },
                recv(rescan) -> _ => self.rescan_timer_fired(),
                recv(periodic) -> _ => self.periodic_scan_check(),
            }
        }
        tracing::debug!(target: "scanner::worker", "Scanner thread finished");
    }

    /// Handle one command. Returns `false` once the worker should exit.
    pub fn handle(&mut self, command: Command) -> bool {
        tracing::trace!(target: "scanner::worker", ?command, "Command");
        let result = match command {
            Command::AddRoot { root, subdirs } => self.add_root(root, subdirs),
            Command::RemoveRoot(root_id) => {
                self.remove_root(root_id);
                Ok(())
            }
            Command::FullScan => self.perform_scan(false, true),
            Command::IncrementalScan => self.perform_scan(true, false),
            Command::RescanTracks(songs) => {
                self.rescan_tracks(songs);
                Ok(())
            }
            Command::PauseRescans(paused) => {
                self.pause_rescans(paused);
                Ok(())
            }
            Command::ReloadSettings => {
                self.reload_settings();
                Ok(())
            }
            Command::PathChanged(path) => {
                self.path_changed(path);
                Ok(())
            }
            Command::Exit => {
                self.exit();
                return false;
            }
        };
        if let Err(e) = result {
            tracing::warn!(target: "scanner::worker", "Scan failed: {}", e);
        }
        true
    }

    fn add_root(&mut self, root: Root, subdirs: Vec<Subdir>) -> Result<()> {
        tracing::info!(target: "scanner::worker", root_id = root.id, path = %root.path.display(), "Adding root");
        self.ctx.roots.insert(root.id, root.clone());
        self.ctx.stop.store(false, Ordering::Relaxed);

        let result = self.register_root(&root, subdirs);
        // Listeners wait for this even when the scan failed part way.
        self.last_scan_time = chrono::Utc::now().timestamp();
        self.ctx.emit(CollectionEvent::CompilationsNeedUpdating);
        result
    }

    fn register_root(&mut self, root: &Root, subdirs: Vec<Subdir>) -> Result<()> {
        if subdirs.is_empty() {
            // Brand-new root: everything below it is unseen.
            let mut txn = ScanTransaction::new(&self.ctx, root.id, false, false);
            let count = walker::files_count_for_path(&mut txn, &root.path)?;
            txn.set_known_subdirs(Vec::new());
            txn.add_progress_max(count);
            walker::scan_subdirectory(
                &mut txn,
                &root.path,
                &Subdir::discovered(root.path.clone(), 0),
                count,
                false,
            )?;
            txn.commit(&mut self.watches);
        } else {
            let mut txn = ScanTransaction::new(&self.ctx, root.id, true, false);
            let counts = files_counts(&mut txn, &subdirs)?;
            txn.set_known_subdirs(subdirs.clone());
            txn.add_progress_max(counts.iter().sum());

            for (subdir, count) in subdirs.iter().zip(counts) {
                if self.ctx.stop_requested() {
                    break;
                }
                if self.ctx.settings.startup_scan {
                    walker::scan_subdirectory(&mut txn, &subdir.path, subdir, count, false)?;
                }
                if self.ctx.settings.monitor {
                    self.watches.add(&subdir.path, root.id);
                }
            }
            txn.commit(&mut self.watches);
        }
        Ok(())
    }

    fn remove_root(&mut self, root_id: i64) {
        tracing::info!(target: "scanner::worker", root_id, "Removing root");
        self.rescan_queue.remove(&root_id);
        self.ctx.roots.remove(&root_id);
        self.watches.remove_root(root_id);
    }

    fn perform_scan(&mut self, incremental: bool, ignore_mtime: bool) -> Result<()> {
        tracing::info!(target: "scanner::worker", incremental, ignore_mtime, "Scanning collection");
        self.ctx.stop.store(false, Ordering::Relaxed);

        let roots: Vec<Root> = self.ctx.roots.values().cloned().collect();
        for root in roots {
            if self.ctx.stop_requested() {
                break;
            }
            if let Err(e) = self.scan_root(&root, incremental, ignore_mtime) {
                tracing::warn!(target: "scanner::worker", root_id = root.id, "Scan failed: {}", e);
            }
        }

        self.last_scan_time = chrono::Utc::now().timestamp();
        self.ctx.emit(CollectionEvent::CompilationsNeedUpdating);
        Ok(())
    }

    fn scan_root(&mut self, root: &Root, incremental: bool, ignore_mtime: bool) -> Result<()> {
        let mut txn = ScanTransaction::new(&self.ctx, root.id, incremental, ignore_mtime);
        let mut subdirs = txn.all_subdirs()?;
        if subdirs.is_empty() {
            subdirs.push(Subdir::new(root.id, root.path.clone(), 0));
        }
        let counts = files_counts(&mut txn, &subdirs)?;
        txn.add_progress_max(counts.iter().sum());

        for (subdir, count) in subdirs.iter().zip(counts) {
            if self.ctx.stop_requested() {
                break;
            }
            walker::scan_subdirectory(&mut txn, &subdir.path, subdir, count, false)?;
        }
        txn.commit(&mut self.watches);
        Ok(())
    }

    fn path_changed(&mut self, path: PathBuf) {
        let Some(root_id) = self.watches.resolve(&path) else {
            tracing::trace!(target: "scanner::worker", path = %path.display(), "Change outside watched paths");
            return;
        };
        let queue = self.rescan_queue.entry(root_id).or_default();
        if !queue.contains(&path) {
            queue.push(path);
        }
        if !self.rescan_paused {
            self.rescan_timer = Some(after(RESCAN_DELAY));
        }
    }

    /// Debounce timer expired.
    pub fn rescan_timer_fired(&mut self) {
        self.rescan_timer = None;
        if !self.rescan_paused {
            self.rescan_paths_now();
        }
    }

    fn rescan_paths_now(&mut self) {
        let queue = std::mem::take(&mut self.rescan_queue);
        if queue.is_empty() {
            return;
        }
        self.ctx.stop.store(false, Ordering::Relaxed);

        for (root_id, paths) in queue {
            if self.ctx.stop_requested() {
                break;
            }
            if let Err(e) = self.rescan_root_paths(root_id, &paths) {
                tracing::warn!(target: "scanner::worker", root_id, "Rescan failed: {}", e);
            }
        }
        self.ctx.emit(CollectionEvent::CompilationsNeedUpdating);
    }

    fn rescan_root_paths(&mut self, root_id: i64, paths: &[PathBuf]) -> Result<()> {
        tracing::debug!(target: "scanner::worker", root_id, paths = paths.len(), "Rescanning changed paths");
        let mut txn = ScanTransaction::new(&self.ctx, root_id, false, false);

        let mut counts = Vec::with_capacity(paths.len());
        for path in paths {
            counts.push(walker::files_count_for_path(&mut txn, path)?);
        }
        txn.add_progress_max(counts.iter().sum());

        for (path, count) in paths.iter().zip(counts) {
            if self.ctx.stop_requested() {
                break;
            }
            let subdir = Subdir::new(root_id, path.clone(), 0);
            walker::scan_subdirectory(&mut txn, path, &subdir, count, false)?;
        }
        txn.commit(&mut self.watches);
        Ok(())
    }

    fn rescan_tracks(&mut self, songs: Vec<Song>) {
        self.song_rescan_queue.extend(songs);
        if self.rescan_in_progress {
            return;
        }
        self.rescan_in_progress = true;
        self.ctx.stop.store(false, Ordering::Relaxed);

        let mut scanned: HashSet<PathBuf> = HashSet::new();
        while !self.song_rescan_queue.is_empty() {
            if self.ctx.stop_requested() {
                break;
            }
            let song = self.song_rescan_queue.remove(0);
            let dir = song.directory().to_path_buf();
            if !scanned.insert(dir.clone()) {
                continue;
            }
            if let Err(e) = self.rescan_song_dir(song.root_id, &dir) {
                tracing::warn!(target: "scanner::worker", path = %dir.display(), "Rescan failed: {}", e);
            }
            self.ctx.emit(CollectionEvent::CompilationsNeedUpdating);
        }

        self.song_rescan_queue.clear();
        self.rescan_in_progress = false;
    }

    fn rescan_song_dir(&mut self, root_id: i64, dir: &Path) -> Result<()> {
        tracing::debug!(target: "scanner::worker", root_id, path = %dir.display(), "Rescanning song directory");
        let mut txn = ScanTransaction::new(&self.ctx, root_id, false, false);
        let count = walker::files_count_for_path(&mut txn, dir)?;
        let subdir = txn
            .all_subdirs()?
            .into_iter()
            .find(|subdir| subdir.path == dir)
            .unwrap_or_else(|| Subdir::discovered(dir, 0));
        txn.add_progress_max(count);
        walker::scan_subdirectory(&mut txn, dir, &subdir, count, false)?;
        txn.commit(&mut self.watches);
        Ok(())
    }

    fn pause_rescans(&mut self, paused: bool) {
        tracing::debug!(target: "scanner::worker", paused, "Rescans paused");
        self.rescan_paused = paused;
        if !paused && !self.rescan_queue.is_empty() {
            self.rescan_timer = None;
            self.rescan_paths_now();
        }
    }

    fn reload_settings(&mut self) {
        let was_monitoring = self.ctx.settings.monitor;
        self.ctx.settings =
            ScanSettings::from_config(&self.settings_source.load(), &self.decoder_extensions);
        tracing::debug!(target: "scanner::worker", monitor = self.ctx.settings.monitor, "Settings reloaded");

        match (was_monitoring, self.ctx.settings.monitor) {
            (true, false) => self.watches.clear(),
            (false, true) => {
                for root in self.ctx.roots.values() {
                    match self.ctx.store.subdirs_in_root(root.id) {
                        Ok(subdirs) => {
                            for subdir in subdirs {
                                self.watches.add(&subdir.path, root.id);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(target: "scanner::worker", root_id = root.id, "Cannot restore watches: {}", e);
                        }
                    }
                }
            }
            _ => {}
        }

        if !self.ctx.settings.mark_unavailable {
            self.periodic_timer = None;
        } else if self.periodic_timer.is_none() {
            self.periodic_timer = Some(tick(PERIODIC_SCAN_INTERVAL));
        }
    }

    fn periodic_scan_check(&mut self) {
        self.periodic_scan_check_at(chrono::Utc::now().timestamp());
    }

    /// Rescan incrementally if nothing was scanned during the day before `now`.
    pub fn periodic_scan_check_at(&mut self, now: i64) {
        if now.saturating_sub(self.last_scan_time) >= SECONDS_PER_DAY {
            tracing::info!(target: "scanner::worker", "Periodic incremental scan");
            if let Err(e) = self.perform_scan(true, false) {
                tracing::warn!(target: "scanner::worker", "Scan failed: {}", e);
            }
        }
    }

    fn exit(&mut self) {
        tracing::info!(target: "scanner::worker", "Scanner exiting");
        self.ctx.stop.store(true, Ordering::Relaxed);
        self.ctx.store.close();
        self.ctx.emit(CollectionEvent::ExitFinished);
    }

    pub fn rescan_timer_armed(&self) -> bool {
        self.rescan_timer.is_some()
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.watches
    }
}

fn files_counts(txn: &mut ScanTransaction<'_>, subdirs: &[Subdir]) -> Result<Vec<u64>> {
    subdirs
        .iter()
        .map(|subdir| walker::files_count_for_path(txn, &subdir.path))
        .collect()
}
