//! Collection scanning, watching and listing commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use super::{notify_watcher, open_store, resolve_roots, scanner_deps};
use crate::config::{CollectionConfig, ConfigFile};
use crate::db::SqliteStore;
use crate::model::Song;
use crate::scanner::{CollectionEvent, Scanner};
use crate::store::{Store, StoreWriter};

/// Totals over the events of one command run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ScanSummary {
    new_or_updated: usize,
    unchanged: usize,
    readded: usize,
    unavailable: usize,
    deleted: usize,
    directories: usize,
    errors: usize,
}

impl ScanSummary {
    fn record(&mut self, event: &CollectionEvent) {
        match event {
            CollectionEvent::NewOrUpdatedSongs(songs) => self.new_or_updated += songs.len(),
            CollectionEvent::SongsMTimeUpdated(songs) => self.unchanged += songs.len(),
            CollectionEvent::SongsReadded(songs) => self.readded += songs.len(),
            CollectionEvent::SongsUnavailable(songs) => self.unavailable += songs.len(),
            CollectionEvent::SongsDeleted(songs) => self.deleted += songs.len(),
            CollectionEvent::SubdirsDiscovered(subdirs) => self.directories += subdirs.len(),
            _ => {}
        }
    }

    fn print(&self) {
        println!(
            "{} new or updated, {} unchanged, {} re-added, {} unavailable, {} deleted, {} new directories",
            self.new_or_updated,
            self.unchanged,
            self.readded,
            self.unavailable,
            self.deleted,
            self.directories
        );
        if self.errors > 0 {
            eprintln!("{} updates could not be stored, see the log", self.errors);
        }
    }
}

/// Store one event and account for it.
fn apply(store: &SqliteStore, event: &CollectionEvent, summary: &mut ScanSummary, verbose: bool) {
    summary.record(event);
    if verbose {
        print_changes(event);
    }
    if let Err(e) = store.apply(event) {
        summary.errors += 1;
        warn!(target: "cli", error = %e, "Failed to store scanner update");
    }
}

fn print_changes(event: &CollectionEvent) {
    let (mark, songs): (&str, &[Song]) = match event {
        CollectionEvent::NewOrUpdatedSongs(songs) => ("+", songs),
        CollectionEvent::SongsReadded(songs) => ("^", songs),
        CollectionEvent::SongsUnavailable(songs) => ("?", songs),
        CollectionEvent::SongsDeleted(songs) => ("-", songs),
        _ => return,
    };
    for song in songs {
        println!("{} {}", mark, describe(song));
    }
}

fn describe(song: &Song) -> String {
    let name = match (song.artist.is_empty(), song.title.is_empty()) {
        (false, false) => format!("{} - {}", song.artist, song.title),
        (true, false) => song.title.clone(),
        _ => song
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    match &song.cue_path {
        Some(cue) => format!("{} [{}]", name, cue.display()),
        None => format!("{} ({})", name, song.path.display()),
    }
}

/// Apply events until the worker reports it has exited.
fn drain(store: &SqliteStore, events: &Receiver<CollectionEvent>, summary: &mut ScanSummary, verbose: bool) {
    for event in events.iter() {
        let finished = matches!(event, CollectionEvent::ExitFinished);
        apply(store, &event, summary, verbose);
        if finished {
            break;
        }
    }
}

/// Apply events until `scans` root registrations have finished.
/// Returns `false` if the worker went away first.
fn apply_until_scanned(
    store: &SqliteStore,
    events: &Receiver<CollectionEvent>,
    summary: &mut ScanSummary,
    mut scans: usize,
) -> bool {
    while scans > 0 {
        let Ok(event) = events.recv() else {
            return false;
        };
        apply(store, &event, summary, false);
        match event {
            CollectionEvent::CompilationsNeedUpdating => scans -= 1,
            CollectionEvent::ExitFinished => return false,
            _ => {}
        }
    }
    true
}

/// Scan collection roots once and store the result.
pub fn cmd_scan(
    config: &CollectionConfig,
    db_path: &Path,
    paths: &[PathBuf],
    full: bool,
) -> anyhow::Result<()> {
    let writer = open_store(db_path)?;
    let roots = resolve_roots(&writer, paths, config)?;

    // Known roots are only registered when a full scan follows.
    let settings = CollectionConfig {
        monitor: false,
        startup_scan: !full,
        ..config.clone()
    };
    // The worker closes its store on exit, so it gets a connection of its own.
    let reader = Arc::new(open_store(db_path)?);
    let deps = scanner_deps(reader, Box::new(settings), config.song_tracking);
    let (scanner, events) = Scanner::spawn(deps, notify_watcher)?;

    let mut known_roots = false;
    for root in &roots {
        println!("Scanning {}", root.path.display());
        let subdirs = writer.subdirs_in_root(root.id)?;
        known_roots |= !subdirs.is_empty();
        scanner.add_root(root.clone(), subdirs)?;
    }

    // New roots were read in full while being added. A full scan of known
    // ones must see those rows stored, or it would add them a second time.
    let mut summary = ScanSummary::default();
    let mut running = true;
    if full && known_roots {
        running = apply_until_scanned(&writer, &events, &mut summary, roots.len());
        if running {
            scanner.full_scan()?;
        }
    }
    if running {
        scanner.finish()?;
        drain(&writer, &events, &mut summary, false);
    }
    scanner.join();

    println!("Scan complete.");
    summary.print();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Reload,
}

/// Forward Ctrl+C (and SIGHUP on Unix) from a small tokio runtime.
fn signal_channel() -> anyhow::Result<Receiver<Signal>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || runtime.block_on(forward_signals(tx)))?;
    Ok(rx)
}

#[cfg(unix)]
async fn forward_signals(tx: Sender<Signal>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(target: "cli", "Cannot listen for SIGHUP: {}", e);
            return forward_interrupt(tx).await;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(()) = hangup.recv() => {
                if tx.send(Signal::Reload).is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.send(Signal::Interrupt);
}

#[cfg(not(unix))]
async fn forward_signals(tx: Sender<Signal>) {
    forward_interrupt(tx).await
}

async fn forward_interrupt(tx: Sender<Signal>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "cli", "Cannot listen for Ctrl+C: {}", e);
        // Keep the channel open so the watch loop is not torn down.
        std::future::pending::<()>().await;
    }
    let _ = tx.send(Signal::Interrupt);
}

/// Scan collection roots, then keep the database in step with the disk
/// until interrupted.
pub fn cmd_watch(
    settings: ConfigFile,
    db_path: &Path,
    paths: &[PathBuf],
    verbose: bool,
) -> anyhow::Result<()> {
    let config = settings.load_config().collection;
    let writer = open_store(db_path)?;
    let roots = resolve_roots(&writer, paths, &config)?;

    let reader = Arc::new(open_store(db_path)?);
    let deps = scanner_deps(reader, Box::new(settings), config.song_tracking);
    let (scanner, events) = Scanner::spawn(deps, notify_watcher)?;
    let signals = signal_channel()?;

    for root in &roots {
        scanner.add_root(root.clone(), writer.subdirs_in_root(root.id)?)?;
    }
    println!("Watching {} root(s) for changes.", roots.len());
    println!("Press Ctrl+C to stop.\n");

    let mut summary = ScanSummary::default();
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => apply(&writer, &event, &mut summary, verbose),
                Err(_) => {
                    warn!(target: "cli", "Scanner stopped unexpectedly");
                    break;
                }
            },
            recv(signals) -> signal => match signal {
                Ok(Signal::Reload) => {
                    info!(target: "cli", "Reloading settings");
                    scanner.reload_settings()?;
                }
                Ok(Signal::Interrupt) | Err(_) => break,
            },
        }
    }

    info!(target: "cli", "Shutting down");
    if scanner.exit().is_ok() {
        drain(&writer, &events, &mut summary, verbose);
    }
    scanner.join();

    summary.print();
    Ok(())
}

/// List stored songs.
pub fn cmd_list(db_path: &Path, all: bool) -> anyhow::Result<()> {
    let store = open_store(db_path)?;
    let songs = store.all_songs()?;
    let mut shown = 0;
    for song in songs.iter().filter(|s| all || !s.unavailable) {
        if song.unavailable {
            println!("{} (unavailable)", describe(song));
        } else {
            println!("{}", describe(song));
        }
        shown += 1;
    }
    println!("{} songs", shown);
    Ok(())
}
