//! CLI command definitions and dispatch.
//!
//! Each subcommand is implemented in a submodule:
//! - `scan`: one-shot scans, watching and listing the collection

mod scan;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::{CollectionConfig, ConfigFile, SettingsSource};
use crate::cue::CueSheetParser;
use crate::db::SqliteStore;
use crate::fingerprint::{Fingerprinter, FpcalcFingerprinter};
use crate::model::{Root, Source};
use crate::scanner::{ChangeNotifier, FsWatcher, ImageCrateDecoder, NotifyWatcher, ScannerDeps, WatchError};
use crate::tags::{LoftyTagReader, TagReader};
use crate::tasks::TaskManager;

pub use scan::{cmd_list, cmd_scan, cmd_watch};

/// Collection Watcher CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: config.toml in the OS config directory)
    #[arg(long, global = true, env = "COLLECTION_WATCHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path (overrides `[database] path` from the config)
    #[arg(long, global = true, env = "COLLECTION_WATCHER_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Scan collection roots and update the database
    Scan {
        /// Root directories (default: `collection.paths` from the config)
        paths: Vec<PathBuf>,
        /// Re-read every file, ignoring stored modification times
        #[arg(long)]
        full: bool,
    },
    /// Scan collection roots, then follow file changes until Ctrl+C
    Watch {
        /// Root directories (default: `collection.paths` from the config)
        paths: Vec<PathBuf>,
        /// Print every song change as it is stored
        #[arg(short, long)]
        verbose: bool,
    },
    /// List all songs in the database
    List {
        /// Include songs whose files are currently unavailable
        #[arg(long)]
        all: bool,
    },
}

/// Run the specified CLI command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let settings = match &cli.config {
        Some(path) => ConfigFile::at(path),
        None => ConfigFile::default(),
    };
    let config = settings.load_config();
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| config.database.resolved_path());

    match &cli.command {
        Commands::Scan { paths, full } => cmd_scan(&config.collection, &db_path, paths, *full),
        Commands::Watch { paths, verbose } => cmd_watch(settings, &db_path, paths, *verbose),
        Commands::List { all } => cmd_list(&db_path, *all),
    }
}

// ============================================================================
// Shared helper functions
// ============================================================================

pub(crate) fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    tracing::debug!(target: "cli", db = %path.display(), "Database connected");
    Ok(store)
}

/// Register the roots to scan: `paths` if given, the configured ones otherwise.
pub(crate) fn resolve_roots(
    store: &SqliteStore,
    paths: &[PathBuf],
    config: &CollectionConfig,
) -> anyhow::Result<Vec<Root>> {
    let paths = if paths.is_empty() {
        config.paths.as_slice()
    } else {
        paths
    };
    if paths.is_empty() {
        anyhow::bail!("No collection paths given and none configured in [collection] paths");
    }

    paths
        .iter()
        .map(|path| -> anyhow::Result<Root> {
            let path = path
                .canonicalize()
                .with_context(|| format!("Cannot access {}", path.display()))?;
            if !path.is_dir() {
                anyhow::bail!("{} is not a directory", path.display());
            }
            Ok(store.root(&path)?)
        })
        .collect()
}

/// Production collaborators for the scanner thread.
pub(crate) fn scanner_deps(
    store: Arc<SqliteStore>,
    settings: Box<dyn SettingsSource>,
    song_tracking: bool,
) -> ScannerDeps {
    let tags: Arc<dyn TagReader> = Arc::new(LoftyTagReader);
    let fingerprinter = FpcalcFingerprinter::detect().map(|f| Arc::new(f) as Arc<dyn Fingerprinter>);
    if song_tracking && fingerprinter.is_none() {
        print_fpcalc_install_instructions();
    }

    ScannerDeps {
        store,
        cue: Arc::new(CueSheetParser::new(Arc::clone(&tags))),
        tags,
        fingerprinter,
        images: Arc::new(ImageCrateDecoder),
        tasks: Arc::new(TaskManager::new()),
        settings,
        source: Source::Local,
    }
}

pub(crate) fn notify_watcher(notifier: ChangeNotifier) -> Result<Box<dyn FsWatcher>, WatchError> {
    Ok(Box::new(NotifyWatcher::new(notifier)?))
}

/// Print installation instructions for fpcalc
fn print_fpcalc_install_instructions() {
    eprintln!("Warning: song tracking is enabled but fpcalc was not found.");
    eprintln!("Moved files will be re-added as new songs. Install Chromaprint:");
    eprintln!("  Windows: winget install AcoustID.Chromaprint");
    eprintln!("  macOS:   brew install chromaprint");
    eprintln!("  Linux:   apt install libchromaprint-tools");
}
