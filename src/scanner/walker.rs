//! Directory traversal: one call per directory, recursing into new ones.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Result;
use crate::model::Subdir;
use crate::paths;

use super::art::AlbumArt;
use super::reconcile::{self, DirScan};
use super::transaction::ScanTransaction;

/// Immediate entries of `dir`, following symlinks.
///
/// A missing directory lists as empty. `None` means the directory exists
/// but could not be read.
fn list_dir(dir: &Path) -> Option<Vec<walkdir::DirEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(e) if e.depth() == 0 => {
                if dir.exists() {
                    tracing::warn!(target: "scanner::walker", path = %dir.display(), "Unreadable directory: {}", e);
                    return None;
                }
                return Some(Vec::new());
            }
            Err(e) => {
                tracing::debug!(target: "scanner::walker", path = %dir.display(), "Skipping entry: {}", e);
            }
        }
    }
    Some(entries)
}

/// A symlink whose target lies inside a collection root would be scanned
/// twice.
fn is_symlink_into_root(txn: &ScanTransaction<'_>, path: &Path) -> bool {
    let is_link = std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink());
    if !is_link {
        return false;
    }
    let roots = &txn.ctx().roots;
    // A root may itself be a symlink.
    if roots.values().any(|root| root.path == path) {
        return false;
    }
    let Ok(target) = std::fs::canonicalize(path) else {
        return false;
    };
    roots.values().any(|root| {
        target.starts_with(&root.path)
            || std::fs::canonicalize(&root.path).is_ok_and(|real| target.starts_with(real))
    })
}

/// Progress units for `path`: every listed entry counts once, plus the
/// entries of unseen, non-hidden subdirectories. Used only to size the
/// progress bar.
pub(crate) fn files_count_for_path(txn: &mut ScanTransaction<'_>, path: &Path) -> Result<u64> {
    if paths::has_opt_out_marker(path) {
        return Ok(0);
    }
    let Some(entries) = list_dir(path) else {
        return Ok(0);
    };

    let mut count = 0;
    for entry in entries {
        if txn.ctx().stop_requested() {
            break;
        }
        let child = entry.path();
        if entry.file_type().is_dir() {
            if paths::has_opt_out_marker(child) {
                continue;
            }
            count += 1;
            if entry.path_is_symlink() && is_symlink_into_root(txn, child) {
                continue;
            }
            if !paths::is_hidden(child) && !txn.has_seen_subdir(child)? {
                count += files_count_for_path(txn, child)?;
            }
        } else {
            count += 1;
        }
    }
    Ok(count)
}

/// Scan one directory: reconcile its media files with the store and recurse
/// into subdirectories seen for the first time.
///
/// `subdir` is the stored record for `path` (or a fresh one) and
/// `files_count` the progress it was budgeted. Forced scans bypass the
/// incremental mtime shortcut.
pub(crate) fn scan_subdirectory(
    txn: &mut ScanTransaction<'_>,
    path: &Path,
    subdir: &Subdir,
    files_count: u64,
    force_noincremental: bool,
) -> Result<()> {
    let ctx = txn.ctx();

    if is_symlink_into_root(txn, path) {
        tracing::debug!(target: "scanner::walker", path = %path.display(), "Skipping symlink into a root");
        return Ok(());
    }
    if paths::has_opt_out_marker(path) {
        tracing::debug!(target: "scanner::walker", path = %path.display(), "Skipping opted-out directory");
        return Ok(());
    }

    let missing_fingerprint = ctx.fingerprinting() && txn.has_songs_missing_fingerprint(path)?;

    let path_mtime = paths::mtime_secs(path);
    if !txn.ignores_mtime()
        && !force_noincremental
        && txn.is_incremental()
        && subdir.mtime == path_mtime
        && !missing_fingerprint
    {
        txn.add_progress(files_count);
        return Ok(());
    }

    tracing::debug!(target: "scanner::walker", path = %path.display(), "Scanning directory");

    // Known children that vanished still need their songs swept.
    for previous in txn.immediate_subdirs(path)? {
        if previous.path != path && !previous.path.exists() {
            scan_subdirectory(txn, &previous.path, &previous, 0, true)?;
        }
    }

    let Some(entries) = list_dir(path) else {
        return Ok(());
    };

    let mut scan = DirScan {
        art: AlbumArt::new(),
        cues_processed: HashSet::new(),
        files_on_disk: Vec::new(),
        songs_in_db: Vec::new(),
    };
    let mut found_subdirs: Vec<Subdir> = Vec::new();

    for entry in entries {
        if ctx.stop_requested() {
            return Ok(());
        }
        let child = entry.path();
        if entry.file_type().is_dir() {
            if !paths::is_hidden(child) && !txn.has_seen_subdir(child)? {
                found_subdirs.push(Subdir::discovered(child, paths::mtime_secs(child)));
            }
            txn.add_progress(1);
        } else if ctx.settings.image_extensions.is_image_file(child) {
            scan.art.add_candidate(child.to_path_buf());
            txn.add_progress(1);
        } else if ctx.tags.is_media_file(child) {
            scan.files_on_disk.push(child.to_path_buf());
        } else {
            txn.add_progress(1);
        }
    }

    if ctx.stop_requested() {
        return Ok(());
    }

    scan.songs_in_db = txn.find_songs_in_subdir(path)?;

    let files: Vec<PathBuf> = scan.files_on_disk.clone();
    for file in &files {
        if ctx.stop_requested() {
            return Ok(());
        }
        reconcile::reconcile_file(txn, &mut scan, path, file)?;
    }

    // Anything stored that was neither found nor moved is gone.
    for song in &scan.songs_in_db {
        if !song.unavailable
            && !scan.files_on_disk.contains(&song.path)
            && !txn.files_changed_path.contains(&song.path)
        {
            tracing::debug!(target: "scanner::walker", path = %song.path.display(), "Song deleted");
            txn.deleted_songs.push(song.clone());
        }
    }

    let updated = Subdir::new(txn.root_id(), path, paths::mtime_secs(path));
    if subdir.is_new() {
        txn.new_subdirs.push(updated.clone());
    } else {
        txn.touched_subdirs.push(updated.clone());
    }
    if updated.is_tombstone() {
        txn.deleted_subdirs.push(updated);
    }

    for found in found_subdirs {
        if ctx.stop_requested() {
            break;
        }
        scan_subdirectory(txn, &found.path, &found, 0, true)?;
    }

    Ok(())
}
