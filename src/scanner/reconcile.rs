//! Matching media files on disk against stored songs.
//!
//! Each file ends up in exactly one of the transaction's buckets: new or
//! updated, mtime-only, readded, or (for stale CUE sections) deleted.
//! Stored ids and user-set data always survive an update.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{FINGERPRINT_NONE, Song};
use crate::paths;

use super::art::AlbumArt;
use super::transaction::ScanTransaction;

/// Per-directory state shared by the files of one directory.
pub(crate) struct DirScan {
    pub art: AlbumArt,
    /// CUE sheets that already produced songs in this directory
    pub cues_processed: HashSet<PathBuf>,
    pub files_on_disk: Vec<PathBuf>,
    pub songs_in_db: Vec<Song>,
}

impl DirScan {
    fn image_for(&mut self, txn: &ScanTransaction<'_>, dir: &Path) -> Option<PathBuf> {
        let ctx = txn.ctx();
        self.art
            .choose(dir, &ctx.settings.cover_filters, &*ctx.images, &ctx.stop)
    }

    fn vanished(&mut self, file: &Path) {
        self.files_on_disk.retain(|f| f != file);
    }
}

/// How a stored song relates to its CUE sheet right now.
struct CueState {
    /// 0 when the song has no CUE sheet or it is gone
    stored_mtime: i64,
    deleted: bool,
    added: bool,
}

impl CueState {
    fn of(stored: &Song, matching_cue: &Path) -> Self {
        let stored_mtime = stored.cue_path.as_deref().map_or(0, paths::mtime_secs);
        Self {
            stored_mtime,
            deleted: stored_mtime == 0 && stored.has_cue(),
            added: paths::mtime_secs(matching_cue) != 0 && !stored.has_cue(),
        }
    }
}

/// Reconcile one media file of `dir` with the store.
pub(crate) fn reconcile_file(
    txn: &mut ScanTransaction<'_>,
    scan: &mut DirScan,
    dir: &Path,
    file: &Path,
) -> Result<()> {
    let ctx = txn.ctx();
    let matching_cue = paths::matching_cue(file);

    if let Some(stored) = find_song_by_path(&scan.songs_in_db, file).cloned() {
        let file_mtime = paths::mtime_secs(file);
        if file_mtime == 0 {
            // Gone since the listing; the deletion sweep picks it up.
            scan.vanished(file);
            txn.add_progress(1);
            return Ok(());
        }

        let cue = CueState::of(&stored, &matching_cue);
        let mut changed =
            stored.mtime != file_mtime.max(cue.stored_mtime) || cue.deleted || cue.added;

        let image = scan.image_for(txn, dir);
        let art_missing = match stored.art_automatic.as_deref() {
            None => image.is_some(),
            Some(art) => !art.exists() && !stored.embedded_cover,
        };
        if art_missing {
            changed = true;
        }

        let missing_fingerprint = ctx.fingerprinting() && stored.fingerprint.is_empty();

        if txn.ignores_mtime() || changed || missing_fingerprint {
            tracing::debug!(target: "scanner::reconcile", path = %file.display(), changed, "Rescanning file");
            let fingerprint = ctx.fingerprint(file);
            update_existing(txn, file, dir, &stored, fingerprint, &matching_cue, &cue, image)?;
        }

        if stored.unavailable {
            tracing::debug!(target: "scanner::reconcile", path = %file.display(), "Song readded");
            txn.readded_songs.push(stored);
        }
    } else {
        let fingerprint = ctx.fingerprint(file);
        let moved = match fingerprint.as_deref() {
            Some(fp) if !fp.is_empty() && fp != FINGERPRINT_NONE => {
                find_song_by_fingerprint(txn, file, fp)?
            }
            _ => None,
        };

        if let Some(stored) = moved {
            tracing::info!(
                target: "scanner::reconcile",
                from = %stored.path.display(),
                to = %file.display(),
                "Song moved"
            );
            txn.files_changed_path.insert(stored.path.clone());
            txn.deleted_songs.retain(|s| s.id != stored.id);

            let cue = CueState::of(&stored, &matching_cue);
            let image = scan.image_for(txn, dir);
            update_existing(txn, file, dir, &stored, fingerprint, &matching_cue, &cue, image)?;

            if stored.unavailable {
                txn.readded_songs.push(stored);
            }
        } else {
            let songs = scan_new_file(
                txn,
                file,
                dir,
                fingerprint.unwrap_or_default(),
                &matching_cue,
                &mut scan.cues_processed,
            );
            if !songs.is_empty() {
                let image = scan.image_for(txn, dir);
                for mut song in songs {
                    if song.art_automatic.is_none() {
                        song.art_automatic = image.clone();
                    }
                    tracing::debug!(target: "scanner::reconcile", path = %file.display(), "New song");
                    txn.new_songs.push(song);
                }
            }
        }
    }

    txn.add_progress(1);
    Ok(())
}

/// The stored song for `path`, preferring an available record when an
/// unavailable duplicate exists.
fn find_song_by_path<'s>(songs: &'s [Song], path: &Path) -> Option<&'s Song> {
    songs
        .iter()
        .filter(|song| song.path == path)
        .min_by_key(|song| song.unavailable)
}

/// A stored song with the same fingerprint that `file` could be a move of.
///
/// Accepts a record already at `file`, or a single missing original path.
/// Several missing originals are ambiguous and the file counts as new.
fn find_song_by_fingerprint(
    txn: &ScanTransaction<'_>,
    file: &Path,
    fingerprint: &str,
) -> Result<Option<Song>> {
    let candidates = txn.ctx().store.songs_by_fingerprint(fingerprint)?;

    if let Some(song) = candidates.iter().find(|song| song.path == file) {
        return Ok(Some(song.clone()));
    }

    let missing: Vec<&Song> = candidates
        .iter()
        .filter(|song| !song.path.exists())
        .collect();
    let missing_paths: HashSet<&Path> = missing.iter().map(|song| song.path.as_path()).collect();

    match missing_paths.len() {
        0 => Ok(None),
        1 => Ok(missing.first().map(|song| (*song).clone())),
        n => {
            tracing::debug!(
                target: "scanner::reconcile",
                path = %file.display(),
                candidates = n,
                "Ambiguous fingerprint match, treating as new"
            );
            Ok(None)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn update_existing(
    txn: &mut ScanTransaction<'_>,
    file: &Path,
    dir: &Path,
    stored: &Song,
    fingerprint: Option<String>,
    matching_cue: &Path,
    cue: &CueState,
    image: Option<PathBuf>,
) -> Result<()> {
    if !cue.deleted && (stored.has_cue() || cue.added) {
        update_cue_sections(txn, file, dir, stored, fingerprint, matching_cue, image)
    } else {
        update_plain_file(txn, file, stored, fingerprint, cue.deleted, image)
    }
}

/// Re-read a CUE-associated file, matching sections by start offset.
fn update_cue_sections(
    txn: &mut ScanTransaction<'_>,
    file: &Path,
    dir: &Path,
    stored: &Song,
    fingerprint: Option<String>,
    matching_cue: &Path,
    image: Option<PathBuf>,
) -> Result<()> {
    let ctx = txn.ctx();
    let Some(text) = read_cue(matching_cue) else {
        return Ok(());
    };

    let old_sections = ctx.store.songs_by_path(&stored.path)?;
    let by_beginning: HashMap<i64, &Song> = old_sections
        .iter()
        .filter(|song| song.has_cue())
        .map(|song| (song.beginning_nanosec, song))
        .collect();
    let mut used: HashSet<Option<i64>> = HashSet::new();

    for mut section in ctx.cue.parse(&text, matching_cue, dir) {
        if !paths::nfd_eq(&section.path, file) {
            continue;
        }
        section.source = ctx.source;
        section.root_id = txn.root_id();

        match by_beginning.get(&section.beginning_nanosec) {
            Some(old) => {
                section.fingerprint = fingerprint.clone().unwrap_or_else(|| old.fingerprint.clone());
                preserve_user_data(old, image.clone(), &mut section);
                used.insert(old.id);
                update_song(txn, file, old, section);
            }
            None => {
                section.fingerprint = fingerprint.clone().unwrap_or_default();
                if section.art_automatic.is_none() {
                    section.art_automatic = image.clone();
                }
                tracing::debug!(target: "scanner::reconcile", path = %file.display(), beginning = section.beginning_nanosec, "New CUE section");
                txn.new_songs.push(section);
            }
        }
    }

    for old in old_sections {
        if !used.contains(&old.id) {
            tracing::debug!(target: "scanner::reconcile", path = %old.path.display(), beginning = old.beginning_nanosec, "Stale section");
            txn.deleted_songs.push(old);
        }
    }
    Ok(())
}

/// Re-read a file that is not (or no longer) split by a CUE sheet.
fn update_plain_file(
    txn: &mut ScanTransaction<'_>,
    file: &Path,
    stored: &Song,
    fingerprint: Option<String>,
    cue_deleted: bool,
    image: Option<PathBuf>,
) -> Result<()> {
    let ctx = txn.ctx();

    // Only one record survives the CUE sheet going away.
    if cue_deleted {
        for section in ctx.store.songs_by_path(&stored.path)? {
            if !section.metadata_equal(stored) {
                txn.deleted_songs.push(section);
            }
        }
    }

    let Some(mut on_disk) = ctx.tags.read_file(file) else {
        tracing::debug!(target: "scanner::reconcile", path = %file.display(), "Unreadable tags, keeping stored song");
        return Ok(());
    };
    on_disk.source = ctx.source;
    on_disk.root_id = txn.root_id();
    on_disk.fingerprint = fingerprint.unwrap_or_else(|| stored.fingerprint.clone());

    preserve_user_data(stored, image, &mut on_disk);
    update_song(txn, file, stored, on_disk);
    Ok(())
}

/// Carry identity, automatic art and user-set fields over to `updated`.
fn preserve_user_data(stored: &Song, image: Option<PathBuf>, updated: &mut Song) {
    updated.id = stored.id;
    if !updated.embedded_cover {
        updated.art_automatic = image;
    }
    updated.merge_user_set_data(stored);
}

/// File the re-read `on_disk` record under new/updated or mtime-only.
fn update_song(txn: &mut ScanTransaction<'_>, file: &Path, stored: &Song, on_disk: Song) {
    let reason = if !stored.metadata_equal(&on_disk) {
        Some("metadata changed")
    } else if stored.fingerprint != on_disk.fingerprint {
        Some("fingerprint changed")
    } else if stored.art_automatic != on_disk.art_automatic || stored.art_manual != on_disk.art_manual {
        Some("art changed")
    } else if stored.unavailable {
        Some("song readded")
    } else {
        None
    };

    match reason {
        Some(reason) => {
            tracing::debug!(target: "scanner::reconcile", path = %file.display(), reason, "Song updated");
            txn.new_songs.push(on_disk);
        }
        None => txn.touched_songs.push(on_disk),
    }
}

/// Songs for a file the store has never seen.
fn scan_new_file(
    txn: &ScanTransaction<'_>,
    file: &Path,
    dir: &Path,
    fingerprint: String,
    matching_cue: &Path,
    cues_processed: &mut HashSet<PathBuf>,
) -> Vec<Song> {
    let ctx = txn.ctx();

    if paths::mtime_secs(matching_cue) != 0 {
        if cues_processed.contains(matching_cue) {
            return Vec::new();
        }
        let Some(text) = read_cue(matching_cue) else {
            return Vec::new();
        };
        if !ctx.tags.is_media_file(file) {
            return Vec::new();
        }

        let sections: Vec<Song> = ctx
            .cue
            .parse(&text, matching_cue, dir)
            .into_iter()
            .filter(|section| paths::nfd_eq(&section.path, file))
            .map(|mut section| {
                section.source = ctx.source;
                section.root_id = txn.root_id();
                section.fingerprint = fingerprint.clone();
                section
            })
            .collect();
        if !sections.is_empty() {
            cues_processed.insert(matching_cue.to_path_buf());
        }
        return sections;
    }

    match ctx.tags.read_file(file) {
        Some(mut song) => {
            song.source = ctx.source;
            song.root_id = txn.root_id();
            song.fingerprint = fingerprint;
            vec![song]
        }
        None => {
            tracing::debug!(target: "scanner::reconcile", path = %file.display(), "Not a readable media file");
            Vec::new()
        }
    }
}

fn read_cue(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Some(text.trim_start_matches('\u{feff}').to_string())
        }
        Err(e) => {
            tracing::warn!(target: "scanner::reconcile", path = %path.display(), "Cannot read CUE sheet: {}", e);
            None
        }
    }
}
