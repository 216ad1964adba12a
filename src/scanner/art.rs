//! Automatic album art selection.
//!
//! The walker collects image files per directory; when a song needs art the
//! candidates are narrowed by the configured filename filters and the
//! largest image wins.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use image::ImageFormat;

/// Reads image dimensions without decoding pixel data where possible.
pub trait ImageDecoder: Send + Sync {
    fn dimensions(&self, path: &Path) -> Option<(u32, u32)>;

    /// Extensions this decoder can read, lowercase without the dot.
    fn supported_extensions(&self) -> Vec<String> {
        Vec::new()
    }
}

/// [`ImageDecoder`] backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn dimensions(&self, path: &Path) -> Option<(u32, u32)> {
        match image::image_dimensions(path) {
            Ok(dims) => Some(dims),
            Err(e) => {
                tracing::debug!(target: "scanner::art", path = %path.display(), "Undecodable image: {}", e);
                None
            }
        }
    }

    fn supported_extensions(&self) -> Vec<String> {
        ImageFormat::all()
            .filter(|f| f.reading_enabled())
            .flat_map(|f| f.extensions_str().iter().map(|e| e.to_string()))
            .collect()
    }
}

/// Image candidates and cached choices for the directories of one scan.
#[derive(Debug, Default)]
pub struct AlbumArt {
    candidates: HashMap<PathBuf, Vec<PathBuf>>,
    chosen: HashMap<PathBuf, Option<PathBuf>>,
}

impl AlbumArt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&mut self, image: PathBuf) {
        let dir = image.parent().map(Path::to_path_buf).unwrap_or_default();
        self.candidates.entry(dir).or_default().push(image);
    }

    /// The image to use for songs in `dir`, chosen once per directory.
    pub fn choose(
        &mut self,
        dir: &Path,
        filters: &[String],
        decoder: &dyn ImageDecoder,
        stop: &AtomicBool,
    ) -> Option<PathBuf> {
        if let Some(chosen) = self.chosen.get(dir) {
            return chosen.clone();
        }
        let candidates = self.candidates.get(dir).map(Vec::as_slice).unwrap_or(&[]);
        let chosen = select_art(candidates, filters, decoder, stop);
        if !stop.load(Ordering::Relaxed) {
            self.chosen.insert(dir.to_path_buf(), chosen.clone());
        }
        chosen
    }
}

/// Pick one image out of `candidates`.
///
/// Keeps the candidates matching the first filter that matches anything
/// (falling back to all of them), then takes the largest by area. Ties go to
/// the earlier candidate.
pub fn select_art(
    candidates: &[PathBuf],
    filters: &[String],
    decoder: &dyn ImageDecoder,
    stop: &AtomicBool,
) -> Option<PathBuf> {
    let filtered = filter_candidates(candidates, filters);

    if filtered.len() <= 1 {
        return filtered.first().map(|p| (*p).clone());
    }

    let mut best: Option<(&PathBuf, u64)> = None;
    for candidate in filtered {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        let Some((w, h)) = decoder.dimensions(candidate) else {
            continue;
        };
        let area = u64::from(w) * u64::from(h);
        if best.is_none_or(|(_, best_area)| area > best_area) {
            best = Some((candidate, area));
        }
    }
    best.map(|(p, _)| p.clone())
}

fn filter_candidates<'a>(candidates: &'a [PathBuf], filters: &[String]) -> Vec<&'a PathBuf> {
    for filter in filters {
        let matched: Vec<&PathBuf> = candidates
            .iter()
            .filter(|p| {
                p.file_name()
                    .and_then(OsStr::to_str)
                    .is_some_and(|name| name.to_lowercase().contains(filter.as_str()))
            })
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    candidates.iter().collect()
}
