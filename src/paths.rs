//! Path helpers shared by the walker and the reconciler.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use unicode_normalization::UnicodeNormalization;

/// Cover-art extensions accepted regardless of what the decoder reports.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

/// Files whose presence excludes a directory from scanning.
pub const OPT_OUT_MARKERS: &[&str] = &[".nomedia", ".nomusic"];

/// Lowercased extension without the dot.
pub fn extension_part(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// `path` with its extension stripped.
fn no_extension_part(path: &Path) -> PathBuf {
    match path.file_stem() {
        Some(stem) => path.with_file_name(stem),
        None => path.to_path_buf(),
    }
}

/// The sibling CUE sheet a media file would be paired with.
pub fn matching_cue(path: &Path) -> PathBuf {
    let mut cue = no_extension_part(path).into_os_string();
    cue.push(".cue");
    PathBuf::from(cue)
}

/// Dot-prefixed file or directory name.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with('.'))
}

/// Compare two paths after Unicode canonical decomposition.
///
/// File systems disagree on composed vs decomposed names (HFS+ stores NFD),
/// so a CUE sheet's `FILE` reference can differ byte-wise from the name on
/// disk.
pub fn nfd_eq(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    let a = a.to_string_lossy();
    let b = b.to_string_lossy();
    a.nfd().eq(b.nfd())
}

/// Modification time in whole seconds, or 0 when the path is missing.
pub fn mtime_secs(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether `dir` contains an opt-out marker file.
pub fn has_opt_out_marker(dir: &Path) -> bool {
    OPT_OUT_MARKERS.iter().any(|m| dir.join(m).is_file())
}

/// The set of extensions treated as cover-art candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageExtensions(BTreeSet<String>);

impl Default for ImageExtensions {
    fn default() -> Self {
        Self(
            DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|e| (*e).to_string())
                .collect(),
        )
    }
}

impl ImageExtensions {
    /// Defaults plus every extension in `extra` (case-insensitive).
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for ext in extra {
            let ext = ext.as_ref().trim().trim_start_matches('.').to_lowercase();
            if !ext.is_empty() {
                set.0.insert(ext);
            }
        }
        set
    }

    pub fn is_image_extension(&self, ext: &str) -> bool {
        self.0.contains(&ext.to_lowercase())
    }

    pub fn is_image_file(&self, path: &Path) -> bool {
        self.is_image_extension(&extension_part(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_parts() {
        let p = Path::new("/music/Album/01 Track.FLAC");
        assert_eq!(extension_part(p), "flac");
        assert_eq!(no_extension_part(p), PathBuf::from("/music/Album/01 Track"));
        assert_eq!(matching_cue(p), PathBuf::from("/music/Album/01 Track.cue"));
    }

    #[test]
    fn test_no_extension() {
        let p = Path::new("/music/README");
        assert_eq!(extension_part(p), "");
        assert_eq!(no_extension_part(p), PathBuf::from("/music/README"));
        assert_eq!(matching_cue(p), PathBuf::from("/music/README.cue"));
    }

    #[test]
    fn test_hidden() {
        assert!(is_hidden(Path::new("/m/.cache")));
        assert!(!is_hidden(Path::new("/m/cache")));
        assert!(!is_hidden(Path::new("/")));
    }

    #[test]
    fn test_nfd_eq_composed_and_decomposed() {
        let composed = Path::new("/m/Beyonc\u{e9}.flac");
        let decomposed = Path::new("/m/Beyonce\u{301}.flac");
        assert_ne!(composed, decomposed);
        assert!(nfd_eq(composed, decomposed));
        assert!(!nfd_eq(composed, Path::new("/m/Beyonce.flac")));
    }

    #[test]
    fn test_image_extensions() {
        let exts = ImageExtensions::default();
        assert!(exts.is_image_extension("JPG"));
        assert!(exts.is_image_file(Path::new("/m/a/front.png")));
        assert!(!exts.is_image_file(Path::new("/m/a/front.webp")));

        let exts = ImageExtensions::with_extra([".WebP", " ", "bmp"]);
        assert!(exts.is_image_file(Path::new("/m/a/front.webp")));
        assert!(exts.is_image_extension("bmp"));
        assert!(!exts.is_image_extension(""));
    }

    #[test]
    fn test_mtime_and_markers() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(mtime_secs(&dir.path().join("missing")), 0);
        assert!(mtime_secs(dir.path()) > 0);

        assert!(!has_opt_out_marker(dir.path()));
        std::fs::write(dir.path().join(".nomusic"), "").unwrap();
        assert!(has_opt_out_marker(dir.path()));
    }

    #[test]
    fn test_marker_must_be_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".nomedia")).unwrap();
        assert!(!has_opt_out_marker(dir.path()));
    }

    proptest! {
        #[test]
        fn prop_stem_and_extension_rebuild_path(
            stem in "[a-zA-Z0-9 _-]{1,16}",
            ext in "[a-zA-Z0-9]{1,5}",
        ) {
            let path = PathBuf::from(format!("/root/dir/{stem}.{ext}"));
            prop_assert_eq!(extension_part(&path), ext.to_lowercase());
            prop_assert_eq!(
                no_extension_part(&path),
                PathBuf::from(format!("/root/dir/{stem}"))
            );
            prop_assert_eq!(path.parent(), Some(Path::new("/root/dir")));
        }

        #[test]
        fn prop_nfd_eq_is_reflexive(name in "\\PC{1,24}") {
            let path = PathBuf::from(format!("/m/{name}"));
            prop_assert!(nfd_eq(&path, &path));
        }

        #[test]
        fn prop_matching_cue_is_sibling(stem in "[a-z]{1,12}", ext in "(mp3|flac|ogg|wav)") {
            let media = PathBuf::from(format!("/m/a/{stem}.{ext}"));
            let cue = matching_cue(&media);
            prop_assert_eq!(cue.parent(), media.parent());
            prop_assert_eq!(extension_part(&cue), "cue");
        }
    }
}
